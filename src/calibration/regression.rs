//! Ordinary least-squares fitting of sensor readings against a reference
//!
//! Diagnostics follow the usual linear-regression conventions: Pearson
//! correlation, two-sided p-value for a zero slope (Student t with n-2
//! degrees of freedom) and the standard error of the slope.

use crate::error::CalibrationError;
use crate::types::PhysicalReading;

use super::{CalibrationParams, SensorCalibration};

/// Keeps `1 - r` away from zero for perfect fits
const TINY: f64 = 1.0e-20;

/// Fit `reference = slope * measured + intercept` over (measured, reference) pairs.
///
/// Needs at least two distinct measured values.
pub fn fit(pairs: &[(f64, f64)]) -> Result<CalibrationParams, CalibrationError> {
    let n = pairs.len();
    if n < 2 {
        return Err(CalibrationError::TooFewSamples(n));
    }
    if pairs.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(CalibrationError::NonFinite);
    }

    let count = n as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / count;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / count;

    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx == 0.0 {
        return Err(CalibrationError::DegenerateInput);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let correlation = if syy == 0.0 {
        0.0
    } else {
        (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
    };

    let (p_value, std_err) = if n == 2 {
        // Two points always lie on the line
        (if syy == 0.0 { 1.0 } else { 0.0 }, 0.0)
    } else {
        let df = count - 2.0;
        let t = correlation * (df / ((1.0 - correlation + TINY) * (1.0 + correlation + TINY))).sqrt();
        let p = regularized_incomplete_beta(0.5 * df, 0.5, df / (df + t * t));
        let se = ((1.0 - correlation * correlation) * syy / sxx / df).sqrt();
        (p, se)
    };

    Ok(CalibrationParams {
        slope,
        intercept,
        correlation: Some(correlation),
        p_value: Some(p_value),
        std_err: Some(std_err),
    })
}

/// Fit two equal-length series sample by sample
pub fn fit_series(measured: &[f64], reference: &[f64]) -> Result<CalibrationParams, CalibrationError> {
    check_lengths(measured.len(), reference.len())?;
    let pairs: Vec<(f64, f64)> = measured.iter().copied().zip(reference.iter().copied()).collect();
    fit(&pairs)
}

/// Fit temperature and humidity of one sensor against time-aligned reference readings
pub fn fit_sensor(
    measured: &[PhysicalReading],
    reference: &[PhysicalReading],
) -> Result<SensorCalibration, CalibrationError> {
    check_lengths(measured.len(), reference.len())?;
    let temperature: Vec<(f64, f64)> = measured
        .iter()
        .zip(reference)
        .map(|(m, r)| (m.temperature_c, r.temperature_c))
        .collect();
    let humidity: Vec<(f64, f64)> = measured
        .iter()
        .zip(reference)
        .map(|(m, r)| (m.humidity_pct, r.humidity_pct))
        .collect();

    Ok(SensorCalibration {
        temperature: fit(&temperature)?,
        humidity: fit(&humidity)?,
    })
}

fn check_lengths(measured: usize, reference: usize) -> Result<(), CalibrationError> {
    if measured != reference {
        return Err(CalibrationError::MismatchedSeries {
            measured,
            reference,
        });
    }
    Ok(())
}

/// Natural log of the gamma function (Lanczos, g = 7)
fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin().abs()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let t = x + G + 0.5;
    let series = COEFFICIENTS[1..]
        .iter()
        .enumerate()
        .fold(COEFFICIENTS[0], |acc, (i, c)| acc + c / (x + (i + 1) as f64));
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

/// Regularized incomplete beta function I_x(a, b)
fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Lentz evaluation of the incomplete beta continued fraction
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPSILON: f64 = 3.0e-16;
    const FLOOR: f64 = 1.0e-300;

    let guard = |v: f64| if v.abs() < FLOOR { FLOOR } else { v };

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let even = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + even * d);
        c = guard(1.0 + even / c);
        h *= d * c;

        let odd = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + odd * d);
        c = guard(1.0 + odd / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }
    h
}
