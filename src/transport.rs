//! Outbound message delivery
//!
//! The broker connection lives outside this crate. Anything that can take a
//! `(topic, body)` pair implements [`Transport`].

use std::io::Write;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::types::OutboundMessage;

/// Sink for outbound messages
pub trait Transport {
    fn publish(&mut self, topic: &str, body: &str) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn publish(&mut self, topic: &str, body: &str) -> Result<(), TransportError> {
        (**self).publish(topic, body)
    }
}

/// Publish messages in order, stopping at the first failure.
///
/// Returns how many messages went out.
pub fn publish_all<T: Transport + ?Sized>(
    messages: &[OutboundMessage],
    transport: &mut T,
) -> Result<usize, TransportError> {
    for (sent, message) in messages.iter().enumerate() {
        if let Err(e) = transport.publish(&message.topic, &message.body) {
            warn!(topic = %message.topic, sent, error = %e, "publish failed");
            return Err(e);
        }
    }
    debug!(count = messages.len(), "published messages");
    Ok(messages.len())
}

/// Writes one `TOPIC<TAB>BODY` line per message
#[derive(Debug)]
pub struct LineTransport<W: Write> {
    writer: W,
}

impl<W: Write> LineTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Transport for LineTransport<W> {
    fn publish(&mut self, topic: &str, body: &str) -> Result<(), TransportError> {
        writeln!(self.writer, "{topic}\t{body}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| TransportError::new(topic, e.to_string()))
    }
}

/// Keeps published messages in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
    messages: Vec<OutboundMessage>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[OutboundMessage] {
        &self.messages
    }

    pub fn take(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.messages)
    }
}

impl Transport for MemoryTransport {
    fn publish(&mut self, topic: &str, body: &str) -> Result<(), TransportError> {
        self.messages.push(OutboundMessage::new(topic, body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Accepts a fixed number of messages, then refuses
    struct FlakyTransport {
        remaining: usize,
        delivered: Vec<String>,
    }

    impl Transport for FlakyTransport {
        fn publish(&mut self, topic: &str, _body: &str) -> Result<(), TransportError> {
            if self.remaining == 0 {
                return Err(TransportError::new(topic, "connection lost"));
            }
            self.remaining -= 1;
            self.delivered.push(topic.to_string());
            Ok(())
        }
    }

    fn messages() -> Vec<OutboundMessage> {
        vec![
            OutboundMessage::new("a", "1"),
            OutboundMessage::new("b", "2"),
            OutboundMessage::new("c", "3"),
        ]
    }

    #[test]
    fn test_publish_all_in_order() {
        let mut transport = MemoryTransport::new();
        assert_eq!(publish_all(&messages(), &mut transport).unwrap(), 3);
        assert_eq!(transport.messages(), messages().as_slice());
    }

    #[test]
    fn test_publish_all_stops_at_first_failure() {
        let mut transport = FlakyTransport {
            remaining: 1,
            delivered: Vec::new(),
        };
        let err = publish_all(&messages(), &mut transport).unwrap_err();
        assert_eq!(err.topic, "b");
        assert_eq!(transport.delivered, vec!["a".to_string()]);
    }

    #[test]
    fn test_line_transport_format() {
        let mut transport = LineTransport::new(Vec::new());
        publish_all(&messages()[..2], &mut transport).unwrap();
        let out = String::from_utf8(transport.into_inner()).unwrap();
        assert_eq!(out, "a\t1\nb\t2\n");
    }
}
