//! Outbound instruction message and its transport encoding
//!
//! Wire format: the UTF-8 text `"<maneuver>: <distance>"`, base64 encoded
//! (standard alphabet, padded) and written as the characteristic value.

use crate::domain::types::{Maneuver, RouteStep};
use base64::{engine::general_purpose::STANDARD, Engine};

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub maneuver: Maneuver,
    pub distance_text: String,
}

impl OutboundMessage {
    pub fn new(maneuver: Maneuver, distance_text: impl Into<String>) -> Self {
        Self { maneuver, distance_text: distance_text.into() }
    }

    pub fn from_step(step: &RouteStep) -> Self {
        Self::new(step.maneuver.clone(), step.distance_text.clone())
    }

    /// Instruction text as shown on the device
    pub fn text(&self) -> String {
        format!("{}: {}", self.maneuver, self.distance_text)
    }

    /// Bytes written to the characteristic
    pub fn encode_payload(&self) -> Vec<u8> {
        STANDARD.encode(self.text().as_bytes()).into_bytes()
    }
}

/// Decode a characteristic value read back from the device.
/// Returns None if it is not base64 of valid UTF-8.
pub fn decode_payload(payload: &[u8]) -> Option<String> {
    let raw = STANDARD.decode(payload).ok()?;
    String::from_utf8(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text() {
        let msg = OutboundMessage::new(Maneuver::TurnLeft, "200 m");
        assert_eq!(msg.text(), "turn-left: 200 m");
    }

    #[test]
    fn test_payload_is_base64_text() {
        let msg = OutboundMessage::new(Maneuver::TurnLeft, "200 m");
        assert_eq!(msg.encode_payload(), b"dHVybi1sZWZ0OiAyMDAgbQ==".to_vec());
        assert_eq!(decode_payload(&msg.encode_payload()).as_deref(), Some("turn-left: 200 m"));
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        assert_eq!(decode_payload(b"not base64!"), None);
    }
}
