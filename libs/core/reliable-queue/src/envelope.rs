//! Staged message envelopes
//!
//! A reserved message sits in the staging list as
//! `<unix expiry seconds>|<payload>`. Only the first `|` separates the
//! deadline from the payload, so payloads may contain the delimiter and are
//! never escaped. Payloads are opaque bytes; only the expiry prefix has to be
//! ASCII digits.

use crate::error::QueueError;

/// Separator between the expiry and the payload
pub const DELIMITER: u8 = b'|';

/// A decoded staging list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Unix timestamp (seconds) after which the entry counts as abandoned
    pub expiry: i64,
    /// Raw payload as it was popped from the queue
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(expiry: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            expiry,
            payload: payload.into(),
        }
    }

    /// Encode into the staged form
    pub fn encode(&self) -> Vec<u8> {
        encode(self.expiry, &self.payload)
    }

    /// Decode a staged entry, rejecting entries without a numeric prefix
    pub fn decode(raw: &[u8]) -> Result<Self, QueueError> {
        let split = raw
            .iter()
            .position(|b| *b == DELIMITER)
            .ok_or_else(|| malformed(raw))?;

        let expiry = std::str::from_utf8(&raw[..split])
            .ok()
            .and_then(|prefix| prefix.parse::<i64>().ok())
            .ok_or_else(|| malformed(raw))?;

        Ok(Self::new(expiry, &raw[split + 1..]))
    }

    /// Whether the deadline has passed at `now` (strictly later)
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expiry
    }
}

fn malformed(raw: &[u8]) -> QueueError {
    QueueError::Malformed(String::from_utf8_lossy(raw).into_owned())
}

/// Concatenate expiry, delimiter and payload
pub fn encode(expiry: i64, payload: &[u8]) -> Vec<u8> {
    let mut raw = expiry.to_string().into_bytes();
    raw.reserve(payload.len() + 1);
    raw.push(DELIMITER);
    raw.extend_from_slice(payload);
    raw
}

/// Split a staged entry into `(expiry, payload)`
pub fn decode(raw: &[u8]) -> Result<(i64, Vec<u8>), QueueError> {
    Envelope::decode(raw).map(|e| (e.expiry, e.payload))
}
