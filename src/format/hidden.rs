//! Owner metadata embedded in the clear header of a container.
//!
//! The payload is `0xACCE` followed by UTF-8 JSON `{"owner": "...", "ts": 1700000000}`.
//! It is obfuscation only: anyone can read it without the password.

use serde::{Deserialize, Serialize};

/// Marker that opens a stego payload.
pub const STEG_MAGIC: [u8; 2] = [0xAC, 0xCE];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenMetadata {
    pub owner: String,
    /// Unix seconds when the container was created.
    pub ts: i64,
}

impl HiddenMetadata {
    pub fn new(owner: impl Into<String>, ts: i64) -> Self {
        Self {
            owner: owner.into(),
            ts,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut buf = STEG_MAGIC.to_vec();
        serde_json::to_writer(&mut buf, self)?;
        Ok(buf)
    }

    /// Returns `None` for an empty payload, a missing marker or bad JSON.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let json = payload.strip_prefix(&STEG_MAGIC)?;
        serde_json::from_slice(json).ok()
    }
}
