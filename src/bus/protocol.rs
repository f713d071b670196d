//! Wire protocol between bus clients and the broker.
//!
//! Newline-delimited JSON, one [`Frame`] per line, tagged by `op`:
//!
//! ```json
//! {"op":"hello","client_id":"taskhub-3f2a"}
//! {"op":"subscribe","filter":"sensors/+/temp"}
//! {"op":"publish","topic":"sensors/kitchen/temp","payload":{"c":21.5}}
//! {"op":"message","topic":"sensors/kitchen/temp","payload":{"c":21.5}}
//! ```
//!
//! Clients send `hello`, `subscribe`, `unsubscribe` and `publish`; the broker
//! sends `message` for every publish matching one of the client's filters.

use super::Payload;
use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};

/// Maximum accepted line length in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from a client.
    Hello { client_id: String },
    Subscribe { filter: String },
    Unsubscribe { filter: String },
    /// Client → broker.
    Publish { topic: String, payload: Payload },
    /// Broker → client.
    Message { topic: String, payload: Payload },
}

impl Frame {
    /// Serializes this frame to a JSON line (with trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Json`] if the payload cannot be serialized.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one line (without its newline).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bus`] for oversized or malformed lines.
    pub fn from_line(line: &str) -> Result<Self> {
        if line.len() > MAX_FRAME_BYTES {
            return Err(HubError::Bus(format!(
                "frame of {} bytes exceeds {MAX_FRAME_BYTES}",
                line.len()
            )));
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| HubError::Bus(format!("malformed frame: {e}")))
    }
}
