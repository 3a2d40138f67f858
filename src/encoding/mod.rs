//! Binary data encodings.
//!
//! * bincode: used for values in the key/value store (Raft log entries,
//!   metadata, snapshots) and for Raft messages.
//!
//! Storage keys are encoded by hand in the Raft log, since they need an
//! order-preserving encoding; see `raft::log::Key`.

pub mod bincode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types, used both for
/// values in storage engines and for Raft messages on the wire.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Encodes a value to a byte vector using Bincode.
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }
}
