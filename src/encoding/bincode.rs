//! Bincode is used to encode values, both in key/value stores and the Raft
//! message protocol. It is a Rust-specific encoding that depends on the
//! internal data structures being stable, but it's sufficient here. See:
//! https://github.com/bincode-org/bincode
//!
//! This module wraps the standard bincode crate to change the default options,
//! in particular to use variable-length rather than fixed-length integers.
//! Upstream bincode::(de)serialize uses fixed-length options, unlike
//! DefaultOptions; this module always uses DefaultOptions.

use crate::error::Result;

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Serializes a value using Bincode. Panics on failure, since that is a
/// problem with the data structure rather than the data.
pub fn serialize<T: serde::Serialize>(value: &T) -> Vec<u8> {
    bincode().serialize(value).expect("value must be serializable")
}
