use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// A key range, as inclusive or exclusive bounds.
pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// A key/value storage engine underneath the Raft log. Keys and values are
/// arbitrary byte strings, ordered lexicographically by key. Writes are only
/// guaranteed durable after flush() returns.
///
/// The log is exclusively owned by its node, so all methods take a mutable
/// reference and the engine is only ever used from one thread at a time.
pub trait Engine: Send {
    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Flushes buffered writes to the underlying storage medium.
    fn flush(&mut self) -> Result<()>;

    /// Gets the value of a key, if it exists.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterates over key/value pairs in the given range, in key order.
    fn scan(&mut self, range: KeyRange) -> Box<dyn ScanIterator + '_>;

    /// Sets the value of a key, replacing any existing value.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Returns engine status.
    fn status(&mut self) -> Result<Status>;
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIterator: DoubleEndedIterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = Result<(Vec<u8>, Vec<u8>)>>> ScanIterator for I {}

/// Engine status, reported as part of the node status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The engine name.
    pub name: String,
    /// The number of stored keys.
    pub keys: u64,
    /// The total size of stored keys and values, in bytes.
    pub size: u64,
}
