use super::{Entry, Index};
use crate::error::Result;

/// A Raft-managed state machine, i.e. the applier of committed entries. Raft
/// itself does not care what the state machine is, nor what the commands and
/// results do -- it will simply apply log entries sequentially, returning an
/// arbitrary binary result to the client.
///
/// Since commands are applied identically across all replicas, they must be
/// deterministic and yield the same state and result across all replicas too.
/// Otherwise, the replicas will diverge, and different replicas will produce
/// different results.
///
/// Entries are applied in strictly increasing index order, without gaps or
/// duplicates, except that a snapshot restore may skip ahead.
pub trait State: Send {
    /// Returns the last applied index from the state machine.
    ///
    /// This must correspond to the current state of the state machine, since it
    /// determines which entry to apply next. In particular, a node crash may
    /// result in partial command application or data loss, which must be
    /// handled appropriately.
    fn get_applied_index(&self) -> Index;

    /// Applies a log entry to the state machine, returning a client result.
    /// Deterministic errors are considered applied and propagated back to the
    /// client. Non-deterministic errors (see Error::is_deterministic) are
    /// propagated and halt the node, since replicas would otherwise diverge.
    ///
    /// The entry may contain a noop or a configuration, which Raft commits
    /// itself. These must still be applied to update the applied index, and
    /// should return an empty result.
    fn apply(&mut self, entry: Entry) -> Result<Vec<u8>>;

    /// Returns a serialized snapshot of the state machine as of the applied
    /// index. Used to compact the log.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the entire state machine with the given snapshot, taken at the
    /// given index. The applied index becomes index.
    fn restore(&mut self, index: Index, data: &[u8]) -> Result<()>;
}
