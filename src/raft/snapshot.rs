use super::{Configuration, Index, NodeID, Term, Ticks};
use crate::encoding;

use serde::{Deserialize, Serialize};

/// A snapshot transfer ID, unique per leader term.
pub type SnapshotID = u64;

/// A state machine snapshot, covering all log entries up to and including
/// index. Stored in the log after compaction, and sent to lagging peers in
/// chunks via Message::Install.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The last log index included in the snapshot.
    pub index: Index,
    /// The term of the last included entry.
    pub term: Term,
    /// The active configuration as of index.
    pub configuration: Configuration,
    /// The serialized state machine, as returned by State::snapshot().
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl encoding::Value for Snapshot {}

impl Snapshot {
    /// Returns the number of chunks of the given size. An empty snapshot still
    /// has a single (empty) chunk.
    pub fn chunk_count(&self, chunk_size: usize) -> usize {
        self.data.len().div_ceil(chunk_size).max(1)
    }

    /// Returns the chunk at the given position.
    pub fn chunk(&self, chunk_index: usize, chunk_size: usize) -> &[u8] {
        let start = (chunk_index * chunk_size).min(self.data.len());
        let end = (start + chunk_size).min(self.data.len());
        &self.data[start..end]
    }
}

/// An outbound snapshot transfer to a single peer, tracked by the leader. Chunks
/// are sent one at a time, and the next one is only sent once the previous
/// has been acknowledged.
#[derive(Clone, Debug, PartialEq)]
pub struct Sender {
    /// The transfer ID.
    pub id: SnapshotID,
    /// The snapshot being sent.
    pub snapshot: Snapshot,
    /// The chunk that's currently in flight.
    pub chunk: usize,
    /// Ticks since the last acknowledged chunk.
    pub since_ack: Ticks,
}

impl Sender {
    pub fn new(id: SnapshotID, snapshot: Snapshot) -> Self {
        Self { id, snapshot, chunk: 0, since_ack: 0 }
    }
}

/// The outcome of offering a chunk to a Receiver.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    /// The chunk was appended, but the snapshot is incomplete.
    Accepted,
    /// The chunk was already received, and was ignored.
    Duplicate,
    /// The chunk was not the expected one. The receiver must be discarded.
    OutOfOrder,
    /// The final chunk was received, and the snapshot is complete.
    Complete(Snapshot),
}

/// An inbound snapshot transfer, assembled from chunks in order. A receiver
/// belongs to a single (leader, term, snapshot ID), and is discarded whenever
/// any of these change. A partial snapshot is never visible to the state
/// machine.
#[derive(Clone, Debug, PartialEq)]
pub struct Receiver {
    /// The sending leader.
    leader: NodeID,
    /// The receiver's term when the transfer began.
    term: Term,
    /// The snapshot transfer ID, unique per leader term.
    id: SnapshotID,
    /// The snapshot, with its data accumulated so far.
    snapshot: Snapshot,
    /// The next expected chunk.
    next_chunk: usize,
}

impl Receiver {
    /// Creates a new receiver, starting at chunk 0.
    pub fn new(
        leader: NodeID,
        term: Term,
        id: SnapshotID,
        index: Index,
        last_term: Term,
        configuration: Configuration,
    ) -> Self {
        let snapshot = Snapshot { index, term: last_term, configuration, data: Vec::new() };
        Self { leader, term, id, snapshot, next_chunk: 0 }
    }

    /// Returns true if the receiver belongs to the given transfer.
    pub fn is_for(&self, leader: NodeID, term: Term, id: SnapshotID) -> bool {
        (self.leader, self.term, self.id) == (leader, term, id)
    }

    /// Offers a chunk to the receiver.
    pub fn offer(&mut self, chunk_index: usize, data: &[u8], done: bool) -> Chunk {
        if chunk_index + 1 == self.next_chunk {
            return Chunk::Duplicate;
        }
        if chunk_index != self.next_chunk {
            return Chunk::OutOfOrder;
        }
        self.snapshot.data.extend_from_slice(data);
        self.next_chunk += 1;
        if done {
            return Chunk::Complete(std::mem::replace(
                &mut self.snapshot,
                Snapshot { index: 0, term: 0, configuration: Configuration::default(), data: Vec::new() },
            ));
        }
        Chunk::Accepted
    }
}
