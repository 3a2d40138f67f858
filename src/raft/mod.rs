//! Implements the Raft distributed consensus protocol.
//!
//! For details, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//! * Raft website: <https://raft.github.io>
//!
//! Raft lets a group of nodes agree on a single, ordered command log. Entries
//! are replicated by an elected leader, and are committed once a strict
//! majority (quorum) of voters have stored them. Committed entries are then
//! applied in order to a state machine on each node. The cluster tolerates the
//! failure of any minority of voters.
//!
//! RAFT LOG AND STATE MACHINE
//! ==========================
//!
//! The log is managed by `Log`, stored in a `storage::Engine`. Entries carry
//! an opaque command, a noop (appended by new leaders), or a cluster
//! configuration. Committed entries are applied to the `State` trait, which
//! never needs to inspect Raft-internal payloads. The state machine can also
//! produce a snapshot, which is used to compact the log prefix.
//!
//! LEADER ELECTION
//! ===============
//!
//! Nodes are in one of four roles: follower, candidate, leader, or learner,
//! modeled as `RawNode<Follower>` etc. and wrapped in the `Node` enum.
//!
//! * Follower: replicates log entries from a leader. May not know a leader yet.
//! * Candidate: campaigns for leadership in an election.
//! * Leader: processes client requests and replicates to other members.
//! * Learner: a non-voting member that replicates, but never votes or campaigns.
//!
//! Time is divided into terms. There is at most one leader per term, and a
//! node that sees a message from a later term becomes a follower in it. The
//! current term and vote are flushed to disk before any response is sent.
//!
//! A follower that hasn't heard from a leader within its randomized election
//! timeout becomes a candidate. With pre-voting enabled, the candidate first
//! polls voters via `Message::Poll`, without changing its term: voters grant
//! the poll if the candidate's log is at least as up-to-date as theirs and
//! they haven't heard from a leader within the election timeout. Only once a
//! quorum has granted the poll does the candidate bump its term, vote for
//! itself, and send `Message::Vote`. This prevents a node that was partitioned
//! away from disrupting the cluster with a higher term when it rejoins, since
//! it can't win a poll while the others follow a live leader.
//!
//! A vote is granted at most once per term, and only if the candidate's log is
//! at least as up-to-date as the voter's, compared by (last term, last index).
//! A candidate that wins a quorum of votes becomes leader, and appends a noop
//! entry to commit entries from previous terms (Raft paper section 5.4.2).
//!
//! With check-quorum enabled, a leader that hasn't heard from a quorum of
//! voters in a full election timeout steps down, since it is likely on the
//! minority side of a partition.
//!
//! REPLICATION AND CONSENSUS
//! =========================
//!
//! The leader sends `Message::Append` with the entries following each peer's
//! `next` index, along with the previous entry's index and term. A follower
//! only accepts the entries if it has the previous entry, which guarantees the
//! log matching property (Raft paper section 5.3). Otherwise it rejects them
//! with its last index, and the leader backs off its `next` index.
//! Appends without entries are sent periodically as heartbeats.
//!
//! An entry is committed once it's stored on a quorum of voters, but the
//! leader only commits entries from its own term directly (Raft paper figure
//! 8). The commit index is propagated to followers in appends.
//!
//! If the entries a peer needs have been compacted away, the leader instead
//! sends its latest snapshot via a sequence of `Message::Install` chunks. The
//! receiver only restores its state machine once the final chunk arrives, and
//! discards partial transfers if the leader, term, or transfer ID changes.
//!
//! MEMBERSHIP CHANGES
//! ==================
//!
//! Cluster configurations are log entries: `Request::Reconfigure` appends a
//! new configuration, which takes effect when it's committed. Until then,
//! quorums are computed from the previous configuration. Only a single member
//! may be added, removed, promoted or demoted at a time, so the old and new
//! quorums always overlap, and a new change is rejected with
//! `Error::ConflictingReconfigure` while one is pending. A leader also can't
//! reconfigure until its noop entry is committed, since an entry from a
//! previous term could still hold an uncommitted configuration.
//!
//! Nodes that are not voters in their active configuration run as learners.
//! Members that report an outdated configuration version are sent the active
//! configuration directly with `Message::Configure`.
//!
//! LEADERSHIP TRANSFER
//! ===================
//!
//! `Request::Transfer` hands leadership to a voter. The leader stops accepting
//! writes, catches the target up if necessary, and sends `Message::Transfer`.
//! The target immediately campaigns in the next term, skipping the election
//! timeout and poll, and the old leader steps down when it sees the new term.
//! If the target doesn't take over within an election timeout, the transfer
//! is aborted and the leader resumes.
//!
//! CLIENT REQUESTS
//! ===============
//!
//! Client requests are submitted as `Message::ClientRequest` to the local
//! node. Only the leader processes them: other nodes respond with
//! `Error::NotLeader` and the known leader, if any, and the client retries
//! there. Requests are never retried internally. If the leader steps down, all
//! pending requests fail with `Error::NotLeader`.
//!
//! MESSAGE DELIVERY
//! ================
//!
//! Nodes don't assume reliable or ordered delivery. Every request either gets
//! a response or a `Message::Failure`, injected by the transport on timeouts
//! or unhandled RPC kinds. Responses are matched to requests by their term
//! and content, and stale ones are ignored. The `Server` runs a node on real
//! transports, and `sim::Cluster` runs a deterministic simulation for tests.

mod log;
mod membership;
mod message;
mod node;
mod server;
pub mod sim;
mod snapshot;
mod state;
mod transport;

pub use self::log::{Entry, Index, Key, Log, Payload};
pub use membership::{quorum_size, quorum_value, Configuration, Member, MemberRole};
pub use message::{
    Envelope, Failure, Message, Request, RequestID, Response, RpcKind, Status,
};
pub use node::{Node, NodeID, NodeRole, Term, Ticks};
pub use server::{ClientReceiver, ClientSender, Server};
pub use snapshot::{Snapshot, SnapshotID};
pub use state::State;
pub use transport::{Dispatcher, Transport};

use crate::errinput;
use crate::error::Result;

/// The interval between Raft ticks, the unit of time.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The interval between leader heartbeats in ticks.
pub const HEARTBEAT_INTERVAL: Ticks = 4;

/// The default election timeout range in ticks. This is randomized in this
/// interval, to avoid election ties.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum number of entries to send in a single append message.
pub const MAX_APPEND_ENTRIES: usize = 100;

/// The number of applied entries after which the log is compacted.
pub const SNAPSHOT_THRESHOLD: u64 = 1000;

/// The size of snapshot chunks sent to followers.
pub const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;

/// The number of ticks before an unanswered peer request fails with a
/// timeout, when running a `Server`.
pub const REQUEST_TIMEOUT: Ticks = 20;

/// Raft node options.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries to send in a single Append message.
    pub max_append_entries: usize,
    /// Compact the log once this many entries have been applied since the
    /// last snapshot. 0 disables compaction.
    pub snapshot_threshold: u64,
    /// The size of snapshot chunks, in bytes.
    pub snapshot_chunk_size: usize,
    /// Poll voters before campaigning in a new term.
    pub pre_vote: bool,
    /// Step down as leader if a quorum hasn't been heard from in an election
    /// timeout.
    pub check_quorum: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_entries: MAX_APPEND_ENTRIES,
            snapshot_threshold: SNAPSHOT_THRESHOLD,
            snapshot_chunk_size: SNAPSHOT_CHUNK_SIZE,
            pre_vote: true,
            check_quorum: true,
        }
    }
}

impl Options {
    /// Validates the options. Heartbeats must be strictly more frequent than
    /// the shortest election timeout, or followers will call elections while
    /// the leader is healthy.
    pub fn validate(&self) -> Result<()> {
        let range = &self.election_timeout_range;
        if self.heartbeat_interval == 0 {
            return errinput!("heartbeat interval must be positive");
        }
        if range.start >= range.end {
            return errinput!("invalid election timeout range {range:?}");
        }
        if self.heartbeat_interval >= range.start {
            return errinput!(
                "heartbeat interval {} must be below election timeout {}",
                self.heartbeat_interval,
                range.start
            );
        }
        if self.max_append_entries == 0 {
            return errinput!("max append entries must be positive");
        }
        if self.snapshot_chunk_size == 0 {
            return errinput!("snapshot chunk size must be positive");
        }
        Ok(())
    }

    /// Returns the maximum election timeout, used as the window for
    /// check-quorum, leadership transfers and stalled snapshot transfers.
    pub(crate) fn max_election_timeout(&self) -> Ticks {
        self.election_timeout_range.end
    }
}
