use super::{Configuration, Entry, Index, Member, NodeID, NodeRole, SnapshotID, Term};
use crate::encoding;
use crate::error::Result;
use crate::storage;

use serde::{Deserialize, Serialize};

/// A message envelope sent between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The recipient.
    pub to: NodeID,
    /// The message.
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// A message sent between Raft nodes. Requests and their responses are
/// matched by term and content rather than by sequence, so they may be
/// delivered in any order, or not at all.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates poll voters before campaigning, to find out whether they
    /// could win an election in the next term. Polls are sent in the
    /// candidate's current term, and don't change the receiver's state.
    Poll {
        /// The term the candidate proposes to campaign in.
        term: Term,
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// Voters respond to polls, granting them if the candidate's log is at
    /// least as up-to-date as theirs and they haven't heard from a leader
    /// recently.
    PollResponse {
        /// Whether the poll was granted.
        granted: bool,
    },

    /// Candidates solicit votes from all voters when campaigning for
    /// leadership.
    Vote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// Voters may grant a single vote per term, on a first-come first-serve
    /// basis. Candidates implicitly vote for themselves.
    VoteResponse {
        /// Whether the vote was granted.
        granted: bool,
    },

    /// Leaders replicate log entries to followers. Entries may be empty, in
    /// which case this is a heartbeat, which asserts leadership and propagates
    /// the commit index.
    Append {
        /// The index of the log entry immediately preceding the entries.
        prev_index: Index,
        /// The term of the log entry immediately preceding the entries.
        prev_term: Term,
        /// Entries to replicate.
        entries: Vec<Entry>,
        /// The leader's commit index.
        commit_index: Index,
    },

    /// Followers accept or reject appended entries.
    AppendResponse {
        /// Whether the entries were appended. False if the follower does not
        /// have the previous entry.
        success: bool,
        /// The index up to which the follower's log matches the leader's, if
        /// successful.
        match_index: Index,
        /// The follower's last log index.
        last_index: Index,
        /// The version of the follower's active configuration.
        config_version: u64,
    },

    /// Leaders push their active configuration to members that report an
    /// older version, without waiting for log replication.
    Configure {
        /// The configuration to install.
        configuration: Configuration,
    },

    /// Members acknowledge a pushed configuration.
    ConfigureResponse {
        /// False if the pushed configuration was older than the member's.
        success: bool,
        /// The member's configuration version after processing.
        version: u64,
    },

    /// Leaders send snapshots in chunks to followers whose required log
    /// entries have been compacted.
    Install {
        /// The snapshot transfer ID.
        snapshot_id: SnapshotID,
        /// The chunk position, starting at 0.
        chunk_index: u64,
        /// The chunk data.
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        /// The last log index included in the snapshot.
        last_index: Index,
        /// The term of the last included entry.
        last_term: Term,
        /// The configuration as of last_index.
        configuration: Configuration,
        /// Whether this is the last chunk.
        done: bool,
    },

    /// Followers acknowledge or reject snapshot chunks. A rejection restarts
    /// the transfer from chunk 0.
    InstallResponse {
        /// Whether the chunk was accepted.
        success: bool,
        /// The snapshot transfer ID.
        snapshot_id: SnapshotID,
        /// The chunk position.
        chunk_index: u64,
    },

    /// Leaders transfer leadership to a caught-up follower, which immediately
    /// campaigns in the next term.
    Transfer {
        /// The leader's last log index, which the target must match.
        last_index: Index,
        /// The leader's last log term, which the target must match.
        last_term: Term,
    },

    /// A transfer target accepts or refuses leadership.
    TransferResponse {
        /// Whether the target accepted, and will campaign.
        success: bool,
    },

    /// A request failed without a response. Injected by the transport, and
    /// addressed to the requester from the destination.
    Failure {
        /// The RPC kind of the failed request.
        rpc: RpcKind,
        /// The failure kind.
        failure: Failure,
    },

    /// A client request, submitted to the local node. Only the leader
    /// processes requests, others respond with Error::NotLeader.
    ClientRequest {
        /// The request ID. This is arbitrary, but must be globally unique for
        /// the duration of the request.
        id: RequestID,
        /// The request.
        request: Request,
    },

    /// A client response.
    ClientResponse {
        /// The response ID. This matches the ID of the ClientRequest.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

impl Message {
    /// Returns the RPC kind of the message if it's a request, or None if it's
    /// a response or failure.
    pub fn request_kind(&self) -> Option<RpcKind> {
        match self {
            Message::Poll { .. } => Some(RpcKind::Poll),
            Message::Vote { .. } => Some(RpcKind::Vote),
            Message::Append { .. } => Some(RpcKind::Append),
            Message::Configure { .. } => Some(RpcKind::Configure),
            Message::Install { .. } => Some(RpcKind::Install),
            Message::Transfer { .. } => Some(RpcKind::Transfer),
            Message::ClientRequest { request: Request::Reconfigure(_), .. } => {
                Some(RpcKind::Reconfigure)
            }
            Message::ClientRequest { .. } => Some(RpcKind::Client),
            _ => None,
        }
    }

    /// Returns the RPC kind that a response answers, or None if the message
    /// is not a response.
    pub fn response_kind(&self) -> Option<RpcKind> {
        match self {
            Message::PollResponse { .. } => Some(RpcKind::Poll),
            Message::VoteResponse { .. } => Some(RpcKind::Vote),
            Message::AppendResponse { .. } => Some(RpcKind::Append),
            Message::ConfigureResponse { .. } => Some(RpcKind::Configure),
            Message::InstallResponse { .. } => Some(RpcKind::Install),
            Message::TransferResponse { .. } => Some(RpcKind::Transfer),
            Message::Failure { rpc, .. } => Some(*rpc),
            _ => None,
        }
    }
}

/// An RPC kind. Each kind has exactly one inbound handler per node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RpcKind {
    Poll,
    Vote,
    Append,
    Configure,
    Reconfigure,
    Install,
    Transfer,
    Client,
}

impl RpcKind {
    /// All RPC kinds.
    pub const ALL: [RpcKind; 8] = [
        RpcKind::Poll,
        RpcKind::Vote,
        RpcKind::Append,
        RpcKind::Configure,
        RpcKind::Reconfigure,
        RpcKind::Install,
        RpcKind::Transfer,
        RpcKind::Client,
    ];
}

impl std::fmt::Display for RpcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A request failure, as opposed to a negative response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// The request or its response was lost, or took too long.
    Timeout,
    /// The destination has no handler registered for the RPC kind.
    Unhandled,
}

/// A client request ID.
pub type RequestID = Vec<u8>;

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Appends a state machine command to the log, responding with the
    /// state machine's result once applied.
    Write(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Changes the cluster membership to the given members, responding with
    /// the new configuration version once committed.
    Reconfigure(Vec<Member>),
    /// Transfers leadership to the given node, or the most caught-up voter if
    /// None, responding with the new leader.
    Transfer(Option<NodeID>),
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Write(#[serde(with = "serde_bytes")] Vec<u8>),
    Reconfigure(u64),
    Transfer(NodeID),
}

/// Raft node status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node ID.
    pub id: NodeID,
    /// The node role.
    pub role: NodeRole,
    /// The current term.
    pub term: Term,
    /// The known leader in the current term, if any.
    pub leader: Option<NodeID>,
    /// The last log index.
    pub last_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// The applied index.
    pub applied_index: Index,
    /// The snapshot index.
    pub snapshot_index: Index,
    /// The active configuration.
    pub configuration: Configuration,
    /// The log storage engine status.
    pub storage: storage::Status,
}
