mod candidate;
mod follower;
mod leader;
mod learner;

use super::{Envelope, Index, Log, Message, Options, Payload, Response, State, Status};
use crate::error::Result;
use candidate::Candidate;
use follower::Follower;
use leader::Leader;
use learner::Learner;

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use serde::{Deserialize, Serialize};

/// A node ID.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// A node role, as reported in node status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Candidate,
    Follower,
    Leader,
    Learner,
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a possibly
/// different role. Outbound messages are sent via the given node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// node logic. It exists for ergonomic use across role transitions, i.e
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
    Learner(RawNode<Learner>),
}

impl Node {
    /// Creates a new Raft node. It starts as a leaderless follower if it's a
    /// voter in the log's active configuration, otherwise as a learner. If it's
    /// the only voter, it becomes leader immediately.
    ///
    /// If the state machine is behind the log snapshot, it's restored from the
    /// snapshot first. Committed entries are then applied.
    pub fn new(
        id: NodeID,
        mut log: Log,
        mut state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        opts.validate()?;

        if state.get_applied_index() < log.get_snapshot_index().0 {
            if let Some(snapshot) = log.get_snapshot()? {
                info!("Restoring state machine from snapshot at {}", snapshot.index);
                state.restore(snapshot.index, &snapshot.data)?;
            }
        }

        let (term, voted_for) = log.get_term();
        let mut node =
            RawNode { id, term, log, state, node_tx, opts, role: Follower::new(None, voted_for, 0) };
        node.role.election_timeout = node.gen_election_timeout();
        node.maybe_apply()?;

        if !node.is_voter() {
            return Ok(node.into_learner().into());
        }
        if node.log.configuration().voters() == vec![id] {
            // If we're the only voter, become leader immediately.
            return node.into_candidate(true)?.check_election();
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
            Node::Learner(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
            Node::Learner(n) => n.term,
        }
    }

    /// Returns the node role.
    pub fn role(&self) -> NodeRole {
        match self {
            Node::Candidate(_) => NodeRole::Candidate,
            Node::Follower(_) => NodeRole::Follower,
            Node::Leader(_) => NodeRole::Leader,
            Node::Learner(_) => NodeRole::Learner,
        }
    }

    /// Returns the known leader in the current term, if any.
    pub fn leader(&self) -> Option<NodeID> {
        match self {
            Node::Candidate(_) => None,
            Node::Follower(n) => n.role.replica.leader,
            Node::Leader(n) => Some(n.id),
            Node::Learner(n) => n.role.replica.leader,
        }
    }

    /// Processes a message from a peer, or a local client request.
    pub fn step(self, mut msg: Envelope) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        // Client requests are local, and always belong to the current term.
        if let Message::ClientRequest { .. } = msg.message {
            msg.term = self.term();
        }
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
            Node::Learner(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
            Node::Learner(n) => n.tick(),
        }
    }

    /// Returns the node status.
    pub fn status(&mut self) -> Result<Status> {
        let (role, leader) = (self.role(), self.leader());
        match self {
            Node::Candidate(n) => n.status(role, leader),
            Node::Follower(n) => n.status(role, leader),
            Node::Leader(n) => n.status(role, leader),
            Node::Learner(n) => n.status(role, leader),
        }
    }

    /// Returns the node's log.
    pub(crate) fn log(&mut self) -> &mut Log {
        match self {
            Node::Candidate(n) => &mut n.log,
            Node::Follower(n) => &mut n.log,
            Node::Leader(n) => &mut n.log,
            Node::Learner(n) => &mut n.log,
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

impl From<RawNode<Learner>> for Node {
    fn from(n: RawNode<Learner>) -> Self {
        Node::Learner(n)
    }
}

/// A Raft role: leader, follower, candidate, or learner.
pub trait Role: Clone + std::fmt::Debug + PartialEq {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states (roles)
/// are encoded as RawNode<Role>. See: http://cliffle.com/blog/rust-typestate/
///
/// The node has no fixed peer set: the replication targets and electorate are
/// given by the configurations in the log.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            term: self.term,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Returns true if the node is a voter in the active configuration.
    fn is_voter(&self) -> bool {
        self.log.configuration().is_voter(self.id)
    }

    /// Returns true if a candidate's log, given by its last index and term, is
    /// at least as up-to-date as ours.
    fn is_log_current(&self, last_index: Index, last_term: Term) -> bool {
        let (our_index, our_term) = self.log.get_last_index();
        last_term > our_term || (last_term == our_term && last_index >= our_index)
    }

    /// Applies any pending, committed entries to the state machine, and
    /// compacts the log if needed. The command responses are discarded, use
    /// maybe_apply_with() instead to access them.
    fn maybe_apply(&mut self) -> Result<()> {
        Self::maybe_apply_with(&mut self.log, &mut self.state, |_, _| Ok(()))?;
        self.maybe_compact()
    }

    /// Like maybe_apply(), but calls the given closure with the response of
    /// every applied entry. Configuration entries respond with their version.
    /// Not a method, so that the closure can mutate the node.
    fn maybe_apply_with<F>(log: &mut Log, state: &mut Box<dyn State>, mut on_apply: F) -> Result<()>
    where
        F: FnMut(Index, Result<Response>) -> Result<()>,
    {
        let mut scan = log.scan_apply(state.get_applied_index());
        while let Some(entry) = scan.next().transpose()? {
            let index = entry.index;
            let version = match &entry.payload {
                Payload::Configuration(configuration) => Some(configuration.version),
                Payload::Noop | Payload::Command(_) => None,
            };
            debug!("Applying {:?}", entry);
            let result = match state.apply(entry) {
                Err(error) if !error.is_deterministic() => return Err(error),
                result => result,
            };
            let response = match version {
                Some(version) => result.map(|_| Response::Reconfigure(version)),
                None => result.map(Response::Write),
            };
            on_apply(index, response)?;
        }
        Ok(())
    }

    /// Compacts the log into a state machine snapshot, once enough entries
    /// have been applied since the last snapshot.
    fn maybe_compact(&mut self) -> Result<()> {
        let threshold = self.opts.snapshot_threshold;
        let applied_index = self.state.get_applied_index();
        let (snapshot_index, _) = self.log.get_snapshot_index();
        if threshold == 0 || applied_index < snapshot_index + threshold {
            return Ok(());
        }
        let data = self.state.snapshot()?;
        self.log.compact(applied_index, data)?;
        info!("Compacted log through index {applied_index}");
        Ok(())
    }

    /// Sends a message.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all other voters in the active configuration.
    fn broadcast_voters(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.log.configuration().peers(self.id).into_iter().sorted() {
            if self.log.configuration().is_voter(id) {
                self.send(id, message.clone())?;
            }
        }
        Ok(())
    }

    /// Rejects a request from a past term, so the stale sender discovers our
    /// term and steps down. Stale responses are dropped.
    fn reply_stale(&self, msg: &Envelope) -> Result<()> {
        let version = self.log.configuration().version;
        let response = match &msg.message {
            Message::Poll { .. } => Message::PollResponse { granted: false },
            Message::Vote { .. } => Message::VoteResponse { granted: false },
            Message::Append { .. } => Message::AppendResponse {
                success: false,
                match_index: 0,
                last_index: self.log.get_last_index().0,
                config_version: version,
            },
            Message::Configure { .. } => Message::ConfigureResponse { success: false, version },
            Message::Install { snapshot_id, chunk_index, .. } => Message::InstallResponse {
                success: false,
                snapshot_id: *snapshot_id,
                chunk_index: *chunk_index,
            },
            Message::Transfer { .. } => Message::TransferResponse { success: false },
            _ => {
                debug!("Dropping message from past term ({:?})", msg);
                return Ok(());
            }
        };
        debug!("Rejecting message from past term ({:?})", msg);
        self.send(msg.from, response)
    }

    /// Returns the node status.
    fn status(&mut self, role: NodeRole, leader: Option<NodeID>) -> Result<Status> {
        Ok(Status {
            id: self.id,
            role,
            term: self.term,
            leader,
            last_index: self.log.get_last_index().0,
            commit_index: self.log.get_commit_index().0,
            applied_index: self.state.get_applied_index(),
            snapshot_index: self.log.get_snapshot_index().0,
            configuration: self.log.configuration().clone(),
            storage: self.log.status()?,
        })
    }

    /// Asserts common node invariants.
    fn assert_node(&self) {
        debug_assert_eq!(self.term, self.log.get_term().0, "Term does not match log");
        debug_assert!(
            self.state.get_applied_index() <= self.log.get_commit_index().0,
            "Applied index beyond commit index"
        );
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node.
        assert_eq!(msg.to, self.id, "Message to other node");
    }
}
