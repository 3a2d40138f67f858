use super::super::{
    snapshot, Configuration, Entry, Envelope, Index, Message, RequestID, Response, SnapshotID,
};
use super::{Candidate, Learner, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::error::{Error, Result};

use log::{debug, info, warn};

/// Replication state shared by followers and learners.
#[derive(Clone, Debug, PartialEq)]
pub struct Replica {
    /// The leader, or None if just initialized.
    pub(super) leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    pub(super) leader_seen: Ticks,
    /// An inbound snapshot transfer from the leader, if any.
    pub(super) snapshot: Option<snapshot::Receiver>,
}

impl Replica {
    /// Creates new replication state.
    pub(super) fn new(leader: Option<NodeID>) -> Self {
        Self { leader, leader_seen: 0, snapshot: None }
    }
}

/// A role which replicates the log from a leader.
pub(super) trait Replicating: Role {
    fn replica(&mut self) -> &mut Replica;
}

impl<R: Replicating> RawNode<R> {
    /// Records a message from the current term's leader, following it if it
    /// wasn't known yet.
    pub(super) fn follow(&mut self, leader: NodeID) {
        let term = self.term;
        let replica = self.role.replica();
        match replica.leader {
            Some(current) => {
                assert_eq!(current, leader, "saw multiple leaders in term {term}")
            }
            None => {
                info!("Following leader {leader} in term {term}");
                replica.leader = Some(leader);
            }
        }
        replica.leader_seen = 0;
    }

    /// Appends entries from the leader, if the log contains the base entry
    /// at prev_index and prev_term. Commits and applies entries up to the
    /// leader's commit index, but only within the range known to match it.
    pub(super) fn append(
        &mut self,
        leader: NodeID,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<Entry>,
        commit_index: Index,
    ) -> Result<()> {
        if !self.log.has(prev_index, prev_term)? {
            debug!("Rejecting append at base {prev_index}@{prev_term}");
            return self.send(
                leader,
                Message::AppendResponse {
                    success: false,
                    match_index: 0,
                    last_index: self.log.get_last_index().0,
                    config_version: self.log.configuration().version,
                },
            );
        }

        let match_index = prev_index + entries.len() as Index;
        if !entries.is_empty() {
            self.log.splice(entries)?;
        }
        let commit_index = commit_index.min(match_index);
        if commit_index > self.log.get_commit_index().0 {
            self.log.commit(commit_index)?;
            self.maybe_apply()?;
        }

        self.send(
            leader,
            Message::AppendResponse {
                success: true,
                match_index,
                last_index: self.log.get_last_index().0,
                config_version: self.log.configuration().version,
            },
        )
    }

    /// Receives a snapshot chunk from the leader. Chunks must arrive in
    /// order, and the snapshot is only installed once the final chunk has
    /// been received. Snapshots at or below the commit index are acknowledged
    /// without being installed.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn install(
        &mut self,
        leader: NodeID,
        snapshot_id: SnapshotID,
        chunk_index: u64,
        data: Vec<u8>,
        last_index: Index,
        last_term: Term,
        configuration: Configuration,
        done: bool,
    ) -> Result<()> {
        let response =
            |success| Message::InstallResponse { success, snapshot_id, chunk_index };

        if last_index <= self.log.get_commit_index().0 {
            debug!("Ignoring snapshot {snapshot_id} at or below commit index");
            return self.send(leader, response(true));
        }

        // Partial transfers from a different leader, term, or transfer are
        // discarded. A new transfer must start at chunk 0.
        let term = self.term;
        let mut receiver = match self.role.replica().snapshot.take() {
            Some(receiver) if receiver.is_for(leader, term, snapshot_id) => receiver,
            _ if chunk_index == 0 => {
                info!("Receiving snapshot {snapshot_id} at {last_index}@{last_term} from {leader}");
                snapshot::Receiver::new(leader, term, snapshot_id, last_index, last_term, configuration)
            }
            _ => {
                warn!("Rejecting snapshot {snapshot_id} chunk {chunk_index} without transfer");
                return self.send(leader, response(false));
            }
        };

        match receiver.offer(chunk_index as usize, &data, done) {
            snapshot::Chunk::Accepted | snapshot::Chunk::Duplicate => {
                self.role.replica().snapshot = Some(receiver);
                self.send(leader, response(true))
            }
            snapshot::Chunk::OutOfOrder => {
                warn!("Aborting snapshot {snapshot_id}: unexpected chunk {chunk_index}");
                self.send(leader, response(false))
            }
            snapshot::Chunk::Complete(snapshot) => {
                info!("Installing snapshot {snapshot_id} at {}@{}", snapshot.index, snapshot.term);
                // Restore the state machine first, so the log is left as is
                // if it fails.
                self.state.restore(snapshot.index, &snapshot.data)?;
                self.log.install_snapshot(snapshot)?;
                self.send(leader, response(true))
            }
        }
    }

    /// Installs a configuration pushed by the leader, if it's newer than the
    /// active one.
    pub(super) fn configure(&mut self, leader: NodeID, configuration: Configuration) -> Result<()> {
        let pushed = configuration.version;
        if self.log.set_configuration(configuration)? {
            info!("Installed configuration version {pushed} from leader {leader}");
        }
        let version = self.log.configuration().version;
        self.send(leader, Message::ConfigureResponse { success: pushed <= version, version })
    }
}

// A follower replicates log entries from a leader and votes in elections.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The leader and replication state.
    pub(super) replica: Replica,
    /// The number of ticks without hearing from the leader before campaigning.
    pub(super) election_timeout: Ticks,
    /// The node we voted for in the current term, if any.
    pub(super) voted_for: Option<NodeID>,
    /// A leadership transfer we started as leader, which succeeded if its
    /// target turns out to lead the current term.
    pub(super) handover: Option<Handover>,
}

impl Follower {
    /// Creates a new follower role.
    pub fn new(leader: Option<NodeID>, voted_for: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { replica: Replica::new(leader), election_timeout, voted_for, handover: None }
    }
}

/// A pending leadership transfer, awaiting the new term's leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Handover {
    /// The transfer target.
    pub(super) target: NodeID,
    /// The node which submitted the transfer request.
    pub(super) from: NodeID,
    /// The request ID.
    pub(super) id: RequestID,
}

impl Role for Follower {}

impl Replicating for Follower {
    fn replica(&mut self) -> &mut Replica {
        &mut self.replica
    }
}

impl RawNode<Follower> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();

        if let Some(leader) = self.role.replica.leader {
            assert_ne!(leader, self.id, "Can't follow self");
            assert_ne!(self.term, 0, "Followers with leaders can't have term 0");
        }
        debug_assert_eq!(self.role.voted_for, self.log.get_term().1, "Vote does not match log");
    }

    /// Transitions the follower into a candidate. If campaign is true, it
    /// campaigns in the next term right away, otherwise it polls voters first
    /// (if pre-voting is enabled).
    pub(super) fn into_candidate(mut self, campaign: bool) -> Result<RawNode<Candidate>> {
        self.resolve_handover(None)?;
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply()?;
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        if campaign || !node.opts.pre_vote {
            node.campaign()?;
        } else {
            node.poll()?;
        }
        Ok(node)
    }

    /// Transitions the follower into a learner, keeping its leader.
    pub(super) fn into_learner(mut self) -> RawNode<Learner> {
        let version = self.log.configuration().version;
        info!("Not a voter in configuration version {version}, becoming learner");
        let replica = std::mem::replace(&mut self.role.replica, Replica::new(None));
        self.into_role(Learner::new(replica))
    }

    /// Transitions into a leaderless follower in a later term.
    pub(super) fn into_term(mut self, term: Term) -> Result<Self> {
        assert!(term > self.term, "Term regression {} → {}", self.term, term);
        self.resolve_handover(None)?;
        info!("Discovered new term {term}");
        self.term = term;
        self.log.set_term(term, None)?;
        self.role = Follower::new(None, None, self.gen_election_timeout());
        Ok(self)
    }

    /// Responds to a handed-over leadership transfer, if any. It succeeded if
    /// the given leader of the current term is its target, and is aborted
    /// otherwise.
    fn resolve_handover(&mut self, leader: Option<NodeID>) -> Result<()> {
        let Some(handover) = self.role.handover.take() else {
            return Ok(());
        };
        let response = match leader {
            Some(leader) if leader == handover.target => {
                info!("Leadership transferred to {leader}");
                Ok(Response::Transfer(leader))
            }
            _ => Err(Error::Abort),
        };
        self.send(handover.from, Message::ClientResponse { id: handover.id, response })
    }

    /// Becomes a learner if we're no longer a voter.
    fn into_member_role(self) -> Node {
        if self.is_voter() {
            return self.into();
        }
        self.into_learner().into()
    }

    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        if msg.term < self.term {
            self.reply_stale(&msg)?;
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is from the
        // leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_term(msg.term)?.step(msg);
        }

        match msg.message {
            Message::Append { prev_index, prev_term, entries, commit_index } => {
                self.follow(msg.from);
                self.append(msg.from, prev_index, prev_term, entries, commit_index)?;
            }

            Message::Install {
                snapshot_id,
                chunk_index,
                data,
                last_index,
                last_term,
                configuration,
                done,
            } => {
                self.follow(msg.from);
                self.install(
                    msg.from,
                    snapshot_id,
                    chunk_index,
                    data,
                    last_index,
                    last_term,
                    configuration,
                    done,
                )?;
            }

            Message::Configure { configuration } => {
                self.follow(msg.from);
                self.configure(msg.from, configuration)?;
            }

            // The leader wants to hand over leadership. If our log matches
            // its log, campaign immediately in the next term.
            Message::Transfer { last_index, last_term } => {
                self.follow(msg.from);
                let success = (last_index, last_term) == self.log.get_last_index();
                self.send(msg.from, Message::TransferResponse { success })?;
                if success {
                    info!("Leader {} transferred leadership to us", msg.from);
                    return self.into_candidate(true)?.check_election();
                }
            }

            // Grant a poll if the candidate could win an election: its log is
            // up-to-date, and we haven't heard from the leader recently.
            Message::Poll { term, last_index, last_term } => {
                let leader_recent = self.role.replica.leader.is_some()
                    && self.role.replica.leader_seen < self.opts.election_timeout_range.start;
                let granted =
                    term > self.term && !leader_recent && self.is_log_current(last_index, last_term);
                debug!("Poll from {} for term {term}: granted={granted}", msg.from);
                self.send(msg.from, Message::PollResponse { granted })?;
            }

            // Grant a vote if we haven't voted for someone else in this term,
            // don't have a leader, and the candidate's log is up-to-date.
            // Repeated requests from the same candidate are granted again.
            Message::Vote { last_index, last_term } => {
                let granted = match self.role.voted_for {
                    Some(voted_for) => voted_for == msg.from,
                    None => {
                        self.role.replica.leader.is_none()
                            && self.is_log_current(last_index, last_term)
                    }
                };
                if granted && self.role.voted_for.is_none() {
                    info!("Voting for {} in term {} election", msg.from, self.term);
                    self.log.set_term(self.term, Some(msg.from))?;
                    self.role.voted_for = Some(msg.from);
                    self.role.replica.leader_seen = 0;
                }
                self.send(msg.from, Message::VoteResponse { granted })?;
            }

            // Only the leader serves client requests.
            Message::ClientRequest { id, request: _ } => {
                let response = Err(Error::NotLeader(self.role.replica.leader));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            Message::ClientResponse { .. } => panic!("Unexpected client response to follower"),

            // Responses from a previous role in this term are ignored.
            Message::PollResponse { .. }
            | Message::VoteResponse { .. }
            | Message::AppendResponse { .. }
            | Message::ConfigureResponse { .. }
            | Message::InstallResponse { .. }
            | Message::TransferResponse { .. }
            | Message::Failure { .. } => {}
        }

        if let Some(leader) = self.role.replica.leader {
            self.resolve_handover(Some(leader))?;
        }
        Ok(self.into_member_role())
    }

    /// Processes a logical clock tick.
    pub fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.replica.leader_seen = self.role.replica.leader_seen.saturating_add(1);
        if self.role.replica.leader_seen >= self.role.election_timeout {
            return self.into_candidate(false)?.check_election();
        }
        Ok(self.into())
    }
}
