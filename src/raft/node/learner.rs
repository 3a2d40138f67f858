use super::super::{Envelope, Message};
use super::follower::{Replica, Replicating};
use super::{Follower, Node, RawNode, Role, Term};
use crate::error::{Error, Result};

use log::{debug, info};

/// A learner is a non-voting member. It replicates the log from the leader
/// like a follower, but never votes or campaigns, and doesn't count towards
/// quorums. It becomes a follower once promoted to voter.
#[derive(Clone, Debug, PartialEq)]
pub struct Learner {
    /// The leader and replication state.
    pub(super) replica: Replica,
}

impl Learner {
    /// Creates a new learner role.
    pub fn new(replica: Replica) -> Self {
        Self { replica }
    }
}

impl Role for Learner {}

impl Replicating for Learner {
    fn replica(&mut self) -> &mut Replica {
        &mut self.replica
    }
}

impl RawNode<Learner> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();
        if let Some(leader) = self.role.replica.leader {
            assert_ne!(leader, self.id, "Can't follow self");
        }
    }

    /// Transitions into a leaderless learner in a later term.
    fn into_term(mut self, term: Term) -> Result<Self> {
        assert!(term > self.term, "Term regression {} → {}", self.term, term);
        info!("Discovered new term {term}");
        self.term = term;
        self.log.set_term(term, None)?;
        self.role = Learner::new(Replica::new(None));
        Ok(self)
    }

    /// Transitions into a follower once promoted to voter, keeping the leader.
    fn into_member_role(mut self) -> Node {
        if !self.is_voter() {
            return self.into();
        }
        let version = self.log.configuration().version;
        info!("Promoted to voter in configuration version {version}, becoming follower");
        let replica = std::mem::replace(&mut self.role.replica, Replica::new(None));
        let voted_for = self.log.get_term().1;
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Follower::new(None, voted_for, election_timeout));
        node.role.replica = replica;
        node.into()
    }

    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        if msg.term < self.term {
            self.reply_stale(&msg)?;
            return Ok(self.into());
        }
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

            // Learners don't take part in elections.
            Message::Transfer { .. } => {
                self.follow(msg.from);
                self.send(msg.from, Message::TransferResponse { success: false })?;
            }
            Message::Poll { .. } => {
                debug!("Rejecting poll from {} as learner", msg.from);
                self.send(msg.from, Message::PollResponse { granted: false })?;
            }
            Message::Vote { .. } => {
                debug!("Rejecting vote from {} as learner", msg.from);
                self.send(msg.from, Message::VoteResponse { granted: false })?;
            }

            Message::ClientRequest { id, request: _ } => {
                let response = Err(Error::NotLeader(self.role.replica.leader));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            Message::ClientResponse { .. } => panic!("Unexpected client response to learner"),

            Message::PollResponse { .. }
            | Message::VoteResponse { .. }
            | Message::AppendResponse { .. }
            | Message::ConfigureResponse { .. }
            | Message::InstallResponse { .. }
            | Message::TransferResponse { .. }
            | Message::Failure { .. } => {}
        }

        Ok(self.into_member_role())
    }

    /// Processes a logical clock tick. Learners never campaign.
    pub fn tick(mut self) -> Result<Node> {
        self.assert();
        self.role.replica.leader_seen = self.role.replica.leader_seen.saturating_add(1);
        Ok(self.into())
    }
}
