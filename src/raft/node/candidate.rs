use super::super::{Envelope, Message, Payload};
use super::{Follower, Leader, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::error::{Error, Result};

use log::{debug, info};
use std::collections::HashSet;

/// An election phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Phase {
    /// Polling voters in the current term, to see if we could win.
    Poll,
    /// Campaigning for votes in a new term.
    Vote,
}

/// A candidate is campaigning to become a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// The election phase.
    phase: Phase,
    /// Polls or votes received in the current phase, including our own.
    granted: HashSet<NodeID>,
    /// Ticks elapsed since the phase started.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    pub fn new(election_timeout: Ticks) -> Self {
        Self { phase: Phase::Poll, granted: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();
        if self.role.phase == Phase::Vote {
            assert_ne!(self.term, 0, "Candidates can't campaign in term 0");
            debug_assert_eq!(Some(self.id), self.log.get_term().1, "Log vote does not match self");
        }
    }

    /// Transitions the candidate to a follower in the current term, following
    /// the given leader if any. We either lost the election, or must yield to
    /// another candidate's vote request.
    fn into_follower(self, leader: Option<NodeID>) -> RawNode<Follower> {
        match leader {
            Some(leader) => info!("Lost election, following leader {leader} in term {}", self.term),
            None => info!("Abandoning election in term {}", self.term),
        }
        let voted_for = self.log.get_term().1;
        let election_timeout = self.gen_election_timeout();
        self.into_role(Follower::new(leader, voted_for, election_timeout))
    }

    /// Transitions into a leaderless follower in a later term.
    fn into_term(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "Term regression {} → {}", self.term, term);
        info!("Discovered new term {term}");
        self.term = term;
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, None, election_timeout)))
    }

    /// Transitions the candidate to a leader, and appends a noop entry to
    /// commit entries from previous terms.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let mut peers = self.log.configuration().peers(self.id);
        peers.extend(self.log.latest_configuration().peers(self.id));
        peers.sort();
        peers.dedup();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));
        node.propose(Payload::Noop)?;
        node.maybe_commit_and_apply()?;
        Ok(node)
    }

    /// Polls voters to see if we could win an election in the next term,
    /// without changing our term.
    pub(super) fn poll(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Polling voters for term {term} election");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.granted.insert(self.id);
        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast_voters(Message::Poll { term, last_index, last_term })
    }

    /// Campaigns for leadership in the next term, voting for ourself.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.phase = Phase::Vote;
        self.role.granted.insert(self.id);
        self.term = term;
        self.log.set_term(term, Some(self.id))?;
        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast_voters(Message::Vote { last_index, last_term })
    }

    /// Moves on to the next phase if a quorum of voters has granted the
    /// current one: from polling to campaigning, and from campaigning to
    /// leadership.
    pub(super) fn check_election(mut self) -> Result<Node> {
        let configuration = self.log.configuration();
        let granted = self.role.granted.iter().filter(|id| configuration.is_voter(**id)).count();
        if granted < configuration.quorum_size() {
            return Ok(self.into());
        }
        match self.role.phase {
            Phase::Poll => {
                self.campaign()?;
                self.check_election()
            }
            Phase::Vote => Ok(self.into_leader()?.into()),
        }
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
        // follower in it and step the message. If the message is from a
        // leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_term(msg.term)?.step(msg);
        }

        match msg.message {
            // If we receive a message from a leader in our term, we lost the
            // election. Follow it and step the message.
            Message::Append { .. }
            | Message::Install { .. }
            | Message::Configure { .. }
            | Message::Transfer { .. } => {
                return self.into_follower(Some(msg.from)).step(msg);
            }

            // While polling we haven't voted in this term, so yield to the
            // other candidate and let the follower decide on the vote. When
            // campaigning, we've voted for ourself.
            Message::Vote { .. } if self.role.phase == Phase::Poll => {
                return self.into_follower(None).step(msg);
            }
            Message::Vote { .. } => {
                self.send(msg.from, Message::VoteResponse { granted: false })?;
            }

            // Another candidate is polling. We're not following a leader
            // either, so grant it if its log is up-to-date.
            Message::Poll { term, last_index, last_term } => {
                let granted = term > self.term && self.is_log_current(last_index, last_term);
                self.send(msg.from, Message::PollResponse { granted })?;
            }

            Message::PollResponse { granted } if self.role.phase == Phase::Poll => {
                debug!("Poll from {} granted={granted}", msg.from);
                if granted {
                    self.role.granted.insert(msg.from);
                    return self.check_election();
                }
            }

            Message::VoteResponse { granted } if self.role.phase == Phase::Vote => {
                debug!("Vote from {} granted={granted}", msg.from);
                if granted {
                    self.role.granted.insert(msg.from);
                    return self.check_election();
                }
            }

            Message::ClientRequest { id, request: _ } => {
                let response = Err(Error::NotLeader(None));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            Message::ClientResponse { .. } => panic!("Unexpected client response to candidate"),

            // Late responses from a previous phase or role are ignored.
            Message::PollResponse { .. }
            | Message::VoteResponse { .. }
            | Message::AppendResponse { .. }
            | Message::ConfigureResponse { .. }
            | Message::InstallResponse { .. }
            | Message::TransferResponse { .. }
            | Message::Failure { .. } => {}
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the election times out, start a
    /// new one, polling first if pre-voting is enabled.
    pub fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            if self.opts.pre_vote {
                self.poll()?;
            } else {
                self.campaign()?;
            }
            return self.check_election();
        }
        Ok(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{drain, envelope, setup, test_options};
    use super::*;
    use crate::raft::{Entry, NodeRole};
    use pretty_assertions::assert_eq;

    /// Sets up a polling candidate 1 in a 3-node cluster, after following
    /// leader 2 in term 1.
    fn setup_candidate() -> (Node, crossbeam::channel::Receiver<Envelope>) {
        let (mut node, rx) = setup(1, vec![1, 2, 3], test_options());
        let heartbeat =
            Message::Append { prev_index: 0, prev_term: 0, entries: vec![], commit_index: 0 };
        node = node.step(envelope(2, 1, 1, heartbeat)).unwrap();
        for _ in 0..10 {
            node = node.tick().unwrap();
        }
        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.term(), 1);
        drain(&rx);
        (node, rx)
    }

    #[test]
    fn poll_quorum_starts_campaign() {
        let (mut node, rx) = setup_candidate();
        node = node.step(envelope(2, 1, 1, Message::PollResponse { granted: false })).unwrap();
        assert_eq!(node.term(), 1);
        node = node.step(envelope(3, 1, 1, Message::PollResponse { granted: true })).unwrap();
        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.log().get_term(), (2, Some(1)));
        let vote = Message::Vote { last_index: 0, last_term: 0 };
        assert_eq!(drain(&rx), vec![envelope(1, 2, 2, vote.clone()), envelope(1, 3, 2, vote)]);
    }

    #[test]
    fn vote_quorum_becomes_leader() {
        let (mut node, rx) = setup_candidate();
        node = node.step(envelope(2, 1, 1, Message::PollResponse { granted: true })).unwrap();
        drain(&rx);
        // A late poll response is dropped, and doesn't count as a vote.
        node = node.step(envelope(3, 1, 1, Message::PollResponse { granted: true })).unwrap();
        assert_eq!(node.role(), NodeRole::Candidate);
        node = node.step(envelope(3, 1, 2, Message::VoteResponse { granted: true })).unwrap();
        assert_eq!(node.role(), NodeRole::Leader);
        assert_eq!(node.term(), 2);

        // The leader appends and replicates a noop entry.
        let noop = Entry { index: 1, term: 2, payload: Payload::Noop };
        let append =
            Message::Append { prev_index: 0, prev_term: 0, entries: vec![noop], commit_index: 0 };
        assert_eq!(drain(&rx), vec![envelope(1, 2, 2, append.clone()), envelope(1, 3, 2, append)]);
    }

    #[test]
    fn append_in_term_follows_leader() {
        let (mut node, _rx) = setup_candidate();
        node = node.step(envelope(2, 1, 1, Message::PollResponse { granted: true })).unwrap();
        let heartbeat =
            Message::Append { prev_index: 0, prev_term: 0, entries: vec![], commit_index: 0 };
        node = node.step(envelope(3, 1, 2, heartbeat)).unwrap();
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.leader(), Some(3));
        assert_eq!(node.log().get_term(), (2, Some(1)));
    }

    #[test]
    fn polling_candidate_yields_vote() {
        let (mut node, rx) = setup_candidate();
        node = node.step(envelope(3, 1, 1, Message::Vote { last_index: 0, last_term: 0 })).unwrap();
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.log().get_term(), (1, Some(3)));
        assert_eq!(drain(&rx), vec![envelope(1, 3, 1, Message::VoteResponse { granted: true })]);
    }

    #[test]
    fn campaigning_candidate_rejects_votes() {
        let (mut node, rx) = setup_candidate();
        node = node.step(envelope(2, 1, 1, Message::PollResponse { granted: true })).unwrap();
        drain(&rx);
        node = node.step(envelope(3, 1, 2, Message::Vote { last_index: 0, last_term: 0 })).unwrap();
        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(drain(&rx), vec![envelope(1, 3, 2, Message::VoteResponse { granted: false })]);
    }

    #[test]
    fn election_timeout_restarts_poll() {
        let (mut node, rx) = setup_candidate();
        for _ in 0..10 {
            node = node.tick().unwrap();
        }
        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.term(), 1);
        let poll = Message::Poll { term: 2, last_index: 0, last_term: 0 };
        assert_eq!(drain(&rx), vec![envelope(1, 2, 1, poll.clone()), envelope(1, 3, 1, poll)]);
    }
}
