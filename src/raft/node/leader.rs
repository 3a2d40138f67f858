use super::super::{
    quorum_value, snapshot, Configuration, Envelope, Index, Member, Message, Payload, Request,
    RequestID, Response, RpcKind,
};
use super::follower::Handover;
use super::{Follower, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::errinput;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, info, warn};
use std::collections::HashMap;

/// Peer replication progress.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Progress {
    /// The next index to replicate to the peer.
    pub(super) next: Index,
    /// The last index where the peer's log is known to match ours.
    pub(super) matched: Index,
    /// Ticks since the last response from the peer.
    pub(super) since_ack: Ticks,
    /// Consecutive request failures, for log throttling.
    pub(super) failures: u64,
    /// The peer's last reported configuration version.
    pub(super) config_version: u64,
    /// An outbound snapshot transfer, if any. Log replication to the peer is
    /// paused until it completes.
    pub(super) snapshot: Option<snapshot::Sender>,
}

impl Progress {
    fn new(next: Index) -> Self {
        Self { next, matched: 0, since_ack: 0, failures: 0, config_version: 0, snapshot: None }
    }
}

/// A pending client request, responded to once its entry is applied.
#[derive(Clone, Debug, PartialEq)]
struct Write {
    /// The node which submitted the request.
    from: NodeID,
    /// The request ID.
    id: RequestID,
}

/// A pending leadership transfer.
#[derive(Clone, Debug, PartialEq)]
struct Transfer {
    /// The node to hand leadership to.
    target: NodeID,
    /// The node which submitted the transfer request.
    from: NodeID,
    /// The request ID.
    id: RequestID,
    /// Ticks since the transfer started.
    elapsed: Ticks,
    /// Whether Message::Transfer has been sent to the target.
    sent: bool,
}

// A leader serves requests and replicates the log to followers and learners.
#[derive(Clone, Debug, PartialEq)]
pub struct Leader {
    /// Peer replication progress, for all members of the active and latest
    /// configurations.
    pub(super) progress: HashMap<NodeID, Progress>,
    /// Keeps track of pending client requests, keyed by log index. These are
    /// added when the entry is proposed and appended to the leader's log, and
    /// removed when the entry is applied to the state machine, sending the
    /// result to the waiting client.
    ///
    /// If the leader loses leadership, all pending requests fail with
    /// Error::NotLeader.
    writes: HashMap<Index, Write>,
    /// A pending leadership transfer. Client requests are rejected with
    /// Error::Abort meanwhile.
    transfer: Option<Transfer>,
    /// Number of ticks since last periodic heartbeat.
    since_heartbeat: Ticks,
    /// The ID of the next outbound snapshot transfer.
    next_snapshot_id: snapshot::SnapshotID,
}

impl Leader {
    /// Creates a new leader role.
    pub fn new(peers: Vec<NodeID>, last_index: Index) -> Self {
        let progress = peers.into_iter().map(|p| (p, Progress::new(last_index + 1))).collect();
        Self {
            progress,
            writes: HashMap::new(),
            transfer: None,
            since_heartbeat: 0,
            next_snapshot_id: 1,
        }
    }
}

impl Role for Leader {}

/// The outcome of a snapshot chunk acknowledgement.
enum Chunked {
    Ignore,
    Restart,
    Next,
    Complete(Index),
}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();

        assert_ne!(self.term, 0, "Leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "Log vote does not match self");
    }

    /// Transitions the leader into a follower, either because we discovered a
    /// new term, or because we lost our quorum or membership in this term.
    ///
    /// A pending leadership transfer succeeds if the new term came from the
    /// transfer target. If it came from another node, the target may still
    /// win the term, so the follower responds once it learns the leader.
    /// Otherwise, the transfer is aborted. Pending client requests fail with
    /// Error::NotLeader, pointing to the new leader if known.
    fn step_down(
        mut self,
        term: Term,
        sender: Option<NodeID>,
        leader: Option<NodeID>,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "Term regression {} → {}", self.term, term);

        let mut handover = None;
        if let Some(transfer) = self.role.transfer.take() {
            let Transfer { target, from, id, .. } = transfer;
            match sender {
                Some(sender) if term > self.term && sender == target => {
                    info!("Leadership transferred to {sender}");
                    let response = Ok(Response::Transfer(sender));
                    self.send(from, Message::ClientResponse { id, response })?;
                }
                Some(_) if term > self.term => handover = Some(Handover { target, from, id }),
                _ => self.send(from, Message::ClientResponse { id, response: Err(Error::Abort) })?,
            }
        }

        for (_, write) in std::mem::take(&mut self.role.writes).into_iter().sorted_by_key(|(i, _)| *i)
        {
            let response = Err(Error::NotLeader(leader));
            self.send(write.from, Message::ClientResponse { id: write.id, response })?;
        }

        let mut voted_for = Some(self.id);
        if term > self.term {
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            voted_for = None;
        }
        let election_timeout = self.gen_election_timeout();
        let mut follower = Follower::new(None, voted_for, election_timeout);
        follower.handover = handover;
        Ok(self.into_role(follower))
    }

    /// Steps down if we're no longer a voter in the active configuration.
    /// The new commit index is propagated first, so the remaining voters
    /// activate the configuration and elect a new leader among themselves.
    fn into_member_role(mut self) -> Result<Node> {
        if self.is_voter() {
            return Ok(self.into());
        }
        let version = self.log.configuration().version;
        info!("Not a voter in configuration version {version}, stepping down");
        self.heartbeat()?;
        let term = self.term;
        Ok(self.step_down(term, None, None)?.into_learner().into())
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
        // follower in it and step the message. If the message is from the new
        // leader, stepping it will follow the leader.
        if msg.term > self.term {
            let leader = match msg.message {
                Message::Append { .. }
                | Message::Install { .. }
                | Message::Configure { .. }
                | Message::Transfer { .. } => Some(msg.from),
                _ => None,
            };
            return self.step_down(msg.term, Some(msg.from), leader)?.step(msg);
        }

        // Any response from a peer shows that it's reachable.
        let is_response = msg.message.response_kind().is_some()
            && !matches!(msg.message, Message::Failure { .. });
        if is_response {
            if let Some(progress) = self.role.progress.get_mut(&msg.from) {
                progress.since_ack = 0;
                progress.failures = 0;
            }
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::Append { .. }
            | Message::Install { .. }
            | Message::Configure { .. }
            | Message::Transfer { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // We're the leader, so don't grant polls or votes in this term. A
            // poll shows that the peer is alive again.
            Message::Poll { .. } => {
                if let Some(progress) = self.role.progress.get_mut(&msg.from) {
                    progress.failures = 0;
                }
                self.send(msg.from, Message::PollResponse { granted: false })?;
            }
            Message::Vote { .. } => {
                self.send(msg.from, Message::VoteResponse { granted: false })?;
            }

            // A peer appended our entries, or rejected them because it
            // doesn't have the base entry. On success, record its progress
            // and attempt to commit. On rejection, back off and retry from an
            // earlier entry, skipping past the peer's last index.
            Message::AppendResponse { success, match_index, last_index, config_version } => {
                let (our_last_index, _) = self.log.get_last_index();
                let Some(progress) = self.role.progress.get_mut(&msg.from) else {
                    return Ok(self.into());
                };
                progress.config_version = config_version;
                let mut commit = false;
                if success {
                    assert!(match_index <= our_last_index, "Peer matched beyond last index");
                    if match_index > progress.matched {
                        progress.matched = match_index;
                        progress.next = progress.next.max(match_index + 1);
                        commit = true;
                    }
                } else {
                    progress.next =
                        (progress.next - 1).min(last_index + 1).max(progress.matched + 1);
                }
                let resend = !success || progress.next <= our_last_index;

                if commit {
                    self.maybe_commit_and_apply()?;
                }
                if resend {
                    self.send_log(msg.from)?;
                }
                self.maybe_configure(msg.from)?;
                self.maybe_send_transfer()?;
            }

            Message::InstallResponse { success, snapshot_id, chunk_index } => {
                let chunk_size = self.opts.snapshot_chunk_size;
                let outcome = match self.role.progress.get_mut(&msg.from) {
                    Some(Progress { snapshot: Some(sender), .. })
                        if sender.id == snapshot_id && sender.chunk as u64 == chunk_index =>
                    {
                        if !success {
                            Chunked::Restart
                        } else if sender.chunk + 1 < sender.snapshot.chunk_count(chunk_size) {
                            sender.chunk += 1;
                            sender.since_ack = 0;
                            Chunked::Next
                        } else {
                            Chunked::Complete(sender.snapshot.index)
                        }
                    }
                    _ => Chunked::Ignore,
                };
                match outcome {
                    Chunked::Ignore => debug!("Ignoring stale snapshot response from {}", msg.from),
                    Chunked::Restart => {
                        warn!("Snapshot {snapshot_id} rejected by {}, restarting", msg.from);
                        self.start_snapshot(msg.from)?;
                    }
                    Chunked::Next => self.send_chunk(msg.from)?,
                    Chunked::Complete(index) => {
                        info!("Snapshot {snapshot_id} at {index} sent to {}", msg.from);
                        if let Some(progress) = self.role.progress.get_mut(&msg.from) {
                            progress.snapshot = None;
                            progress.matched = progress.matched.max(index);
                            progress.next = progress.matched + 1;
                        }
                        self.maybe_commit_and_apply()?;
                        self.send_log(msg.from)?;
                    }
                }
            }

            Message::ConfigureResponse { success: _, version } => {
                if let Some(progress) = self.role.progress.get_mut(&msg.from) {
                    progress.config_version = version;
                }
            }

            // The transfer target refused, so abort the transfer.
            Message::TransferResponse { success } => {
                if !success && self.role.transfer.as_ref().is_some_and(|t| t.target == msg.from) {
                    warn!("Transfer target {} refused leadership", msg.from);
                    if let Some(transfer) = self.role.transfer.take() {
                        let response = Err(Error::Abort);
                        self.send(transfer.from, Message::ClientResponse { id: transfer.id, response })?;
                    }
                }
            }

            // Votes and polls can come in after we won the election.
            Message::PollResponse { .. } | Message::VoteResponse { .. } => {}

            // A request to a peer failed. Log throttled warnings, and resend a
            // lost transfer request when the target is caught up.
            Message::Failure { rpc, failure } => {
                if let Some(progress) = self.role.progress.get_mut(&msg.from) {
                    progress.failures += 1;
                    if progress.failures <= 3 || progress.failures % 100 == 0 {
                        warn!(
                            "{rpc} request to {} failed ({failure:?}), {} consecutive failures",
                            msg.from, progress.failures
                        );
                    }
                }
                if let Some(transfer) = self.role.transfer.as_mut() {
                    if rpc == RpcKind::Transfer && transfer.target == msg.from {
                        transfer.sent = false;
                    }
                }
            }

            Message::ClientRequest { id, request: Request::Write(command) } => {
                if self.role.transfer.is_some() {
                    let response = Err(Error::Abort);
                    self.send(msg.from, Message::ClientResponse { id, response })?;
                } else {
                    let index = self.propose(Payload::Command(command))?;
                    self.role.writes.insert(index, Write { from: msg.from, id });
                    self.maybe_commit_and_apply()?;
                }
            }

            Message::ClientRequest { id, request: Request::Reconfigure(members) } => {
                self.reconfigure(msg.from, id, members)?;
            }

            Message::ClientRequest { id, request: Request::Transfer(target) } => {
                self.transfer(msg.from, id, target)?;
            }

            // Leaders never proxy client requests, so we don't expect to see
            // responses from other nodes.
            Message::ClientResponse { .. } => panic!("Unexpected client response to leader"),
        }

        self.into_member_role()
    }

    /// Processes a logical clock tick.
    pub fn tick(mut self) -> Result<Node> {
        self.assert();

        for progress in self.role.progress.values_mut() {
            progress.since_ack = progress.since_ack.saturating_add(1);
            if let Some(sender) = progress.snapshot.as_mut() {
                sender.since_ack = sender.since_ack.saturating_add(1);
            }
        }

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }

        // Restart stalled snapshot transfers.
        let max_timeout = self.opts.max_election_timeout();
        let stalled = (self.role.progress.iter())
            .filter(|(_, p)| p.snapshot.as_ref().is_some_and(|s| s.since_ack >= max_timeout))
            .map(|(id, _)| *id)
            .sorted()
            .collect_vec();
        for peer in stalled {
            warn!("Snapshot transfer to {peer} stalled, restarting");
            self.start_snapshot(peer)?;
        }

        // Abort leadership transfers that don't complete within an election
        // timeout.
        if let Some(transfer) = self.role.transfer.as_mut() {
            transfer.elapsed = transfer.elapsed.saturating_add(1);
            if transfer.elapsed >= max_timeout {
                warn!("Leadership transfer to {} timed out", transfer.target);
                if let Some(transfer) = self.role.transfer.take() {
                    let response = Err(Error::Abort);
                    self.send(transfer.from, Message::ClientResponse { id: transfer.id, response })?;
                }
            }
        }

        // Step down if we haven't heard from a quorum in an election timeout.
        if self.opts.check_quorum && !self.has_quorum_contact() {
            warn!("Lost contact with quorum in term {}, stepping down", self.term);
            let term = self.term;
            return Ok(self.step_down(term, None, None)?.into());
        }

        Ok(self.into())
    }

    /// Returns true if a quorum of voters, including ourself, has responded
    /// within the maximum election timeout.
    fn has_quorum_contact(&self) -> bool {
        let configuration = self.log.configuration();
        let max_timeout = self.opts.max_election_timeout();
        let contacted = (configuration.voters().into_iter())
            .filter(|id| {
                *id == self.id
                    || self.role.progress.get(id).is_some_and(|p| p.since_ack < max_timeout)
            })
            .count();
        contacted >= configuration.quorum_size()
    }

    /// Sends heartbeats to all peers. These are appends with any pending
    /// entries, or the in-flight chunk for peers receiving a snapshot.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.role.progress.keys().copied().sorted().collect_vec() {
            match self.role.progress.get(&peer) {
                Some(Progress { snapshot: Some(_), .. }) => self.send_chunk(peer)?,
                _ => self.send_log(peer)?,
            }
        }
        Ok(())
    }

    /// Proposes a payload for consensus by appending it to our log and
    /// replicating it to peers. If successful, it will eventually be committed
    /// and applied to the state machine.
    pub(super) fn propose(&mut self, payload: Payload) -> Result<Index> {
        let is_configuration = matches!(payload, Payload::Configuration(_));
        let index = self.log.append(payload)?;
        if is_configuration {
            self.update_progress()?;
        }
        for peer in self.role.progress.keys().copied().sorted().collect_vec() {
            self.send_log(peer)?;
        }
        Ok(index)
    }

    /// Tracks progress for all members of the active and latest
    /// configurations. Removed peers are sent a final append, so they learn
    /// that their removal committed.
    fn update_progress(&mut self) -> Result<()> {
        let next = self.log.get_last_index().0 + 1;
        let mut peers = self.log.configuration().peers(self.id);
        peers.extend(self.log.latest_configuration().peers(self.id));

        let removed = (self.role.progress.keys().copied())
            .filter(|id| !peers.contains(id))
            .sorted()
            .collect_vec();
        for peer in removed {
            info!("Removing peer {peer} from replication");
            self.send_log(peer)?;
            self.role.progress.remove(&peer);
        }
        for peer in peers {
            self.role.progress.entry(peer).or_insert_with(|| {
                info!("Adding peer {peer} to replication");
                Progress::new(next)
            });
        }
        Ok(())
    }

    /// Commits any new log entries that have been replicated to a quorum of
    /// voters in the active configuration, and applies them to the state
    /// machine. Configuration changes take effect once committed, so commits
    /// stop at each configuration entry and the entries after it must reach
    /// a quorum of the new configuration.
    pub(super) fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        let version = self.log.configuration().version;
        let (last_index, _) = self.log.get_last_index();
        let mut commit_index = self.log.get_commit_index().0;
        loop {
            let quorum_index = quorum_value(
                (self.log.configuration().voters().into_iter())
                    .map(|id| match id == self.id {
                        true => last_index,
                        false => self.role.progress.get(&id).map_or(0, |p| p.matched),
                    })
                    .collect(),
            );

            // If the commit index doesn't advance, we're done. We don't assert
            // on this, since the quorum value may regress e.g. following a
            // leader change where peers are initialized with match index 0.
            if quorum_index <= commit_index {
                break;
            }

            // We can only safely commit an entry from our own term (see figure
            // 8 in Raft paper).
            match self.log.term_at(quorum_index)? {
                Some(term) if term == self.term => {}
                Some(_) => break,
                None => panic!("Commit index {quorum_index} missing"),
            }
            let index = match self.log.next_configuration_index(commit_index) {
                Some(index) if index < quorum_index => index,
                _ => quorum_index,
            };
            commit_index = self.log.commit(index)?;
        }

        // Apply entries and respond to clients.
        Self::maybe_apply_with(&mut self.log, &mut self.state, |index, response| -> Result<()> {
            if let Some(write) = self.role.writes.remove(&index) {
                self.node_tx.send(Envelope {
                    from: self.id,
                    to: write.from,
                    term: self.term,
                    message: Message::ClientResponse { id: write.id, response },
                })?;
            }
            Ok(())
        })?;
        self.maybe_compact()?;

        if self.log.configuration().version != version {
            info!("Configuration version {} is now active", self.log.configuration().version);
            self.update_progress()?;
        }
        Ok(commit_index)
    }

    /// Sends pending log entries to a peer, up to max_append_entries, and
    /// optimistically advances its next index. If the base entry has been
    /// compacted, a snapshot transfer is started instead.
    fn send_log(&mut self, peer: NodeID) -> Result<()> {
        let next = match self.role.progress.get(&peer) {
            Some(Progress { snapshot: Some(_), .. }) | None => return Ok(()),
            Some(progress) => progress.next,
        };

        let prev_index = next - 1;
        let prev_term = match self.log.term_at(prev_index)? {
            Some(term) if prev_index >= self.log.get_snapshot_index().0 => term,
            _ => return self.start_snapshot(peer),
        };

        let entries = (self.log.scan(next..))
            .take(self.opts.max_append_entries)
            .collect::<Result<Vec<_>>>()?;
        if let Some(progress) = self.role.progress.get_mut(&peer) {
            progress.next = prev_index + entries.len() as Index + 1;
        }

        let commit_index = self.log.get_commit_index().0;
        debug!("Replicating {} entries at base {prev_index} to {peer}", entries.len());
        self.send(peer, Message::Append { prev_index, prev_term, entries, commit_index })
    }

    /// Starts a new snapshot transfer to a peer, from chunk 0.
    fn start_snapshot(&mut self, peer: NodeID) -> Result<()> {
        let Some(snapshot) = self.log.get_snapshot()? else {
            panic!("No snapshot to send to {peer}");
        };
        let id = self.role.next_snapshot_id;
        self.role.next_snapshot_id += 1;
        info!("Sending snapshot {id} at {}@{} to {peer}", snapshot.index, snapshot.term);
        match self.role.progress.get_mut(&peer) {
            Some(progress) => progress.snapshot = Some(snapshot::Sender::new(id, snapshot)),
            None => return Ok(()),
        }
        self.send_chunk(peer)
    }

    /// Sends the in-flight snapshot chunk to a peer.
    fn send_chunk(&mut self, peer: NodeID) -> Result<()> {
        let chunk_size = self.opts.snapshot_chunk_size;
        let Some(Progress { snapshot: Some(sender), .. }) = self.role.progress.get(&peer) else {
            return Ok(());
        };
        let message = Message::Install {
            snapshot_id: sender.id,
            chunk_index: sender.chunk as u64,
            data: sender.snapshot.chunk(sender.chunk, chunk_size).to_vec(),
            last_index: sender.snapshot.index,
            last_term: sender.snapshot.term,
            configuration: sender.snapshot.configuration.clone(),
            done: sender.chunk + 1 >= sender.snapshot.chunk_count(chunk_size),
        };
        self.send(peer, message)
    }

    /// Pushes the active configuration to a member that reported an older
    /// configuration version.
    fn maybe_configure(&mut self, peer: NodeID) -> Result<()> {
        let configuration = self.log.configuration();
        let Some(progress) = self.role.progress.get(&peer) else {
            return Ok(());
        };
        if progress.config_version >= configuration.version || !configuration.contains(peer) {
            return Ok(());
        }
        debug!("Pushing configuration version {} to {peer}", configuration.version);
        let configuration = configuration.clone();
        self.send(peer, Message::Configure { configuration })
    }

    /// Sends Message::Transfer to a pending transfer's target, once it has
    /// caught up with our log.
    fn maybe_send_transfer(&mut self) -> Result<()> {
        let (last_index, last_term) = self.log.get_last_index();
        let Some(transfer) = self.role.transfer.as_mut() else {
            return Ok(());
        };
        let target = transfer.target;
        let caught_up = self.role.progress.get(&target).is_some_and(|p| p.matched == last_index);
        if transfer.sent || !caught_up {
            return Ok(());
        }
        transfer.sent = true;
        info!("Transfer target {target} caught up at {last_index}, handing over leadership");
        self.send(target, Message::Transfer { last_index, last_term })
    }

    /// Proposes a membership change. Only a single member may change at a
    /// time, and not before we've committed an entry in our term or while
    /// another change is pending. Responds once the change commits.
    fn reconfigure(&mut self, from: NodeID, id: RequestID, members: Vec<Member>) -> Result<()> {
        let active = self.log.configuration().clone();
        let response = if self.role.transfer.is_some() {
            Err(Error::Abort)
        } else if self.log.pending_configuration().is_some()
            || self.log.get_commit_index().1 != self.term
        {
            Err(Error::ConflictingReconfigure)
        } else if active.has_members(&members) {
            Ok(Response::Reconfigure(active.version))
        } else if let Err(error) = active.validate_change(&members) {
            Err(error)
        } else {
            let configuration = Configuration::new(active.version + 1, members);
            info!("Proposing configuration {configuration:?}");
            let index = self.propose(Payload::Configuration(configuration))?;
            self.role.writes.insert(index, Write { from, id });
            self.maybe_commit_and_apply()?;
            return Ok(());
        };
        self.send(from, Message::ClientResponse { id, response })
    }

    /// Starts a leadership transfer to the given voter, or the most caught-up
    /// voter (lowest ID on ties). If the target is behind, it's caught up
    /// first.
    fn transfer(&mut self, from: NodeID, id: RequestID, target: Option<NodeID>) -> Result<()> {
        let configuration = self.log.configuration();
        let voters = (configuration.peers(self.id).into_iter())
            .filter(|peer| configuration.is_voter(*peer))
            .collect_vec();
        let target: Result<NodeID> = match target {
            _ if self.role.transfer.is_some() => Err(Error::Abort),
            Some(target) if voters.contains(&target) => Ok(target),
            Some(target) => errinput!("node {target} is not a voting peer"),
            None => (voters.iter().copied())
                .max_by_key(|peer| {
                    let matched = self.role.progress.get(peer).map_or(0, |p| p.matched);
                    (matched, std::cmp::Reverse(*peer))
                })
                .ok_or(Error::InvalidInput("no voting peers to transfer to".into())),
        };
        let target = match target {
            Ok(target) => target,
            Err(error) => {
                return self.send(from, Message::ClientResponse { id, response: Err(error) })
            }
        };

        info!("Transferring leadership to {target}");
        self.role.transfer = Some(Transfer { target, from, id, elapsed: 0, sent: false });
        self.maybe_send_transfer()?;
        if self.role.transfer.as_ref().is_some_and(|t| !t.sent) {
            self.send_log(target)?;
        }
        Ok(())
    }
}
