//! A deterministic network simulation for Raft clusters.
//!
//! `Cluster` runs a set of nodes in-process, with a controllable network:
//! outbound messages are queued at their destination, and only delivered when
//! explicitly stepped via `deliver_next` or `deliver_all`. Time only advances
//! via `tick`. Messages can be dropped, and pairs of nodes partitioned, in
//! which case the sender sees a `Failure::Timeout` rather than silent loss.
//! Every delivered message is round-tripped through its binary encoding.
//!
//! Each node gets a fixed election timeout, offset by its ID from the start
//! of the configured range, so elections are deterministic: lower IDs time out
//! first. The cluster asserts election safety on every step, panicking if two
//! nodes ever act as leader in the same term.

use super::transport::{self, Dispatcher};
use super::{
    Configuration, Entry, Envelope, Failure, Index, Log, Member, Message, Node, NodeID, NodeRole,
    Options, Payload, Request, RequestID, Response, RpcKind, State, Status, Term,
};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::storage;

use crossbeam::channel::{Receiver, Sender};
use itertools::Itertools as _;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A state machine that records applied commands, and echoes them back as
/// results. It can be cloned, and the clone inspected while the node owns the
/// original.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    applied: Arc<Mutex<Applied>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Applied {
    index: Index,
    commands: Vec<Vec<u8>>,
}

impl encoding::Value for Applied {}

impl Recorder {
    /// Creates a new recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the applied commands, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.lock().commands.clone()
    }

    /// Returns the applied index.
    pub fn applied_index(&self) -> Index {
        self.lock().index
    }

    // A panic while holding the lock is already a test failure.
    fn lock(&self) -> MutexGuard<'_, Applied> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State for Recorder {
    fn get_applied_index(&self) -> Index {
        self.applied_index()
    }

    fn apply(&mut self, entry: Entry) -> Result<Vec<u8>> {
        let mut applied = self.lock();
        assert_eq!(entry.index, applied.index + 1, "applied out of order");
        applied.index = entry.index;
        match entry.payload {
            Payload::Command(command) => {
                applied.commands.push(command.clone());
                Ok(command)
            }
            Payload::Noop | Payload::Configuration(_) => Ok(Vec::new()),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.lock().encode())
    }

    fn restore(&mut self, index: Index, data: &[u8]) -> Result<()> {
        let restored = Applied::decode(data)?;
        if restored.index != index {
            return Err(Error::InvalidData(format!(
                "snapshot at {} restored at {index}",
                restored.index
            )));
        }
        *self.lock() = restored;
        Ok(())
    }
}

/// A simulated node, with its network endpoints.
struct Host {
    /// The node. Only None while it's being stepped, or if stepping failed.
    node: Option<Node>,
    /// Outbound messages from the node.
    node_rx: Receiver<Envelope>,
    /// Inbound messages for the node, via the dispatcher.
    inbox_tx: Sender<Envelope>,
    inbox_rx: Receiver<Envelope>,
    dispatcher: Dispatcher,
    /// Messages in flight to the node.
    queue: VecDeque<Envelope>,
    /// The node's state machine.
    recorder: Recorder,
}

/// A simulated Raft cluster.
pub struct Cluster {
    opts: Options,
    nodes: BTreeMap<NodeID, Host>,
    /// Directed links that drop messages, as (from, to).
    partitions: HashSet<(NodeID, NodeID)>,
    /// Client responses that haven't been taken yet.
    responses: HashMap<RequestID, Result<Response>>,
    /// All messages sent by nodes, in order.
    trace: Vec<Envelope>,
    /// The leader seen in each term.
    leaders: HashMap<Term, NodeID>,
    /// Entries appended by each term's leader, by (term, index).
    leader_entries: HashMap<(Term, Index), Entry>,
    next_request_id: u64,
}

impl Cluster {
    /// Creates a cluster with voters 1 to size, bootstrapped with an initial
    /// configuration containing all of them.
    pub fn new(size: NodeID, opts: Options) -> Result<Self> {
        let mut cluster = Self {
            opts,
            nodes: BTreeMap::new(),
            partitions: HashSet::new(),
            responses: HashMap::new(),
            trace: Vec::new(),
            leaders: HashMap::new(),
            leader_entries: HashMap::new(),
            next_request_id: 0,
        };
        let members = (1..=size).map(Member::voter).collect_vec();
        for id in 1..=size {
            cluster.start(id, Some(Configuration::new(1, members.clone())))?;
        }
        Ok(cluster)
    }

    /// Adds a fresh node with an empty log. It runs as a learner until a
    /// leader adds it to the cluster.
    pub fn add_node(&mut self, id: NodeID) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::InvalidInput(format!("node {id} already exists")));
        }
        self.start(id, None)
    }

    fn start(&mut self, id: NodeID, configuration: Option<Configuration>) -> Result<()> {
        let mut log = Log::new(Box::new(storage::Memory::new()))?;
        if let Some(configuration) = configuration {
            log.bootstrap(configuration)?;
        }
        let start = self.opts.election_timeout_range.start.saturating_add(id.saturating_sub(1));
        let opts = Options {
            election_timeout_range: start..start.saturating_add(1),
            ..self.opts.clone()
        };

        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (inbox_tx, inbox_rx) = crossbeam::channel::unbounded();
        let recorder = Recorder::new();
        let node = Node::new(id, log, Box::new(recorder.clone()), node_tx, opts)?;
        let host = Host {
            node: Some(node),
            node_rx,
            dispatcher: Dispatcher::for_node(inbox_tx.clone()),
            inbox_tx,
            inbox_rx,
            queue: VecDeque::new(),
            recorder,
        };
        self.nodes.insert(id, host);
        self.observe(id)?;
        self.flush(id)
    }

    /// Returns the node IDs, in order.
    pub fn ids(&self) -> Vec<NodeID> {
        self.nodes.keys().copied().collect()
    }

    fn host(&self, id: NodeID) -> Result<&Host> {
        self.nodes.get(&id).ok_or_else(|| Error::InvalidInput(format!("unknown node {id}")))
    }

    fn host_mut(&mut self, id: NodeID) -> Result<&mut Host> {
        self.nodes.get_mut(&id).ok_or_else(|| Error::InvalidInput(format!("unknown node {id}")))
    }

    /// Returns a node.
    pub fn node(&self, id: NodeID) -> Result<&Node> {
        self.host(id)?.node.as_ref().ok_or_else(|| Error::InvalidData(format!("node {id} failed")))
    }

    fn node_mut(&mut self, id: NodeID) -> Result<&mut Node> {
        self.host_mut(id)?.node.as_mut().ok_or_else(|| Error::InvalidData(format!("node {id} failed")))
    }

    /// Returns a node's status.
    pub fn status(&mut self, id: NodeID) -> Result<Status> {
        self.node_mut(id)?.status()
    }

    /// Returns a node's log.
    pub(crate) fn log(&mut self, id: NodeID) -> Result<&mut Log> {
        Ok(self.node_mut(id)?.log())
    }

    /// Returns a node's state machine.
    pub fn recorder(&self, id: NodeID) -> Result<Recorder> {
        Ok(self.host(id)?.recorder.clone())
    }

    /// Returns the leader with the highest term, if any. A partitioned node
    /// may still consider itself leader in an older term.
    pub fn leader(&self) -> Option<NodeID> {
        (self.nodes.values())
            .filter_map(|host| host.node.as_ref())
            .filter(|node| node.role() == NodeRole::Leader)
            .max_by_key(|node| node.term())
            .map(|node| node.id())
    }

    /// Returns all messages sent so far, including injected failures.
    pub fn trace(&self) -> &[Envelope] {
        &self.trace
    }

    /// Returns the messages in flight to a node.
    pub fn queue(&self, id: NodeID) -> Result<&VecDeque<Envelope>> {
        Ok(&self.host(id)?.queue)
    }

    /// Runs an operation on a node, replacing it with the result and sending
    /// its outbound messages.
    fn with_node(&mut self, id: NodeID, f: impl FnOnce(Node) -> Result<Node>) -> Result<()> {
        let host = self.host_mut(id)?;
        let node = host.node.take().ok_or_else(|| Error::InvalidData(format!("node {id} failed")))?;
        host.node = Some(f(node)?);
        self.observe(id)?;
        self.flush(id)
    }

    /// Asserts that a node acting as leader is the only one in its term, and
    /// that it never changes or removes an entry it appended in that term.
    fn observe(&mut self, id: NodeID) -> Result<()> {
        let Some(node) = self.nodes.get(&id).and_then(|host| host.node.as_ref()) else {
            return Ok(());
        };
        if node.role() != NodeRole::Leader {
            return Ok(());
        }
        let term = node.term();
        self.observe_leader(id, term);

        let log = self.log(id)?;
        let (snapshot_index, _) = log.get_snapshot_index();
        let entries: Vec<Entry> =
            log.scan(snapshot_index + 1..).filter_ok(|e| e.term == term).collect::<Result<_>>()?;
        let count = entries.len();
        for entry in entries {
            let seen = self.leader_entries.entry((term, entry.index)).or_insert_with(|| entry.clone());
            assert_eq!(*seen, entry, "leader {id} changed entry {} in term {term}", entry.index);
        }
        let seen = (self.leader_entries.keys()).filter(|(t, i)| *t == term && *i > snapshot_index);
        assert_eq!(seen.count(), count, "leader {id} removed entries in term {term}");
        Ok(())
    }

    fn observe_leader(&mut self, id: NodeID, term: Term) {
        let leader = *self.leaders.entry(term).or_insert(id);
        assert_eq!(leader, id, "saw leaders {leader} and {id} in term {term}");
    }

    /// Sends a node's outbound messages.
    fn flush(&mut self, id: NodeID) -> Result<()> {
        let outbound = self.host(id)?.node_rx.try_iter().collect_vec();
        for msg in outbound {
            self.trace.push(msg.clone());
            if let Message::Append { .. }
            | Message::Install { .. }
            | Message::Configure { .. }
            | Message::Transfer { .. } = msg.message
            {
                self.observe_leader(msg.from, msg.term);
            }
            match msg.message {
                Message::ClientResponse { id, response } if msg.to == msg.from => {
                    self.responses.insert(id, response);
                }
                _ => self.enqueue(msg)?,
            }
        }
        Ok(())
    }

    /// Queues a message at its destination. Requests to unknown nodes fail
    /// with a timeout.
    fn enqueue(&mut self, msg: Envelope) -> Result<()> {
        if let Some(host) = self.nodes.get_mut(&msg.to) {
            host.queue.push_back(msg);
            return Ok(());
        }
        debug!("Dropping message to unknown node {}: {msg:?}", msg.to);
        match transport::failure(&msg, Failure::Timeout) {
            Some(failure) => self.inject(failure),
            None => Ok(()),
        }
    }

    /// Injects a network failure, recording it in the trace.
    fn inject(&mut self, failure: Envelope) -> Result<()> {
        self.trace.push(failure.clone());
        self.enqueue(failure)
    }

    /// Returns true if a message may be dropped by the network. Failures and
    /// client messages are local, and always arrive.
    fn is_droppable(msg: &Envelope) -> bool {
        !matches!(
            msg.message,
            Message::Failure { .. } | Message::ClientRequest { .. } | Message::ClientResponse { .. }
        )
    }

    /// Drops a message, surfacing it as a timeout at the requester: the sender
    /// of a request, or the recipient of a response.
    fn lose(&mut self, msg: Envelope) -> Result<()> {
        debug!("Dropping {msg:?}");
        if let Some(failure) = transport::failure(&msg, Failure::Timeout) {
            return self.inject(failure);
        }
        if let Some(rpc) = msg.message.response_kind() {
            let term = self.node(msg.to)?.term();
            let message = Message::Failure { rpc, failure: Failure::Timeout };
            return self.inject(Envelope { from: msg.from, term, to: msg.to, message });
        }
        Ok(())
    }

    /// Delivers a message via the recipient's dispatcher, and steps it.
    fn deliver(&mut self, msg: Envelope) -> Result<()> {
        let msg = Envelope::decode(&msg.encode())?;
        let to = msg.to;
        let unhandled = transport::failure(&msg, Failure::Unhandled);
        match self.host(to)?.dispatcher.dispatch(msg) {
            Ok(()) => {}
            Err(Error::Unhandled(_)) => {
                return match unhandled {
                    Some(failure) => self.inject(failure),
                    None => Ok(()),
                };
            }
            Err(err) => return Err(err),
        }
        let inbound = self.host(to)?.inbox_rx.try_iter().collect_vec();
        for msg in inbound {
            self.with_node(to, move |node| node.step(msg))?;
        }
        Ok(())
    }

    /// Delivers the next message in flight to a node, unless it's partitioned
    /// from the sender. Returns false if there was no message.
    pub fn deliver_next(&mut self, id: NodeID) -> Result<bool> {
        let Some(msg) = self.host_mut(id)?.queue.pop_front() else {
            return Ok(false);
        };
        if Self::is_droppable(&msg) && self.partitions.contains(&(msg.from, msg.to)) {
            self.lose(msg)?;
        } else {
            self.deliver(msg)?;
        }
        Ok(true)
    }

    /// Drops the next message in flight to a node. Local messages can't be
    /// dropped, and are delivered instead. Returns false if there was no
    /// message.
    pub fn drop_next(&mut self, id: NodeID) -> Result<bool> {
        let Some(msg) = self.host_mut(id)?.queue.pop_front() else {
            return Ok(false);
        };
        match Self::is_droppable(&msg) {
            true => self.lose(msg)?,
            false => self.deliver(msg)?,
        }
        Ok(true)
    }

    /// Delivers messages round-robin across nodes until no messages remain.
    /// Returns the number of messages processed.
    pub fn deliver_all(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            let mut delivered = false;
            for id in self.ids() {
                if self.deliver_next(id)? {
                    delivered = true;
                    count += 1;
                }
            }
            if !delivered {
                return Ok(count);
            }
        }
    }

    /// Ticks a node.
    pub fn tick(&mut self, id: NodeID) -> Result<()> {
        self.with_node(id, |node| node.tick())
    }

    /// Ticks all nodes, in order.
    pub fn tick_all(&mut self) -> Result<()> {
        for id in self.ids() {
            self.tick(id)?;
        }
        Ok(())
    }

    /// Runs the cluster for the given number of ticks, delivering all
    /// messages after each tick.
    pub fn run(&mut self, ticks: usize) -> Result<()> {
        for _ in 0..ticks {
            self.tick_all()?;
            self.deliver_all()?;
        }
        Ok(())
    }

    /// Runs the cluster until the condition holds, for at most max_ticks.
    /// Returns whether the condition was met.
    pub fn run_until(&mut self, max_ticks: usize, cond: impl Fn(&Cluster) -> bool) -> Result<bool> {
        for _ in 0..max_ticks {
            if cond(self) {
                return Ok(true);
            }
            self.run(1)?;
        }
        Ok(cond(self))
    }

    /// Partitions two nodes from each other.
    pub fn partition(&mut self, a: NodeID, b: NodeID) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Partitions a node from all other nodes.
    pub fn isolate(&mut self, id: NodeID) {
        for peer in self.ids() {
            if peer != id {
                self.partition(id, peer);
            }
        }
    }

    /// Heals a partition between two nodes.
    pub fn heal(&mut self, a: NodeID, b: NodeID) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Heals all partitions.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    /// Unregisters a node's handler for an RPC kind, so its requests fail
    /// with Failure::Unhandled.
    pub fn unregister(&mut self, id: NodeID, kind: RpcKind) -> Result<()> {
        self.host_mut(id)?.dispatcher.unregister(kind);
        Ok(())
    }

    /// Registers the node as the handler for an RPC kind.
    pub fn register(&mut self, id: NodeID, kind: RpcKind) -> Result<()> {
        let host = self.host_mut(id)?;
        let inbox_tx = host.inbox_tx.clone();
        host.dispatcher.register(kind, inbox_tx);
        Ok(())
    }

    /// Submits a client request to a node, returning its request ID. The
    /// response is available via response() once it has been processed.
    pub fn submit(&mut self, id: NodeID, request: Request) -> Result<RequestID> {
        self.next_request_id += 1;
        let request_id = self.next_request_id.to_be_bytes().to_vec();
        let msg = Envelope {
            from: id,
            term: self.node(id)?.term(),
            to: id,
            message: Message::ClientRequest { id: request_id.clone(), request },
        };
        self.with_node(id, |node| node.step(msg))?;
        Ok(request_id)
    }

    /// Takes the response to a client request, if it has completed.
    pub fn response(&mut self, id: &RequestID) -> Option<Result<Response>> {
        self.responses.remove(id)
    }

    /// Asserts that committed entries are identical on all nodes (log
    /// matching and commit durability), and that nodes have applied the same
    /// commands in the same order.
    pub fn check_consistency(&mut self) -> Result<()> {
        let mut committed: Vec<(NodeID, Vec<Entry>)> = Vec::new();
        for id in self.ids() {
            let log = self.log(id)?;
            let (commit_index, _) = log.get_commit_index();
            let (snapshot_index, _) = log.get_snapshot_index();
            let mut entries = Vec::new();
            if commit_index > snapshot_index {
                entries = log.scan(snapshot_index + 1..=commit_index).collect::<Result<_>>()?;
            }
            committed.push((id, entries));
        }
        for ((a, a_entries), (b, b_entries)) in committed.iter().tuple_combinations() {
            for entry in a_entries {
                if let Some(other) = b_entries.iter().find(|e| e.index == entry.index) {
                    assert_eq!(entry, other, "committed entry {} differs on {a} and {b}", entry.index);
                }
            }
        }

        let applied: Vec<(NodeID, Vec<Vec<u8>>)> =
            (self.nodes.iter()).map(|(id, host)| (*id, host.recorder.commands())).collect();
        for ((a, a_commands), (b, b_commands)) in applied.iter().tuple_combinations() {
            let len = a_commands.len().min(b_commands.len());
            assert_eq!(a_commands[..len], b_commands[..len], "applied commands differ on {a} and {b}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(value: u8) -> Request {
        Request::Write(vec![value])
    }

    /// Creates a cluster and runs it until node 1 is leader.
    fn setup(size: NodeID, opts: Options) -> Result<Cluster> {
        let mut cluster = Cluster::new(size, opts)?;
        assert!(cluster.run_until(100, |c| c.leader() == Some(1))?);
        Ok(cluster)
    }

    fn is_final_chunk(msg: &Envelope, count: u64) -> bool {
        matches!(msg.message, Message::Install { chunk_index, .. } if chunk_index + 1 == count)
    }

    #[test]
    fn recorder_snapshot_restore() -> Result<()> {
        let mut recorder = Recorder::new();
        recorder.apply(Entry { index: 1, term: 1, payload: Payload::Noop })?;
        assert_eq!(
            recorder.apply(Entry { index: 2, term: 1, payload: Payload::Command(vec![7]) })?,
            vec![7]
        );
        let snapshot = recorder.snapshot()?;

        let mut restored = Recorder::new();
        assert!(restored.restore(3, &snapshot).is_err());
        restored.restore(2, &snapshot)?;
        assert_eq!(restored.applied_index(), 2);
        assert_eq!(restored.commands(), vec![vec![7]]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "applied out of order")]
    fn recorder_rejects_gaps() {
        let mut recorder = Recorder::new();
        let _ = recorder.apply(Entry { index: 2, term: 1, payload: Payload::Noop });
    }

    #[test]
    fn initial_election() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        cluster.run(5)?;
        for id in cluster.ids() {
            let status = cluster.status(id)?;
            assert_eq!(status.term, 1);
            assert_eq!(status.leader, Some(1));
            assert_eq!(status.commit_index, 1);
        }
        assert_eq!(cluster.node(2)?.role(), NodeRole::Follower);

        // Followers redirect clients to the leader.
        let id = cluster.submit(2, write(1))?;
        assert_eq!(cluster.response(&id), Some(Err(Error::NotLeader(Some(1)))));
        Ok(())
    }

    #[test]
    fn election_safety_five_nodes() -> Result<()> {
        let mut cluster = Cluster::new(5, Options::default())?;
        for round in 0..5u8 {
            assert!(cluster.run_until(300, |c| c.leader().is_some())?);
            let leader = cluster.leader().unwrap();
            let id = cluster.submit(leader, write(round))?;
            cluster.deliver_all()?;
            assert_eq!(cluster.response(&id), Some(Ok(Response::Write(vec![round]))));

            // Depose the leader.
            cluster.isolate(leader);
            assert!(cluster.run_until(300, |c| c.leader().is_some_and(|l| l != leader))?);
            cluster.heal_all();
            cluster.run(30)?;
        }

        // The leaders in the trace are unique per term, which is asserted on
        // every message. All terms had a leader.
        let terms = cluster.leaders.keys().copied().sorted().collect_vec();
        assert!(terms.len() >= 6, "{terms:?}");
        cluster.check_consistency()?;
        assert_eq!(cluster.recorder(1)?.commands(), (0..5u8).map(|v| vec![v]).collect_vec());
        Ok(())
    }

    #[test]
    fn pre_vote_prevents_disruption() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        cluster.isolate(3);
        cluster.run(100)?;
        assert_eq!(cluster.node(3)?.term(), 1);

        cluster.heal_all();
        cluster.run(50)?;
        assert_eq!(cluster.leader(), Some(1));
        for id in cluster.ids() {
            assert_eq!(cluster.node(id)?.term(), 1);
        }
        assert_eq!(cluster.node(3)?.role(), NodeRole::Follower);
        assert_eq!(cluster.node(3)?.leader(), Some(1));
        Ok(())
    }

    #[test]
    fn without_pre_vote_rejoin_disrupts() -> Result<()> {
        let mut cluster = setup(3, Options { pre_vote: false, ..Options::default() })?;
        cluster.isolate(3);
        cluster.run(100)?;
        assert!(cluster.node(3)?.term() > 1);

        cluster.heal_all();
        cluster.run(50)?;
        assert!(cluster.node(1)?.term() > 1);
        assert!(cluster.node(2)?.term() > 1);
        Ok(())
    }

    #[test]
    fn partitioned_leader_truncates_uncommitted() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        for value in 2..=10 {
            cluster.submit(1, write(value))?;
        }
        cluster.deliver_all()?;
        assert_eq!(cluster.log(1)?.get_commit_index(), (10, 1));

        // Proposals on the minority side never commit.
        cluster.isolate(1);
        let lost = (11..=13).map(|value| cluster.submit(1, write(value))).collect::<Result<Vec<_>>>()?;
        cluster.deliver_all()?;
        assert_eq!(cluster.log(1)?.get_last_index(), (13, 1));
        assert_eq!(cluster.log(1)?.get_commit_index(), (10, 1));

        assert!(cluster.run_until(100, |c| matches!(c.leader(), Some(2 | 3)))?);
        let leader = cluster.leader().unwrap();
        assert_eq!(cluster.node(leader)?.term(), 2);

        // The old leader steps down, failing its requests, and replaces its
        // uncommitted entries with the new leader's.
        cluster.heal_all();
        cluster.run(20)?;
        assert_eq!(cluster.leader(), Some(leader));
        assert_eq!(cluster.node(1)?.role(), NodeRole::Follower);
        assert_eq!(cluster.node(1)?.term(), 2);
        for id in lost {
            assert!(matches!(cluster.response(&id), Some(Err(Error::NotLeader(_)))));
        }
        assert_eq!(cluster.log(1)?.get(11)?.map(|e| (e.term, e.payload)), Some((2, Payload::Noop)));
        assert_eq!(cluster.log(1)?.get_last_index(), (11, 2));
        assert_eq!(cluster.recorder(1)?.commands(), (2..=10u8).map(|v| vec![v]).collect_vec());
        cluster.check_consistency()?;
        Ok(())
    }

    #[test]
    fn reconfigure_rejects_concurrent_changes() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        let remove = cluster.submit(1, Request::Reconfigure(vec![Member::voter(1), Member::voter(2)]))?;
        let add = cluster.submit(
            1,
            Request::Reconfigure(vec![
                Member::voter(1),
                Member::voter(2),
                Member::voter(3),
                Member::learner(4),
            ]),
        )?;
        assert_eq!(cluster.response(&add), Some(Err(Error::ConflictingReconfigure)));
        assert_eq!(cluster.response(&remove), None);

        cluster.deliver_all()?;
        assert_eq!(cluster.response(&remove), Some(Ok(Response::Reconfigure(2))));
        assert_eq!(cluster.log(1)?.configuration().voters(), vec![1, 2]);
        assert_eq!(cluster.node(3)?.role(), NodeRole::Learner);

        // Once committed, the next change can go ahead.
        let members = vec![Member::voter(1), Member::voter(2), Member::voter(3)];
        let readd = cluster.submit(1, Request::Reconfigure(members.clone()))?;
        cluster.deliver_all()?;
        assert_eq!(cluster.response(&readd), Some(Ok(Response::Reconfigure(3))));
        cluster.run(5)?;
        assert_eq!(cluster.node(3)?.role(), NodeRole::Follower);

        // An unchanged membership is a noop.
        let same = cluster.submit(1, Request::Reconfigure(members))?;
        assert_eq!(cluster.response(&same), Some(Ok(Response::Reconfigure(3))));
        Ok(())
    }

    #[test]
    fn removed_voter_does_not_commit_later_writes() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        cluster.partition(1, 2);
        let remove = cluster.submit(1, Request::Reconfigure(vec![Member::voter(1), Member::voter(2)]))?;
        let writes = (1..=3).map(|v| cluster.submit(1, write(v))).collect::<Result<Vec<_>>>()?;
        cluster.deliver_all()?;

        // Node 3 acknowledged everything, which commits its own removal but
        // not the writes after it.
        assert_eq!(cluster.response(&remove), Some(Ok(Response::Reconfigure(2))));
        assert_eq!(cluster.log(1)?.configuration().voters(), vec![1, 2]);
        assert_eq!(cluster.status(1)?.commit_index, 2);
        for id in &writes {
            assert_eq!(cluster.response(id), None);
        }

        cluster.heal_all();
        cluster.run(20)?;
        for (id, value) in writes.iter().zip(1..=3) {
            assert_eq!(cluster.response(id), Some(Ok(Response::Write(vec![value]))));
        }
        assert_eq!(cluster.status(2)?.commit_index, 5);
        cluster.check_consistency()
    }

    #[test]
    fn removed_leader_steps_down() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        let id = cluster.submit(1, Request::Reconfigure(vec![Member::voter(2), Member::voter(3)]))?;
        cluster.deliver_all()?;
        assert_eq!(cluster.response(&id), Some(Ok(Response::Reconfigure(2))));
        assert_eq!(cluster.node(1)?.role(), NodeRole::Learner);

        assert!(cluster.run_until(100, |c| matches!(c.leader(), Some(2 | 3)))?);
        let leader = cluster.leader().unwrap();
        assert_eq!(cluster.log(leader)?.configuration().voters(), vec![2, 3]);
        cluster.run(50)?;
        assert_eq!(cluster.node(1)?.role(), NodeRole::Learner);
        assert_eq!(cluster.leader(), Some(leader));
        Ok(())
    }

    #[test]
    fn learner_catches_up_and_is_promoted() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        for value in 1..=3 {
            cluster.submit(1, write(value))?;
        }
        cluster.deliver_all()?;

        cluster.add_node(4)?;
        assert_eq!(cluster.node(4)?.role(), NodeRole::Learner);
        let voters = (1..=3).map(Member::voter).collect_vec();
        let add = cluster.submit(1, Request::Reconfigure([voters.clone(), vec![Member::learner(4)]].concat()))?;
        cluster.deliver_all()?;
        assert_eq!(cluster.response(&add), Some(Ok(Response::Reconfigure(2))));
        cluster.run(5)?;
        assert_eq!(cluster.node(4)?.role(), NodeRole::Learner);
        assert_eq!(cluster.recorder(4)?.commands(), vec![vec![1], vec![2], vec![3]]);

        // Learners don't count towards the quorum.
        assert_eq!(cluster.log(1)?.configuration().quorum_size(), 2);

        let promote = cluster.submit(1, Request::Reconfigure((1..=4).map(Member::voter).collect()))?;
        cluster.deliver_all()?;
        assert_eq!(cluster.response(&promote), Some(Ok(Response::Reconfigure(3))));
        cluster.run(5)?;
        assert_eq!(cluster.node(4)?.role(), NodeRole::Follower);
        assert_eq!(cluster.log(1)?.configuration().quorum_size(), 3);
        assert_eq!(cluster.leader(), Some(1));
        cluster.check_consistency()?;
        Ok(())
    }

    #[test]
    fn install_aborted_by_leader_change() -> Result<()> {
        let opts = Options { snapshot_threshold: 5, snapshot_chunk_size: 15, ..Options::default() };
        let mut cluster = setup(3, opts)?;

        // Compact the leader's log while node 3 is away. The snapshot holds
        // the applied index and 4 commands of 8 bytes, in 38 bytes, i.e. 3
        // chunks.
        cluster.isolate(3);
        for value in 1..=4 {
            cluster.submit(1, Request::Write(vec![value; 8]))?;
        }
        cluster.deliver_all()?;
        assert_eq!(cluster.log(1)?.get_snapshot_index(), (5, 1));

        // Heal, and deliver messages until the final chunk is in flight to 3.
        cluster.heal_all();
        let mut in_flight = false;
        'outer: for _ in 0..50 {
            cluster.tick_all()?;
            loop {
                let mut delivered = false;
                for id in cluster.ids() {
                    if cluster.queue(3)?.iter().any(|msg| is_final_chunk(msg, 3)) {
                        in_flight = true;
                        break 'outer;
                    }
                    delivered |= cluster.deliver_next(id)?;
                }
                if !delivered {
                    break;
                }
            }
        }
        assert!(in_flight);
        assert!(cluster.recorder(3)?.applied_index() <= 1);

        // The leader is partitioned before the final chunk arrives. The
        // partial snapshot is never applied.
        cluster.isolate(1);
        cluster.deliver_all()?;
        assert!(cluster.recorder(3)?.applied_index() <= 1);
        assert!(cluster.recorder(3)?.commands().is_empty());

        // The new leader restarts the transfer from scratch.
        assert!(cluster.run_until(300, |c| c.leader() == Some(2))?);
        cluster.run(30)?;
        assert_eq!(cluster.recorder(3)?.commands(), (1..=4u8).map(|v| vec![v; 8]).collect_vec());
        assert_eq!(cluster.log(3)?.get_commit_index(), (6, 2));
        cluster.heal_all();
        cluster.run(30)?;
        cluster.check_consistency()?;
        Ok(())
    }

    #[test]
    fn transfer_catches_up_lagging_target() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        cluster.isolate(3);
        for value in 1..=3 {
            cluster.submit(1, write(value))?;
        }
        cluster.deliver_all()?;
        cluster.heal_all();

        let id = cluster.submit(1, Request::Transfer(Some(3)))?;
        assert!(!cluster.trace().iter().any(|msg| matches!(msg.message, Message::Transfer { .. })));
        cluster.deliver_all()?;
        assert_eq!(cluster.response(&id), Some(Ok(Response::Transfer(3))));
        assert_eq!(cluster.leader(), Some(3));
        assert_eq!(cluster.node(3)?.term(), 2);

        // The transfer was only sent once the target had the leader's log.
        let trace = cluster.trace();
        let position =
            trace.iter().position(|msg| matches!(msg.message, Message::Transfer { .. })).unwrap();
        let Message::Transfer { last_index, .. } = trace[position].message else { unreachable!() };
        assert_eq!(last_index, 4);
        assert!(trace[..position].iter().any(|msg| msg.from == 3
            && matches!(msg.message,
                Message::AppendResponse { success: true, match_index, .. } if match_index == last_index)));

        // Transfers to non-voters are rejected.
        let id = cluster.submit(3, Request::Transfer(Some(4)))?;
        assert!(matches!(cluster.response(&id), Some(Err(Error::InvalidInput(_)))));
        Ok(())
    }

    #[test]
    fn duplicate_vote_is_idempotent() -> Result<()> {
        let mut cluster = Cluster::new(3, Options::default())?;
        assert!(cluster.run_until(100, |c| c.leader() == Some(1))?);
        let votes = (cluster.trace().iter())
            .filter(|msg| msg.from == 2 && matches!(msg.message, Message::VoteResponse { .. }))
            .cloned()
            .collect_vec();
        assert_eq!(votes.len(), 1);

        // Replay node 1's vote request to node 2, which grants it again.
        let request = (cluster.trace().iter())
            .find(|msg| msg.to == 2 && matches!(msg.message, Message::Vote { .. }))
            .cloned()
            .unwrap();
        cluster.host_mut(2)?.queue.push_back(request);
        cluster.deliver_next(2)?;
        let replayed = cluster.trace().last().cloned().unwrap();
        assert_eq!(replayed, votes[0]);
        Ok(())
    }

    #[test]
    fn dropped_request_times_out() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        let id = cluster.submit(1, write(1))?;
        assert!(cluster.drop_next(2)?);
        assert_eq!(
            cluster.queue(1)?.front(),
            Some(&Envelope {
                from: 2,
                term: 1,
                to: 1,
                message: Message::Failure { rpc: RpcKind::Append, failure: Failure::Timeout },
            })
        );
        cluster.deliver_all()?;
        assert_eq!(cluster.response(&id), Some(Ok(Response::Write(vec![1]))));
        Ok(())
    }

    #[test]
    fn unhandled_request_fails_distinctly() -> Result<()> {
        let mut cluster = setup(3, Options::default())?;
        cluster.unregister(2, RpcKind::Append)?;
        cluster.run(5)?;
        let unhandled = Envelope {
            from: 2,
            term: 1,
            to: 1,
            message: Message::Failure { rpc: RpcKind::Append, failure: Failure::Unhandled },
        };
        assert!(cluster.trace().contains(&unhandled));
        assert_eq!(cluster.node(1)?.role(), NodeRole::Leader);

        cluster.register(2, RpcKind::Append)?;
        cluster.run(5)?;
        assert_eq!(cluster.node(2)?.leader(), Some(1));
        assert_eq!(cluster.status(2)?.commit_index, 1);
        Ok(())
    }
}
