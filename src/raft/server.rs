use super::transport::{self, Dispatcher, Transport};
use super::{
    Envelope, Failure, Log, Message, Node, NodeID, Options, Request, Response, RpcKind, State,
    Ticks, TICK_INTERVAL,
};
use crate::error::{Error, Result};

use ::log::{debug, error, warn};
use crossbeam::channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// A client request channel, carrying a request and a response sender.
pub type ClientSender = Sender<(Request, Sender<Result<Response>>)>;
pub type ClientReceiver = Receiver<(Request, Sender<Result<Response>>)>;

/// A Raft server. This runs a node in an event loop, driving its logical
/// clock, routing inbound messages to it via a dispatcher, sending its
/// outbound messages via a transport, and serving client requests.
///
/// The transport doesn't need to report failures: the server tracks
/// outstanding peer requests, and feeds them back to the node as
/// Failure::Timeout if they aren't answered within the request timeout.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    dispatcher: Dispatcher,
    inbox_rx: Receiver<Envelope>,
    transport: Box<dyn Transport>,
    inflight: Inflight,
}

impl Server {
    /// Creates a new Raft server.
    pub fn new(
        id: NodeID,
        log: Log,
        state: Box<dyn State>,
        opts: Options,
        request_timeout: Ticks,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (inbox_tx, inbox_rx) = crossbeam::channel::unbounded();
        Ok(Self {
            node: Node::new(id, log, state, node_tx, opts)?,
            node_rx,
            dispatcher: Dispatcher::for_node(inbox_tx),
            inbox_rx,
            transport,
            inflight: Inflight::new(request_timeout),
        })
    }

    /// Returns the dispatcher, to (un)register RPC handlers before serving.
    pub fn dispatcher(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Serves inbound messages from peers and client requests, until either
    /// channel disconnects.
    pub fn serve(mut self, inbound_rx: Receiver<Envelope>, client_rx: ClientReceiver) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        let mut requests = HashMap::<Vec<u8>, Sender<Result<Response>>>::new();
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    self.node = self.node.tick()?;
                    for failure in self.inflight.tick() {
                        self.node = self.node.step(failure)?;
                    }
                }

                recv(inbound_rx) -> msg => {
                    let msg = msg?;
                    if let Some(kind) = msg.message.response_kind() {
                        self.inflight.answered(msg.from, kind);
                    }
                    let failure = transport::failure(&msg, Failure::Unhandled);
                    match self.dispatcher.dispatch(msg) {
                        Ok(()) => {}
                        Err(Error::Unhandled(kind)) => {
                            debug!("Rejecting unhandled {kind} request");
                            if let Some(failure) = failure {
                                self.transport.send(failure)?;
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }

                recv(self.inbox_rx) -> msg => self.node = self.node.step(msg?)?,

                recv(self.node_rx) -> msg => {
                    let msg = msg?;
                    match msg.message {
                        Message::ClientResponse { id, response } => {
                            if let Some(response_tx) = requests.remove(&id) {
                                // The client may have gone away.
                                if response_tx.send(response).is_err() {
                                    warn!("Client went away before its response");
                                }
                            }
                        }
                        _ => {
                            self.inflight.sent(&msg);
                            if let Err(err) = self.transport.send(msg) {
                                error!("Failed to send message: {err}");
                            }
                        }
                    }
                }

                recv(client_rx) -> r => {
                    let (request, response_tx) = r?;
                    let id = Uuid::new_v4().as_bytes().to_vec();
                    let msg = Envelope {
                        from: self.node.id(),
                        to: self.node.id(),
                        term: self.node.term(),
                        message: Message::ClientRequest { id: id.clone(), request },
                    };
                    requests.insert(id, response_tx);
                    self.node = self.node.step(msg)?;
                }
            }
        }
    }
}

/// Tracks outstanding peer requests, in send order per peer and RPC kind.
/// A response answers the oldest outstanding request of its kind, since
/// requests are otherwise indistinguishable to the transport.
struct Inflight {
    now: u64,
    timeout: Ticks,
    requests: HashMap<(NodeID, RpcKind), VecDeque<(u64, Envelope)>>,
}

impl Inflight {
    fn new(timeout: Ticks) -> Self {
        Self { now: 0, timeout, requests: HashMap::new() }
    }

    /// Records an outbound message, if it's a peer request.
    fn sent(&mut self, msg: &Envelope) {
        let Some(kind) = msg.message.request_kind() else { return };
        if msg.to == msg.from {
            return;
        }
        let deadline = self.now + u64::from(self.timeout);
        self.requests.entry((msg.to, kind)).or_default().push_back((deadline, msg.clone()));
    }

    /// Records an inbound response or failure from a peer.
    fn answered(&mut self, from: NodeID, kind: RpcKind) {
        if let Some(queue) = self.requests.get_mut(&(from, kind)) {
            queue.pop_front();
        }
    }

    /// Advances time by a tick, returning failures for expired requests.
    fn tick(&mut self) -> Vec<Envelope> {
        self.now += 1;
        let mut keys: Vec<_> = self.requests.keys().copied().collect();
        keys.sort();
        let mut failures = Vec::new();
        for key in keys {
            let Some(queue) = self.requests.get_mut(&key) else { continue };
            while queue.front().is_some_and(|(deadline, _)| *deadline <= self.now) {
                if let Some((_, request)) = queue.pop_front() {
                    failures.extend(transport::failure(&request, Failure::Timeout));
                }
            }
            if queue.is_empty() {
                self.requests.remove(&key);
            }
        }
        failures
    }
}
