use super::{Envelope, Failure, Message, RpcKind};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use log::debug;
use std::collections::HashMap;

/// An outbound transport for messages between Raft nodes. Delivery is best
/// effort: messages may be lost, delayed, duplicated or reordered. Requests
/// that don't get a response must eventually yield a `Message::Failure` at the
/// sender, which is the transport's (or the server's) responsibility.
pub trait Transport: Send {
    /// Sends a message to its recipient.
    fn send(&mut self, msg: Envelope) -> Result<()>;
}

/// A channel transport, e.g. to a network thread or an in-process peer.
impl Transport for Sender<Envelope> {
    fn send(&mut self, msg: Envelope) -> Result<()> {
        Ok(Sender::send(self, msg)?)
    }
}

/// Dispatches inbound messages to their RPC handlers. Each RPC kind has at
/// most one handler at a time. Responses and failures always go to the inbox,
/// i.e. the node that sent the request.
pub struct Dispatcher {
    handlers: HashMap<RpcKind, Sender<Envelope>>,
    inbox: Sender<Envelope>,
}

impl Dispatcher {
    /// Creates a dispatcher without any request handlers.
    pub fn new(inbox: Sender<Envelope>) -> Self {
        Self { handlers: HashMap::new(), inbox }
    }

    /// Creates a dispatcher that handles all RPC kinds via the inbox, the
    /// usual setup for a node.
    pub fn for_node(inbox: Sender<Envelope>) -> Self {
        let mut dispatcher = Self::new(inbox.clone());
        for kind in RpcKind::ALL {
            dispatcher.register(kind, inbox.clone());
        }
        dispatcher
    }

    /// Registers a handler for an RPC kind, returning the replaced handler.
    pub fn register(&mut self, kind: RpcKind, handler: Sender<Envelope>) -> Option<Sender<Envelope>> {
        self.handlers.insert(kind, handler)
    }

    /// Unregisters the handler for an RPC kind, returning it.
    pub fn unregister(&mut self, kind: RpcKind) -> Option<Sender<Envelope>> {
        self.handlers.remove(&kind)
    }

    /// Returns whether a handler is registered for the RPC kind.
    pub fn is_registered(&self, kind: RpcKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Dispatches an inbound message. Returns Error::Unhandled if it's a
    /// request without a registered handler.
    pub fn dispatch(&self, msg: Envelope) -> Result<()> {
        let Some(kind) = msg.message.request_kind() else {
            return Ok(self.inbox.send(msg)?);
        };
        match self.handlers.get(&kind) {
            Some(handler) => Ok(handler.send(msg)?),
            None => {
                debug!("No handler for {kind}, rejecting {msg:?}");
                Err(Error::Unhandled(kind.to_string()))
            }
        }
    }
}

/// Returns a failure for a request, addressed back to the requester from the
/// intended recipient, in the request's term. Returns None if the message is
/// not a peer request, since only requests get failures.
pub fn failure(request: &Envelope, failure: Failure) -> Option<Envelope> {
    let rpc = request.message.request_kind()?;
    if matches!(request.message, Message::ClientRequest { .. }) {
        return None;
    }
    Some(Envelope {
        from: request.to,
        term: request.term,
        to: request.from,
        message: Message::Failure { rpc, failure },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Request;
    use pretty_assertions::assert_eq;

    fn append(from: u8, to: u8) -> Envelope {
        let message = Message::Append { prev_index: 0, prev_term: 0, entries: vec![], commit_index: 0 };
        Envelope { from, term: 1, to, message }
    }

    #[test]
    fn dispatch_routes_by_kind() -> Result<()> {
        let (inbox_tx, inbox_rx) = crossbeam::channel::unbounded();
        let (append_tx, append_rx) = crossbeam::channel::unbounded();
        let mut dispatcher = Dispatcher::new(inbox_tx);
        assert!(dispatcher.register(RpcKind::Append, append_tx).is_none());

        dispatcher.dispatch(append(1, 2))?;
        assert_eq!(append_rx.try_recv().ok(), Some(append(1, 2)));

        let response = Envelope {
            from: 2,
            term: 1,
            to: 1,
            message: Message::VoteResponse { granted: true },
        };
        dispatcher.dispatch(response.clone())?;
        assert_eq!(inbox_rx.try_recv().ok(), Some(response));
        Ok(())
    }

    #[test]
    fn register_replaces_handler() -> Result<()> {
        let (inbox_tx, _inbox_rx) = crossbeam::channel::unbounded();
        let (old_tx, old_rx) = crossbeam::channel::unbounded();
        let (new_tx, new_rx) = crossbeam::channel::unbounded();
        let mut dispatcher = Dispatcher::new(inbox_tx);
        dispatcher.register(RpcKind::Append, old_tx);
        assert!(dispatcher.register(RpcKind::Append, new_tx).is_some());

        dispatcher.dispatch(append(1, 2))?;
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_recv().ok(), Some(append(1, 2)));
        Ok(())
    }

    #[test]
    fn unregistered_kind_is_unhandled() {
        let (inbox_tx, inbox_rx) = crossbeam::channel::unbounded();
        let mut dispatcher = Dispatcher::for_node(inbox_tx);
        assert!(dispatcher.is_registered(RpcKind::Append));
        assert!(dispatcher.unregister(RpcKind::Append).is_some());
        assert!(!dispatcher.is_registered(RpcKind::Append));

        assert_eq!(dispatcher.dispatch(append(1, 2)), Err(Error::Unhandled("Append".into())));
        assert!(inbox_rx.try_recv().is_err());
    }

    #[test]
    fn failure_addresses_requester() {
        assert_eq!(
            failure(&append(1, 2), Failure::Timeout),
            Some(Envelope {
                from: 2,
                term: 1,
                to: 1,
                message: Message::Failure { rpc: RpcKind::Append, failure: Failure::Timeout },
            })
        );

        let response = Envelope { from: 2, term: 1, to: 1, message: Message::PollResponse { granted: false } };
        assert_eq!(failure(&response, Failure::Timeout), None);

        let client = Envelope {
            from: 1,
            term: 1,
            to: 1,
            message: Message::ClientRequest { id: vec![1], request: Request::Write(vec![]) },
        };
        assert_eq!(failure(&client, Failure::Unhandled), None);
    }
}
