//! In-process message bus connecting client peers to provider services.
//!
//! Each connected peer gets a unique name. Calls are routed to the service
//! registered under a well-known name together with the caller's identity,
//! and every service is told when a peer goes away. Messages carry a JSON
//! body plus any file descriptors, whose ownership moves with the message.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::error::WireError;

/// Unique bus name of a connected peer, e.g. `:1.42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process identity the bus records for a peer when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub uid: u32,
    pub pid: u32,
    /// Raw mandatory-access-control label, e.g. `/usr/bin/app (enforce)`.
    pub security_label: String,
}

impl PeerInfo {
    pub fn new(uid: u32, pid: u32, security_label: impl Into<String>) -> Self {
        Self {
            uid,
            pid,
            security_label: security_label.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("service name already taken: {0}")]
    NameTaken(String),

    #[error("no such peer: {0}")]
    NoSuchPeer(PeerId),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Why a call produced no successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("error reply {}: {}", .0.name, .0.message)]
    Remote(WireError),

    #[error("connection is closed")]
    Disconnected,

    #[error("service {0} is not registered")]
    ServiceUnknown(String),

    #[error("service dropped the call without replying")]
    NoReply,
}

/// A message body plus attached file descriptors.
pub struct Message {
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Message {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, BusError> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            fds: Vec::new(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn with_fd(mut self, fd: OwnedFd) -> Self {
        self.fds.push(fd);
        self
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

/// Delivered to a service endpoint.
#[derive(Debug)]
pub enum BusEvent {
    Call(IncomingCall),
    Disconnected(PeerId),
}

/// A call waiting for its reply.
#[derive(Debug)]
pub struct IncomingCall {
    pub sender: PeerId,
    pub serial: u64,
    pub message: Message,
    pub reply: ReplyHandle,
}

/// One-shot reply path back to the caller.
#[derive(Debug)]
pub struct ReplyHandle {
    tx: oneshot::Sender<Result<Message, WireError>>,
}

impl ReplyHandle {
    /// Send the reply. Returns `false` if the caller stopped waiting.
    pub fn send(self, reply: Result<Message, WireError>) -> bool {
        self.tx.send(reply).is_ok()
    }
}

struct BusState {
    next_peer: u64,
    next_serial: u64,
    peers: HashMap<PeerId, PeerInfo>,
    services: HashMap<String, mpsc::UnboundedSender<BusEvent>>,
}

/// Cheaply cloneable handle on one bus instance.
///
/// Clients and services on the same bus share one address space. Peer
/// identities are what `connect` was told, not what the kernel reports, and
/// a panicking service is contained only as far as its task is. File
/// descriptors attached to messages are real OS handles, so the streaming
/// channels behave exactly as they would between processes.
#[derive(Clone)]
pub struct Bus {
    state: Arc<Mutex<BusState>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_peer: 1,
                next_serial: 1,
                peers: HashMap::new(),
                services: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a well-known name and start receiving its events.
    pub fn register_service(&self, name: &str) -> Result<ServiceEndpoint, BusError> {
        let mut state = self.lock();
        if state.services.contains_key(name) {
            return Err(BusError::NameTaken(name.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.services.insert(name.to_string(), tx);
        tracing::debug!("Bus: registered service {name}");
        Ok(ServiceEndpoint {
            bus: self.clone(),
            name: name.to_string(),
            events: rx,
        })
    }

    /// Connect a new peer.
    pub fn connect(&self, info: PeerInfo) -> Connection {
        let mut state = self.lock();
        let peer = PeerId::new(format!(":1.{}", state.next_peer));
        state.next_peer += 1;
        state.peers.insert(peer.clone(), info);
        tracing::debug!("Bus: peer {peer} connected");
        Connection {
            bus: self.clone(),
            peer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.lock().peers.contains_key(peer)
    }

    /// Identity recorded for `peer` at connect time.
    pub fn connection_credentials(&self, peer: &PeerId) -> Result<PeerInfo, BusError> {
        self.lock()
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| BusError::NoSuchPeer(peer.clone()))
    }

    fn disconnect(&self, peer: &PeerId) {
        let services: Vec<_> = {
            let mut state = self.lock();
            if state.peers.remove(peer).is_none() {
                return;
            }
            state.services.values().cloned().collect()
        };
        tracing::debug!("Bus: peer {peer} disconnected");
        for tx in services {
            let _ = tx.send(BusEvent::Disconnected(peer.clone()));
        }
    }

    fn route(&self, sender: &PeerId, service: &str, message: Message) -> PendingCall {
        let mut state = self.lock();
        if !state.peers.contains_key(sender) {
            return PendingCall::failed(CallError::Disconnected);
        }
        let Some(tx) = state.services.get(service).cloned() else {
            return PendingCall::failed(CallError::ServiceUnknown(service.to_string()));
        };
        let serial = state.next_serial;
        state.next_serial += 1;
        drop(state);

        let (reply_tx, reply_rx) = oneshot::channel();
        let call = IncomingCall {
            sender: sender.clone(),
            serial,
            message,
            reply: ReplyHandle { tx: reply_tx },
        };
        if tx.send(BusEvent::Call(call)).is_err() {
            return PendingCall::failed(CallError::ServiceUnknown(service.to_string()));
        }
        PendingCall {
            inner: PendingInner::Waiting(reply_rx),
        }
    }
}

/// Receiving side of a registered service. Dropping it releases the name.
pub struct ServiceEndpoint {
    bus: Bus,
    name: String,
    events: mpsc::UnboundedReceiver<BusEvent>,
}

impl ServiceEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Next call or disconnect notification, in delivery order.
    pub async fn next_event(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }
}

impl Drop for ServiceEndpoint {
    fn drop(&mut self) {
        self.bus.lock().services.remove(&self.name);
    }
}

/// A peer's connection. Closing or dropping it notifies every service.
pub struct Connection {
    bus: Bus,
    peer: PeerId,
    closed: AtomicBool,
}

impl Connection {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    pub fn call(&self, service: &str, message: Message) -> PendingCall {
        if self.closed.load(Ordering::Acquire) {
            return PendingCall::failed(CallError::Disconnected);
        }
        self.bus.route(&self.peer, service, message)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.bus.disconnect(&self.peer);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

enum PendingInner {
    Waiting(oneshot::Receiver<Result<Message, WireError>>),
    Failed(Option<CallError>),
}

/// Reply to an outstanding call.
pub struct PendingCall {
    inner: PendingInner,
}

impl PendingCall {
    fn failed(err: CallError) -> Self {
        Self {
            inner: PendingInner::Failed(Some(err)),
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Message, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(CallError::NoReply)))
            }
            PendingInner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Ok(message))) => Poll::Ready(Ok(message)),
                Poll::Ready(Ok(Err(wire))) => Poll::Ready(Err(CallError::Remote(wire))),
                Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::NoReply)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn test_peer() -> PeerInfo {
        PeerInfo::new(1000, 4242, "unconfined")
    }

    #[tokio::test]
    async fn call_reaches_service_and_reply_returns() {
        let bus = Bus::new();
        let mut service = bus.register_service("svc").unwrap();
        let conn = bus.connect(test_peer());

        let pending = conn.call("svc", Message::encode(&"ping").unwrap());
        let Some(BusEvent::Call(call)) = service.next_event().await else {
            panic!("expected a call");
        };
        assert_eq!(&call.sender, conn.peer_id());
        assert_eq!(call.message.decode::<String>().unwrap(), "ping");
        assert!(call.reply.send(Ok(Message::encode(&"pong").unwrap())));

        let reply = pending.await.unwrap();
        assert_eq!(reply.decode::<String>().unwrap(), "pong");
    }

    #[tokio::test]
    async fn error_reply_is_remote() {
        let bus = Bus::new();
        let mut service = bus.register_service("svc").unwrap();
        let conn = bus.connect(test_peer());

        let pending = conn.call("svc", Message::encode(&()).unwrap());
        let Some(BusEvent::Call(call)) = service.next_event().await else {
            panic!("expected a call");
        };
        let err = StorageError::Conflict("stale".into());
        call.reply.send(Err(WireError::from(&err)));

        match pending.await {
            Err(CallError::Remote(wire)) => assert_eq!(wire.into_storage_error(), err),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_connection_notifies_services() {
        let bus = Bus::new();
        let mut service = bus.register_service("svc").unwrap();
        let conn = bus.connect(test_peer());
        let peer = conn.peer_id().clone();
        assert!(bus.is_connected(&peer));

        drop(conn);
        match service.next_event().await {
            Some(BusEvent::Disconnected(p)) => assert_eq!(p, peer),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!bus.is_connected(&peer));
        assert!(bus.connection_credentials(&peer).is_err());
    }

    #[tokio::test]
    async fn unknown_service_and_dropped_call() {
        let bus = Bus::new();
        let conn = bus.connect(test_peer());
        assert_eq!(
            conn.call("nope", Message::encode(&()).unwrap()).await.unwrap_err(),
            CallError::ServiceUnknown("nope".into())
        );

        let mut service = bus.register_service("svc").unwrap();
        let pending = conn.call("svc", Message::encode(&()).unwrap());
        drop(service.next_event().await);
        assert_eq!(pending.await.unwrap_err(), CallError::NoReply);
    }

    #[test]
    fn duplicate_service_name_is_rejected() {
        let bus = Bus::new();
        let _first = bus.register_service("svc").unwrap();
        assert!(matches!(
            bus.register_service("svc"),
            Err(BusError::NameTaken(_))
        ));
    }

    #[tokio::test]
    async fn closed_connection_cannot_call() {
        let bus = Bus::new();
        let _service = bus.register_service("svc").unwrap();
        let conn = bus.connect(test_peer());
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(
            conn.call("svc", Message::encode(&()).unwrap()).await.unwrap_err(),
            CallError::Disconnected
        );
    }
}
