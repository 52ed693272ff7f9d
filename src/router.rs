//! Central dispatch: the peer table, the singleton services, and the routing
//! of every message that crosses the bus.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{bail, Result};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::Guid;
use crate::events::{BusEvent, EventFeed};
use crate::fdo;
use crate::match_rules::MatchRules;
use crate::name_registry::{NameOwnerChanged, NameRegistry};
use crate::peer::handshake::Credentials;
use crate::peer::stream::Stream;
use crate::peer::{self, Peer, OUTBOUND_QUEUE_DEPTH};
use crate::policy::Policy;
use crate::wire::{message, HeaderFlag, Message, MessageType, Type, Value};

const READ_BUF_SIZE: usize = 16 * 1024;

/// The one genuinely global datum: a monotonic counter feeding both unique
/// name suffixes and bus-originated serials.
#[derive(Debug, Default, Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Serials are the low 32 bits, skipping zero.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next() as u32;
            if serial != 0 {
                return serial;
            }
        }
    }
}

/// Consulted when a method call's destination is unknown locally, before a
/// `ServiceUnknown` error is synthesized.
pub trait Forwarder: Send + Sync + std::fmt::Debug {
    /// Returns true if the message was accepted for remote delivery.
    fn forward<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, bool>;
}

#[derive(Debug)]
struct PeerHandle {
    tx: mpsc::Sender<Arc<Message>>,
    shutdown: watch::Sender<bool>,
    credentials: Credentials,
    greeted: bool,
    writer: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Router {
    // Handed to spawned per-peer tasks; the bus holds the strong reference.
    self_ref: Weak<Router>,
    peers: RwLock<BTreeMap<String, PeerHandle>>,
    name_registry: RwLock<NameRegistry>,
    match_rules: RwLock<MatchRules>,
    policy: RwLock<Policy>,
    counter: Counter,
    guid: Arc<Guid>,
    machine_id: String,
    events: EventFeed,
    compat_broadcast: bool,
    forwarder: OnceLock<Box<dyn Forwarder + Send + Sync>>,
}

impl Router {
    pub fn new(guid: Arc<Guid>, machine_id: String, compat_broadcast: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            peers: RwLock::new(BTreeMap::new()),
            name_registry: RwLock::new(NameRegistry::default()),
            match_rules: RwLock::new(MatchRules::default()),
            policy: RwLock::new(Policy::default()),
            counter: Counter::default(),
            guid,
            machine_id,
            events: EventFeed::new(),
            compat_broadcast,
            forwarder: OnceLock::new(),
        })
    }

    pub fn guid(&self) -> &str {
        self.guid.as_str()
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    pub fn next_serial(&self) -> u32 {
        self.counter.next_serial()
    }

    /// Installs the remote forwarder. Later calls are ignored.
    pub fn set_forwarder(&self, forwarder: Box<dyn Forwarder + Send + Sync>) {
        if self.forwarder.set(forwarder).is_err() {
            warn!("forwarder already installed, ignoring");
        }
    }

    pub(crate) fn name_registry(&self) -> &RwLock<NameRegistry> {
        &self.name_registry
    }

    pub(crate) fn match_rules(&self) -> &RwLock<MatchRules> {
        &self.match_rules
    }

    pub(crate) fn policy(&self) -> &RwLock<Policy> {
        &self.policy
    }

    pub(crate) async fn peer_uid(&self, unique_name: &str) -> Option<u32> {
        self.peers
            .read()
            .await
            .get(unique_name)
            .and_then(|handle| handle.credentials.uid)
    }

    /// Registers an authenticated connection: assigns `:1.N`, installs
    /// default grants and spawns the reader and writer tasks.
    pub async fn add_peer(&self, peer: Peer) -> String {
        let unique_name = format!(":1.{}", self.counter.next());
        let (stream, leftover, credentials, fd_passing) = peer.into_parts();

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let writer = tokio::spawn(peer::write_loop(stream.clone(), rx, fd_passing));

        self.policy
            .write()
            .await
            .install_defaults(&unique_name, &credentials);
        self.peers.write().await.insert(
            unique_name.clone(),
            PeerHandle {
                tx,
                shutdown,
                credentials,
                greeted: false,
                writer,
            },
        );

        let router = self
            .self_ref
            .upgrade()
            .expect("the bus outlives its peer tasks");
        let name = unique_name.clone();
        tokio::spawn(async move {
            if let Err(e) = router
                .serve_peer(stream, leftover, &name, fd_passing, shutdown_rx)
                .await
            {
                debug!("peer {name} failed: {e}");
            }
            router.remove_peer(&name).await;
        });

        self.events.publish(BusEvent::PeerUp {
            unique: unique_name.clone(),
            uid: credentials.uid,
        });
        debug!("peer {unique_name} connected");
        unique_name
    }

    /// Per-peer reception loop: deframe, attach descriptors, stamp the
    /// sender, route. Runs until the socket closes, a wire error occurs or
    /// the peer is shut down.
    async fn serve_peer(
        &self,
        stream: Stream,
        leftover: Vec<u8>,
        unique_name: &str,
        fd_passing: bool,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut inbound = leftover;
        let mut fd_queue = VecDeque::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            loop {
                match message::decode_message(&inbound)? {
                    Some((mut msg, consumed)) => {
                        inbound.drain(..consumed);
                        let declared = msg.unix_fds as usize;
                        if declared > fd_queue.len() {
                            bail!(
                                "message declares {declared} descriptors, {} queued",
                                fd_queue.len()
                            );
                        }
                        msg.fds = fd_queue.drain(..declared).collect();
                        match msg.sender.as_deref() {
                            None => msg.sender = Some(unique_name.to_string()),
                            Some(sender) if sender == unique_name => {}
                            Some(sender) => {
                                bail!("peer {unique_name} forged sender `{sender}`")
                            }
                        }
                        // Routing backpressure: the reader does not pull
                        // more bytes until this message is dispatched.
                        self.route(msg, unique_name).await;
                    }
                    None => break,
                }
            }

            let (n, fds) = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                res = stream.read_with_fds(&mut buf) => res?,
            };
            if n == 0 {
                debug!("peer {unique_name} disconnected");
                return Ok(());
            }
            if !fd_passing && !fds.is_empty() {
                bail!("peer {unique_name} sent descriptors without negotiating them");
            }
            fd_queue.extend(fds.into_iter().map(Arc::new));
            inbound.extend_from_slice(&buf[..n]);
        }
    }

    /// Tears down every per-peer resource. Idempotent; the first caller
    /// wins.
    ///
    /// Returns a boxed future (rather than being declared `async fn`) to
    /// break the Send-inference cycle between this function and
    /// `send_to_peer`, which spawns a boxed call back into this one.
    pub fn remove_peer<'a>(
        &'a self,
        unique_name: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(handle) = self.peers.write().await.remove(unique_name) else {
                return;
            };

            let changes = self
                .name_registry
                .write()
                .await
                .peer_disconnected(unique_name);
            self.match_rules.write().await.peer_disconnected(unique_name);
            self.policy.write().await.peer_disconnected(unique_name);
            for changed in changes {
                self.announce_name_change(changed).await;
            }
            self.events.publish(BusEvent::PeerDown {
                unique: unique_name.to_string(),
            });
            debug!("peer {unique_name} removed");

            // Signal the reader and drop the outbound queue with whatever is
            // still in it; the socket closes once both tasks are gone.
            let _ = handle.shutdown.send(true);
            handle.writer.abort();
            drop(handle);
        })
    }

    /// Central dispatch for one inbound message.
    pub async fn route(&self, msg: Message, from: &str) {
        trace!(
            "routing {} #{} from {from} to {:?}",
            msg.kind.as_str(),
            msg.serial,
            msg.destination
        );
        self.events.publish(BusEvent::message_routed(&msg));

        let to_bus = matches!(msg.destination.as_deref(), None | Some(fdo::BUS_NAME))
            && !matches!(msg.kind, MessageType::Signal);

        // A peer must introduce itself before anything else.
        let greeted = self
            .peers
            .read()
            .await
            .get(from)
            .map(|handle| handle.greeted)
            .unwrap_or(false);
        if !greeted {
            let is_hello = to_bus
                && msg.kind == MessageType::MethodCall
                && msg.member.as_deref() == Some("Hello");
            if !is_hello {
                warn!("peer {from} sent traffic before Hello, disconnecting");
                self.remove_peer(from).await;
                return;
            }
        }

        if let Err(deny) = self.policy.read().await.check_send(from, &msg) {
            self.events.publish(BusEvent::PolicyDenied {
                action: "send",
                unique: from.to_string(),
                detail: deny.detail.clone(),
            });
            if msg.kind == MessageType::MethodCall {
                let error = self.bus_error(&msg, deny.error_name, &deny.detail);
                self.deliver_reply(&msg, error).await;
            }
            return;
        }

        if to_bus {
            if let Some(reply) = fdo::dbus::dispatch(self, &msg).await {
                self.deliver_reply(&msg, reply).await;
            }
            return;
        }

        match msg.kind {
            MessageType::MethodCall => {
                let destination = msg
                    .destination
                    .clone()
                    .expect("non-bus method call carries a destination");
                let owner = self.name_registry.read().await.resolve(&destination);
                match owner {
                    Some(owner) => {
                        let msg = Arc::new(msg);
                        self.copy_to_eavesdroppers(&msg, from, &owner).await;
                        self.send_to_peer(&owner, msg).await;
                    }
                    None => {
                        if let Some(forwarder) = self.forwarder.get() {
                            if forwarder.forward(&msg).await {
                                return;
                            }
                        }
                        let error = self.bus_error(
                            &msg,
                            fdo::ERR_SERVICE_UNKNOWN,
                            &format!("no service owns `{destination}`"),
                        );
                        self.deliver_reply(&msg, error).await;
                    }
                }
            }
            MessageType::MethodReturn | MessageType::Error => {
                let Some(destination) = msg.destination.clone() else {
                    trace!("dropping reply without destination");
                    return;
                };
                let owner = self.name_registry.read().await.resolve(&destination);
                match owner {
                    Some(owner) => {
                        let msg = Arc::new(msg);
                        self.copy_to_eavesdroppers(&msg, from, &owner).await;
                        self.send_to_peer(&owner, msg).await;
                    }
                    // The caller is gone; its timeout is its problem.
                    None => trace!("dropping reply to vanished `{destination}`"),
                }
            }
            MessageType::Signal => match msg.destination.clone() {
                // Directed signals go straight to their destination.
                Some(destination) => {
                    let owner = self.name_registry.read().await.resolve(&destination);
                    if let Some(owner) = owner {
                        let msg = Arc::new(msg);
                        self.copy_to_eavesdroppers(&msg, from, &owner).await;
                        self.send_to_peer(&owner, msg).await;
                    }
                }
                None => self.broadcast_signal(Arc::new(msg), Some(from)).await,
            },
        }
    }

    /// Signal fan-out via the match engine, with the compatibility fallback
    /// to rule-less peers when configured.
    async fn broadcast_signal(&self, msg: Arc<Message>, from: Option<&str>) {
        let mut recipients = self.match_rules.read().await.matching_peers(&msg);
        if self.compat_broadcast {
            let rules = self.match_rules.read().await;
            let peers = self.peers.read().await;
            for (name, handle) in peers.iter() {
                if handle.greeted && !rules.has_rules(name) && Some(name.as_str()) != from {
                    recipients.push(name.clone());
                }
            }
        }
        recipients.sort();
        recipients.dedup();
        for recipient in recipients {
            self.send_to_peer(&recipient, msg.clone()).await;
        }
    }

    /// Copies unicast traffic to matching eavesdroppers, skipping the two
    /// real endpoints.
    async fn copy_to_eavesdroppers(&self, msg: &Arc<Message>, from: &str, to: &str) {
        let eavesdroppers = self.match_rules.read().await.eavesdroppers(msg);
        for peer in eavesdroppers {
            if peer == from || peer == to {
                continue;
            }
            if self.policy.read().await.check_eavesdrop(&peer).is_ok() {
                self.send_to_peer(&peer, msg.clone()).await;
            }
        }
    }

    /// Enqueues a message on the destination peer's outbound queue. A full
    /// queue drops the slow consumer rather than stalling the router.
    pub(crate) async fn send_to_peer(&self, unique_name: &str, msg: Arc<Message>) {
        let result = match self.peers.read().await.get(unique_name) {
            Some(handle) => handle.tx.try_send(msg),
            None => {
                trace!("dropping message for unknown peer `{unique_name}`");
                return;
            }
        };
        match result {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("peer {unique_name} outbound queue overflow, disconnecting");
                // Boxed to break the send/remove future cycle.
                let Some(router) = self.self_ref.upgrade() else {
                    return;
                };
                let name = unique_name.to_string();
                let teardown: BoxFuture<'static, ()> =
                    Box::pin(async move { router.remove_peer(&name).await });
                tokio::spawn(teardown);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("peer {unique_name} already shutting down");
            }
        }
    }

    /// Delivers a reply to the original caller unless it opted out.
    pub(crate) async fn deliver_reply(&self, origin: &Message, reply: Message) {
        if origin.flags.contains(HeaderFlag::NoReplyExpected) {
            return;
        }
        let Some(destination) = reply.destination.clone() else {
            return;
        };
        self.send_to_peer(&destination, Arc::new(reply)).await;
    }

    /// Marks the peer as greeted and registers its unique name. Errors if
    /// `Hello` was already called.
    pub(crate) async fn greet(&self, unique_name: &str) -> Result<NameOwnerChanged, ()> {
        {
            let mut peers = self.peers.write().await;
            let Some(handle) = peers.get_mut(unique_name) else {
                return Err(());
            };
            if handle.greeted {
                return Err(());
            }
            handle.greeted = true;
        }
        Ok(self
            .name_registry
            .write()
            .await
            .register_unique(unique_name))
    }

    /// Broadcasts `NameOwnerChanged` plus the directed `NameAcquired` /
    /// `NameLost` signals for one ownership transition.
    pub(crate) async fn announce_name_change(&self, changed: NameOwnerChanged) {
        let signal = self
            .bus_signal(fdo::INTERFACE_DBUS, "NameOwnerChanged")
            .with_body(
                vec![Type::String, Type::String, Type::String],
                vec![
                    Value::String(changed.name.clone()),
                    Value::String(changed.old_owner.clone().unwrap_or_default()),
                    Value::String(changed.new_owner.clone().unwrap_or_default()),
                ],
            );
        self.broadcast_signal(Arc::new(signal), None).await;

        // A disconnected old owner is already gone from the peer table, so
        // its NameLost falls on the floor, which is exactly right.
        if let Some(old) = &changed.old_owner {
            let lost = self
                .bus_signal(fdo::INTERFACE_DBUS, "NameLost")
                .with_destination(old)
                .with_body(
                    vec![Type::String],
                    vec![Value::String(changed.name.clone())],
                );
            self.send_to_peer(old, Arc::new(lost)).await;
        }
        if let Some(new) = &changed.new_owner {
            let acquired = self
                .bus_signal(fdo::INTERFACE_DBUS, "NameAcquired")
                .with_destination(new)
                .with_body(
                    vec![Type::String],
                    vec![Value::String(changed.name.clone())],
                );
            self.send_to_peer(new, Arc::new(acquired)).await;
        }

        self.events.publish(BusEvent::NameChanged {
            name: changed.name,
            old: changed.old_owner,
            new: changed.new_owner,
        });
    }

    /// A bus-originated signal with a fresh serial, for callers that fan it
    /// out themselves.
    pub async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        signature: Vec<Type>,
        body: Vec<Value>,
    ) {
        let signal = Message::signal(path, interface, member)
            .with_serial(self.counter.next_serial())
            .with_sender(fdo::BUS_NAME)
            .with_body(signature, body);
        self.broadcast_signal(Arc::new(signal), None).await;
    }

    fn bus_signal(&self, interface: &str, member: &str) -> Message {
        Message::signal(fdo::BUS_PATH, interface, member)
            .with_serial(self.counter.next_serial())
            .with_sender(fdo::BUS_NAME)
    }

    pub(crate) fn bus_reply(&self, origin: &Message) -> Message {
        Message::method_return(origin)
            .with_serial(self.counter.next_serial())
            .with_sender(fdo::BUS_NAME)
    }

    pub(crate) fn bus_error(&self, origin: &Message, error_name: &str, text: &str) -> Message {
        Message::method_error(origin, error_name, text)
            .with_serial(self.counter.next_serial())
            .with_sender(fdo::BUS_NAME)
    }
}
