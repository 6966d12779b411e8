//! Session registry and cross-node control plane
//!
//! The server owns every live session and channel on this node. Two tasks
//! drive it: the session task consumes the register/unregister streams, the
//! presence task consumes the reserved main topic so the roster stays in
//! step across the fleet.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, BusSubscription};
use crate::error::{Error, Result};
use crate::store::{ChannelStore, Subscriber, SubscriberKind, SubscriberStore};
use crate::workers::WorkerSupervisor;

use super::channel::Channel;
use super::message::{Action, Message, MessageType, Status};
use super::session::Session;
use super::MAIN_TOPIC;

const STREAM_CAPACITY: usize = 64;

type SessionStreams = (mpsc::Receiver<Arc<Session>>, mpsc::Receiver<Arc<Session>>);

pub struct RelayServer {
    bus: Arc<dyn Bus>,
    channel_store: Arc<dyn ChannelStore>,
    subscriber_store: Arc<dyn SubscriberStore>,

    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    /// Live channels; the lock is held across lazy construction so at most
    /// one build per name is in flight.
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    /// Known subscribers for the initial presence roster.
    roster: RwLock<Vec<Subscriber>>,

    register_tx: Mutex<Option<mpsc::Sender<Arc<Session>>>>,
    unregister_tx: Mutex<Option<mpsc::Sender<Arc<Session>>>>,
    control_rx: std::sync::Mutex<Option<SessionStreams>>,

    cancel: CancellationToken,
    stopping: AtomicBool,
    record_transient: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(
        bus: Arc<dyn Bus>,
        channel_store: Arc<dyn ChannelStore>,
        subscriber_store: Arc<dyn SubscriberStore>,
        record_transient: bool,
    ) -> Arc<RelayServer> {
        let (register_tx, register_rx) = mpsc::channel(STREAM_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(STREAM_CAPACITY);

        Arc::new(RelayServer {
            bus,
            channel_store,
            subscriber_store,
            sessions: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            roster: RwLock::new(Vec::new()),
            register_tx: Mutex::new(Some(register_tx)),
            unregister_tx: Mutex::new(Some(unregister_tx)),
            control_rx: std::sync::Mutex::new(Some((register_rx, unregister_rx))),
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            record_transient,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe the main topic and start both control tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (register_rx, unregister_rx) = self
            .control_rx
            .lock()
            .expect("control stream lock")
            .take()
            .ok_or_else(|| Error::Other("Server already started".to_string()))?;

        let subscription = self.bus.subscribe(MAIN_TOPIC).await?;

        info!("Listen for requests");
        let supervisor = WorkerSupervisor::instance();
        let presence_task = {
            let server = self.clone();
            supervisor.spawn("server-presence", async move {
                server.presence_loop(subscription).await;
            })
        };
        let session_task = {
            let server = self.clone();
            supervisor.spawn("server-sessions", async move {
                server.session_loop(register_rx, unregister_rx).await;
            })
        };
        self.tasks
            .lock()
            .await
            .extend([presence_task, session_task]);
        Ok(())
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Queue a session for registration. Fails once shutdown has begun.
    pub(crate) async fn register_session(&self, session: Arc<Session>) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::ShuttingDown);
        }
        let sender = { self.register_tx.lock().await.clone() };
        match sender {
            Some(sender) => sender
                .send(session)
                .await
                .map_err(|_| Error::ShuttingDown),
            None => Err(Error::ShuttingDown),
        }
    }

    /// Queue a session removal. A no-op once shutdown has begun.
    pub(crate) async fn unregister_session(&self, session: Arc<Session>) {
        let sender = { self.unregister_tx.lock().await.clone() };
        if let Some(sender) = sender {
            let _ = sender.send(session).await;
        }
    }

    /// Find a live channel by name, lazily creating it (and its store row).
    /// Nodes racing on the same name reconcile through the store's unique
    /// constraint.
    pub async fn get_channel(&self, name: &str) -> Result<Arc<Channel>> {
        if self.is_stopping() {
            return Err(Error::ShuttingDown);
        }
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }
        let channel =
            Channel::open(self.bus.clone(), self.channel_store.clone(), name, false).await?;
        channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Synchronous shutdown: stop every channel, disconnect every session,
    /// close the control streams, and wait for both tasks to exit.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("Stopping server");

        let channels: Vec<Arc<Channel>> = {
            let mut channels = self.channels.lock().await;
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            trace!(channel = %channel.name, "Closing channel");
            channel.stop().await;
        }

        let sessions: Vec<Arc<Session>> = {
            self.sessions.read().await.values().cloned().collect()
        };
        for session in sessions {
            session.disconnect().await;
        }

        // Closing the streams drains the session task; cancellation reaps
        // the presence task.
        self.register_tx.lock().await.take();
        self.unregister_tx.lock().await.take();
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        trace!("Stop success");
    }

    async fn session_loop(
        self: Arc<Self>,
        mut register_rx: mpsc::Receiver<Arc<Session>>,
        mut unregister_rx: mpsc::Receiver<Arc<Session>>,
    ) {
        trace!("Listen for session requests");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                session = register_rx.recv() => match session {
                    Some(session) => self.on_register_session(session).await,
                    None => break,
                },
                session = unregister_rx.recv() => match session {
                    Some(session) => self.on_unregister_session(session).await,
                    None => break,
                },
            }
        }

        trace!("Session control going away");
    }

    async fn on_register_session(&self, session: Arc<Session>) {
        let subscriber = session.subscriber().await;
        trace!(name = %subscriber.name, "Register session");

        if self.is_stopping() {
            // Too late for this one; tear it down cleanly.
            session.set_registered();
            let session = session.clone();
            tokio::spawn(async move { session.disconnect().await });
            return;
        }

        if let Err(err) = self.canonicalize(&session, &subscriber).await {
            error!("Store failure during registration: {}", err);
            let mut ack = Message::new(MessageType::Ack, Action::SubscriberJoined);
            ack.status = Status::Failed;
            ack.message = "Registration failed".to_string();
            if let Ok(frame) = ack.encode() {
                let _ = session.enqueue(frame);
            }
            session.set_registered();
            let session = session.clone();
            tokio::spawn(async move { session.disconnect().await });
            return;
        }
        let subscriber = session.subscriber().await;

        // Tell every node, then hand the newcomer the current roster.
        let joined = Message::new(MessageType::Broadcast, Action::SubscriberJoined)
            .with_session(subscriber.clone());
        match joined.encode() {
            Ok(frame) => {
                if let Err(err) = self.bus.publish(MAIN_TOPIC, frame).await {
                    error!("Publish subscriber-joined failed: {}", err);
                }
            }
            Err(err) => error!("Encoding failed: {}", err),
        }

        let roster = { self.roster.read().await.clone() };
        let mut seen = HashSet::new();
        for known in roster {
            if !seen.insert(known.id.clone()) {
                continue;
            }
            let frame = Message::new(MessageType::Broadcast, Action::SubscriberJoined)
                .with_session(known);
            if let Ok(frame) = frame.encode() {
                let _ = session.enqueue(frame);
            }
        }

        self.sessions.write().await.insert(session.id, session.clone());
        session.set_registered();
        trace!("End register session");
    }

    /// Reconcile the connecting identity with the store.
    async fn canonicalize(&self, session: &Arc<Session>, subscriber: &Subscriber) -> Result<()> {
        match subscriber.kind {
            SubscriberKind::Registered => {
                match self.subscriber_store.get(&subscriber.id).await? {
                    // The stored row wins: canonical id, email, and name.
                    Some(stored) => session.rebind_subscriber(stored).await,
                    None => match self.subscriber_store.add(subscriber).await {
                        Ok(()) | Err(Error::AlreadyExists(_)) => {}
                        Err(err) => return Err(err),
                    },
                }
            }
            SubscriberKind::Anonymous => {
                if self.record_transient {
                    match self.subscriber_store.add_transient(subscriber).await {
                        Ok(()) | Err(Error::AlreadyExists(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_unregister_session(&self, session: Arc<Session>) {
        if self.sessions.write().await.remove(&session.id).is_none() {
            return;
        }
        let subscriber = session.subscriber().await;
        trace!(name = %subscriber.name, "Unregister session");

        let left =
            Message::new(MessageType::Broadcast, Action::SubscriberLeft).with_session(subscriber);
        match left.encode() {
            Ok(frame) => {
                if let Err(err) = self.bus.publish(MAIN_TOPIC, frame).await {
                    error!("Publish subscriber-left failed: {}", err);
                }
            }
            Err(err) => error!("Encoding failed: {}", err),
        }
    }

    async fn presence_loop(self: Arc<Self>, mut subscription: BusSubscription) {
        trace!("Listen for subscriber requests");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    subscription.close();
                    break;
                }
                payload = subscription.recv() => {
                    let Some(payload) = payload else { break };
                    let message = match Message::decode(&payload) {
                        Ok(message) => message,
                        Err(err) => {
                            error!("Dropping malformed control frame: {}", err);
                            continue;
                        }
                    };
                    self.dispatch_control(message, &payload).await;
                }
            }
        }

        trace!("Presence control going away");
    }

    /// Pure switch over the control actions; everything else is dropped.
    async fn dispatch_control(&self, message: Message, payload: &[u8]) {
        match message.action {
            Action::SubscriberJoined | Action::JoinedChannel => {
                self.roster_add(&message).await;
                self.notify_sessions(payload).await;
            }
            Action::SubscriberLeft | Action::LeaveChannel => {
                self.roster_remove(&message).await;
                self.notify_sessions(payload).await;
            }
            Action::JoinPrivateChannel => self.on_join_private(&message).await,
            other => {
                trace!(action = other.as_str(), "Ignoring control frame");
            }
        }
    }

    async fn roster_add(&self, message: &Message) {
        let Some(participant) = &message.session else {
            return;
        };
        let mut roster = self.roster.write().await;
        if !roster
            .iter()
            .any(|known| known.id == participant.subscriber.id)
        {
            roster.push(participant.subscriber.clone());
        }
    }

    async fn roster_remove(&self, message: &Message) {
        let Some(participant) = &message.session else {
            return;
        };
        self.roster
            .write()
            .await
            .retain(|known| known.id != participant.subscriber.id);
    }

    /// Forward a control frame to every local session.
    async fn notify_sessions(&self, payload: &[u8]) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.enqueue(payload.to_vec()).is_err() {
                trace!("Dropping control frame for session");
            }
        }
    }

    /// Arrange a locally connected subscriber into a (private) channel.
    async fn on_join_private(&self, message: &Message) {
        let Some(subscriber_id) = message.originator_id().map(str::to_string) else {
            return;
        };
        let target = {
            let sessions = self.sessions.read().await;
            let mut found = None;
            for session in sessions.values() {
                if session.subscriber().await.id == subscriber_id {
                    found = Some(session.clone());
                    break;
                }
            }
            found
        };
        let Some(session) = target else { return };
        if let Err(err) = session.join_channel(&message.channel_name).await {
            warn!(
                channel = %message.channel_name,
                "Private join failed: {}",
                err
            );
        }
    }
}
