//! Per-channel actor
//!
//! A channel runs two tasks: the control task owns the local session set and
//! bridges broadcast requests onto the bus; the bus-subscriber task fans
//! frames arriving on the channel topic out to every local session except
//! the originator. Local membership is per-node; the global membership is
//! whatever the union across the fleet happens to be.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::store::{ChannelRecord, ChannelStore};
use crate::workers::WorkerSupervisor;

use super::message::{Action, Message, MessageType, Participant};
use super::session::{EnqueueError, Session};

const STREAM_CAPACITY: usize = 64;

pub struct Channel {
    pub id: Uuid,
    pub name: String,
    private: bool,

    /// Local members keyed by subscriber id; written only by the control
    /// task, read by the bus-subscriber task.
    sessions: RwLock<HashMap<String, Arc<Session>>>,

    register_tx: mpsc::Sender<Arc<Session>>,
    unregister_tx: mpsc::Sender<Arc<Session>>,
    broadcast_tx: mpsc::Sender<Message>,

    cancel: CancellationToken,
    stopping: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    bus: Arc<dyn Bus>,
}

impl Channel {
    /// Hydrate the channel from the store (creating the row when new) and
    /// start both tasks. Returns once the bus subscription is live, so a
    /// frame published right after `open` cannot be missed locally.
    pub async fn open(
        bus: Arc<dyn Bus>,
        store: Arc<dyn ChannelStore>,
        name: &str,
        private: bool,
    ) -> Result<Arc<Channel>> {
        if name.is_empty() || name.len() > 255 {
            return Err(Error::Protocol(format!("Invalid channel name: {:?}", name)));
        }

        let (id, private) = match store.get(name).await? {
            Some(record) => {
                trace!(channel = name, "Restored channel");
                (parse_row_id(&record), record.private)
            }
            None => {
                let id = Uuid::new_v4();
                let record = ChannelRecord {
                    id: id.to_string(),
                    name: name.to_string(),
                    private,
                };
                match store.add(&record).await {
                    Ok(()) => (id, private),
                    Err(Error::AlreadyExists(_)) => {
                        // Another node won the insert race; adopt its row.
                        match store.get(name).await? {
                            Some(record) => (parse_row_id(&record), record.private),
                            None => {
                                return Err(Error::Other(format!(
                                    "Channel '{}' vanished after insert conflict",
                                    name
                                )))
                            }
                        }
                    }
                    Err(err) => {
                        error!("Add channel to store failed: {}", err);
                        return Err(err);
                    }
                }
            }
        };

        let (register_tx, register_rx) = mpsc::channel(STREAM_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(STREAM_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(STREAM_CAPACITY);

        let channel = Arc::new(Channel {
            id,
            name: name.to_string(),
            private,
            sessions: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            bus,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = WorkerSupervisor::instance();
        let subscriber_task = {
            let channel = channel.clone();
            supervisor.spawn("channel-subscriber", async move {
                channel.subscriber_loop(ready_tx).await;
            })
        };
        let control_task = {
            let channel = channel.clone();
            supervisor.spawn("channel-control", async move {
                channel
                    .control_loop(register_rx, unregister_rx, broadcast_rx)
                    .await;
            })
        };
        channel
            .tasks
            .lock()
            .await
            .extend([subscriber_task, control_task]);

        // Block until the pub/sub subscription is active.
        match ready_rx.await {
            Ok(Ok(())) => Ok(channel),
            Ok(Err(err)) => {
                channel.cancel.cancel();
                Err(err)
            }
            Err(_) => {
                channel.cancel.cancel();
                Err(Error::Bus(format!("Subscribe to '{}' failed", name)))
            }
        }
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queue a membership add. Non-blocking.
    pub fn register(&self, session: Arc<Session>) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::ChannelStopped(self.name.clone()));
        }
        self.register_tx
            .try_send(session)
            .map_err(|_| Error::ChannelStopped(self.name.clone()))
    }

    /// Queue a membership removal. Non-blocking.
    pub fn unregister(&self, session: Arc<Session>) -> Result<()> {
        self.unregister_tx
            .try_send(session)
            .map_err(|_| Error::ChannelStopped(self.name.clone()))
    }

    /// Queue a frame for publication on the bus. Non-blocking.
    pub fn broadcast(&self, message: Message) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::ChannelStopped(self.name.clone()));
        }
        self.broadcast_tx
            .try_send(message)
            .map_err(|_| Error::ChannelStopped(self.name.clone()))
    }

    /// Idempotent. Cancels the actor and waits for both tasks to exit; only
    /// then is the channel marked stopped.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.stopped.store(true, Ordering::Release);
    }

    /// Number of local members.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn subscriber_loop(self: Arc<Self>, ready: oneshot::Sender<Result<()>>) {
        let mut subscription = match self.bus.subscribe(&self.name).await {
            Ok(subscription) => {
                let _ = ready.send(Ok(()));
                subscription
            }
            Err(err) => {
                error!("Start channel error. Pubsub subscribe failed: {}", err);
                let _ = ready.send(Err(err));
                return;
            }
        };

        trace!(channel = %self.name, "Monitor channel messages");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(channel = %self.name, "Received a shutdown request. Winding down");
                    subscription.close();
                    break;
                }
                payload = subscription.recv() => {
                    let Some(payload) = payload else { break };
                    self.fan_out(payload).await;
                }
            }
        }

        trace!(channel = %self.name, "Listening to channel messages stopped");
    }

    /// Deliver one bus frame to every local session except the originator.
    /// A slow session misses the frame; it never stalls the rest.
    async fn fan_out(&self, payload: Vec<u8>) {
        let message = match Message::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                error!("Dropping malformed bus frame: {}", err);
                return;
            }
        };
        let originator = message.originator_id().unwrap_or_default();

        let sessions = self.sessions.read().await;
        for (subscriber_id, session) in sessions.iter() {
            if subscriber_id == originator {
                continue;
            }
            match session.enqueue(payload.clone()) {
                Ok(()) => {}
                Err(EnqueueError::QueueFull) => {
                    warn!(
                        channel = %self.name,
                        subscriber = %subscriber_id,
                        "Slow session, dropping frame"
                    );
                }
                Err(EnqueueError::Closing) => {}
            }
        }
    }

    async fn control_loop(
        self: Arc<Self>,
        mut register_rx: mpsc::Receiver<Arc<Session>>,
        mut unregister_rx: mpsc::Receiver<Arc<Session>>,
        mut broadcast_rx: mpsc::Receiver<Message>,
    ) {
        trace!(channel = %self.name, "Listening to channel requests");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                session = register_rx.recv() => match session {
                    Some(session) => {
                        if self.on_register(session).await.is_err() {
                            self.cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
                session = unregister_rx.recv() => match session {
                    Some(session) => self.on_unregister(session).await,
                    None => break,
                },
                message = broadcast_rx.recv() => match message {
                    Some(message) => {
                        if self.on_broadcast(message).await.is_err() {
                            self.cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        trace!(channel = %self.name, "Channel control going away");
    }

    async fn on_register(&self, session: Arc<Session>) -> Result<()> {
        let subscriber = session.subscriber().await;
        trace!(channel = %self.name, subscriber = %subscriber.name, "Register session");

        // Membership first, then the announcement, so the newcomer observes
        // its own join in bus order.
        self.sessions
            .write()
            .await
            .insert(subscriber.id.clone(), session);

        if !self.private {
            let mut join = Message::new(MessageType::Broadcast, Action::SendMessage);
            join.sub_action = Some(Action::JoinedChannel);
            join.channel_name = self.name.clone();
            join.message = format!("{} joined.", subscriber.name);
            join.session = Some(Participant { subscriber });

            match join.encode() {
                Ok(frame) => {
                    if let Err(err) = self.bus.publish(&self.name, frame).await {
                        error!("Publish join broadcast failed: {}", err);
                        return Err(err);
                    }
                }
                Err(err) => warn!("Encoding failed: {}", err),
            }
        }
        Ok(())
    }

    async fn on_unregister(&self, session: Arc<Session>) {
        let subscriber_id = session.subscriber().await.id;
        let remaining = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&subscriber_id);
            sessions.len()
        };
        trace!(
            channel = %self.name,
            remaining,
            stopping = self.stopping.load(Ordering::Acquire),
            "Unregister session"
        );

        // A stopping channel lingers until its last member leaves.
        if self.stopping.load(Ordering::Acquire) && remaining == 0 {
            self.cancel.cancel();
        }
    }

    /// Publish failure is fatal to this channel only.
    async fn on_broadcast(&self, message: Message) -> Result<()> {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Encoding failed: {}", err);
                return Ok(());
            }
        };
        if let Err(err) = self.bus.publish(&self.name, frame).await {
            error!(channel = %self.name, "Publish failed: {}", err);
            return Err(err);
        }
        Ok(())
    }
}

fn parse_row_id(record: &ChannelRecord) -> Uuid {
    Uuid::parse_str(&record.id).unwrap_or_else(|_| Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSubscription, MemoryBus};
    use crate::relay::server::RelayServer;
    use crate::store::{MemoryChannelStore, MemorySubscriberStore, Subscriber};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    struct Fixture {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryChannelStore>,
        server: Arc<RelayServer>,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryChannelStore::new());
        let server = RelayServer::new(
            bus.clone(),
            store.clone(),
            Arc::new(MemorySubscriberStore::new()),
            false,
        );
        server.start().await.unwrap();
        Fixture { bus, store, server }
    }

    async fn member(
        fixture: &Fixture,
        channel: &Arc<Channel>,
        name: &str,
    ) -> (
        Arc<Session>,
        tokio::sync::mpsc::Receiver<super::super::session::Outbound>,
    ) {
        let (session, rx) = Session::for_test(
            fixture.server.clone(),
            Subscriber::anonymous(name, None),
            super::super::OUTBOUND_QUEUE_FRAMES,
        );
        channel.register(session.clone()).unwrap();
        let subscriber_id = session.subscriber().await.id;
        let channel = channel.clone();
        wait_for(move || {
            let channel = channel.clone();
            let subscriber_id = subscriber_id.clone();
            async move { channel.sessions.read().await.contains_key(&subscriber_id) }
        })
        .await;
        (session, rx)
    }

    fn decode_frames(
        rx: &mut tokio::sync::mpsc::Receiver<super::super::session::Outbound>,
    ) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let super::super::session::Outbound::Frame(frame) = item {
                frames.push(Message::decode(&frame).unwrap());
            }
        }
        frames
    }

    async fn next_broadcast(
        rx: &mut tokio::sync::mpsc::Receiver<super::super::session::Outbound>,
    ) -> Message {
        loop {
            match timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for broadcast")
                .expect("queue closed")
            {
                super::super::session::Outbound::Frame(frame) => {
                    return Message::decode(&frame).unwrap()
                }
                super::super::session::Outbound::Stop => panic!("unexpected stop"),
            }
        }
    }

    #[tokio::test]
    async fn test_open_creates_store_row_once() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "channel1",
            false,
        )
        .await
        .unwrap();
        assert!(!channel.is_private());
        assert!(fixture.store.get("channel1").await.unwrap().is_some());

        // Re-opening hydrates the same row.
        let again = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "channel1",
            false,
        )
        .await
        .unwrap();
        assert_eq!(again.id, channel.id);

        channel.stop().await;
        again.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let fixture = fixture().await;
        assert!(
            Channel::open(fixture.bus.clone(), fixture.store.clone(), "", false)
                .await
                .is_err()
        );
        let long = "x".repeat(256);
        assert!(
            Channel::open(fixture.bus.clone(), fixture.store.clone(), &long, false)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_join_broadcast_reaches_members_not_joiner() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "channel1",
            false,
        )
        .await
        .unwrap();

        let (_first, mut first_rx) = member(&fixture, &channel, "resident").await;
        let (_second, mut second_rx) = member(&fixture, &channel, "santzky").await;

        let join = next_broadcast(&mut first_rx).await;
        assert_eq!(join.message_type, MessageType::Broadcast);
        assert_eq!(join.sub_action, Some(Action::JoinedChannel));
        assert_eq!(join.message, "santzky joined.");
        assert_eq!(join.channel_name, "channel1");

        // The joiner never sees its own announcement.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(decode_frames(&mut second_rx).is_empty());

        channel.stop().await;
    }

    #[tokio::test]
    async fn test_private_channel_suppresses_join_broadcast() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "backroom",
            true,
        )
        .await
        .unwrap();

        let (_first, mut first_rx) = member(&fixture, &channel, "resident").await;
        let (_second, _second_rx) = member(&fixture, &channel, "newcomer").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(decode_frames(&mut first_rx).is_empty());

        channel.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "channel1",
            false,
        )
        .await
        .unwrap();

        let (sender, mut sender_rx) = member(&fixture, &channel, "alice").await;
        let (_receiver, mut receiver_rx) = member(&fixture, &channel, "bob").await;
        // Flush the join announcements before the real traffic.
        tokio::time::sleep(Duration::from_millis(50)).await;
        decode_frames(&mut sender_rx);
        decode_frames(&mut receiver_rx);

        let mut outgoing = Message::new(MessageType::Broadcast, Action::SendMessage);
        outgoing.channel_name = "channel1".to_string();
        outgoing.message = "hello".to_string();
        outgoing.session = Some(Participant {
            subscriber: sender.subscriber().await,
        });
        channel.broadcast(outgoing).unwrap();

        let received = next_broadcast(&mut receiver_rx).await;
        assert_eq!(received.message, "hello");
        assert_eq!(received.message_type, MessageType::Broadcast);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(decode_frames(&mut sender_rx).is_empty());

        channel.stop().await;
    }

    #[tokio::test]
    async fn test_per_originator_ordering() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "ordered",
            false,
        )
        .await
        .unwrap();

        let (sender, _sender_rx) = member(&fixture, &channel, "alice").await;
        let (_receiver, mut receiver_rx) = member(&fixture, &channel, "bob").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        decode_frames(&mut receiver_rx);

        let subscriber = sender.subscriber().await;
        for body in ["x", "y", "z"] {
            let mut outgoing = Message::new(MessageType::Broadcast, Action::SendMessage);
            outgoing.channel_name = "ordered".to_string();
            outgoing.message = body.to_string();
            outgoing.session = Some(Participant {
                subscriber: subscriber.clone(),
            });
            channel.broadcast(outgoing).unwrap();
        }

        assert_eq!(next_broadcast(&mut receiver_rx).await.message, "x");
        assert_eq!(next_broadcast(&mut receiver_rx).await.message, "y");
        assert_eq!(next_broadcast(&mut receiver_rx).await.message, "z");

        channel.stop().await;
    }

    #[tokio::test]
    async fn test_slow_session_drops_frame_without_stalling_fanout() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "busy",
            false,
        )
        .await
        .unwrap();

        let (slow, mut slow_rx) = {
            let (session, rx) = Session::for_test(
                fixture.server.clone(),
                Subscriber::anonymous("snail", None),
                4,
            );
            channel.register(session.clone()).unwrap();
            let subscriber_id = session.subscriber().await.id;
            let channel = channel.clone();
            wait_for(move || {
                let channel = channel.clone();
                let subscriber_id = subscriber_id.clone();
                async move { channel.sessions.read().await.contains_key(&subscriber_id) }
            })
            .await;
            (session, rx)
        };
        let (sender, _sender_rx) = member(&fixture, &channel, "alice").await;
        let (_healthy, mut healthy_rx) = member(&fixture, &channel, "bob").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        decode_frames(&mut healthy_rx);

        // Saturate the slow session's queue so the next fan-out drops.
        let mut pad = Message::new(MessageType::Broadcast, Action::SendMessage);
        pad.message = "pad".to_string();
        let pad = pad.encode().unwrap();
        while slow.enqueue(pad.clone()).is_ok() {}
        let subscriber = sender.subscriber().await;
        for body in ["one", "two", "three"] {
            let mut outgoing = Message::new(MessageType::Broadcast, Action::SendMessage);
            outgoing.channel_name = "busy".to_string();
            outgoing.message = body.to_string();
            outgoing.session = Some(Participant {
                subscriber: subscriber.clone(),
            });
            channel.broadcast(outgoing).unwrap();
        }

        // The healthy session still gets everything, in order.
        assert_eq!(next_broadcast(&mut healthy_rx).await.message, "one");
        assert_eq!(next_broadcast(&mut healthy_rx).await.message, "two");
        assert_eq!(next_broadcast(&mut healthy_rx).await.message, "three");

        // The slow session saw none of them, only its backlog.
        let backlog = decode_frames(&mut slow_rx);
        assert!(backlog
            .iter()
            .all(|frame| !["one", "two", "three"].contains(&frame.message.as_str())));

        channel.stop().await;
    }

    /// A bus whose publishes always fail.
    struct BrokenBus {
        inner: MemoryBus,
    }

    #[async_trait]
    impl Bus for BrokenBus {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> crate::error::Result<()> {
            Err(Error::Bus("wire cut".to_string()))
        }

        async fn subscribe(&self, topic: &str) -> crate::error::Result<BusSubscription> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn test_publish_failure_stops_channel_only() {
        let fixture = fixture().await;
        let broken: Arc<dyn Bus> = Arc::new(BrokenBus {
            inner: MemoryBus::new(),
        });
        let channel = Channel::open(broken, fixture.store.clone(), "doomed", true)
            .await
            .unwrap();

        let mut outgoing = Message::new(MessageType::Broadcast, Action::SendMessage);
        outgoing.channel_name = "doomed".to_string();
        outgoing.message = "never arrives".to_string();
        channel.broadcast(outgoing).unwrap();

        // Publish failure cancels the actor.
        timeout(Duration::from_secs(5), channel.cancel.cancelled())
            .await
            .expect("channel never cancelled");
        channel.stop().await;
        assert!(channel.is_stopped());

        // A healthy sibling channel is unaffected.
        let healthy = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "healthy",
            false,
        )
        .await
        .unwrap();
        assert!(!healthy.is_stopped());
        healthy.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_tasks() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "short-lived",
            false,
        )
        .await
        .unwrap();

        channel.stop().await;
        assert!(channel.is_stopped());

        // Idempotent.
        channel.stop().await;

        // New members are refused.
        let (session, _rx) = Session::for_test(
            fixture.server.clone(),
            Subscriber::anonymous("late", None),
            4,
        );
        assert!(channel.register(session).is_err());
    }

    #[tokio::test]
    async fn test_unregister_empties_stopping_channel() {
        let fixture = fixture().await;
        let channel = Channel::open(
            fixture.bus.clone(),
            fixture.store.clone(),
            "draining",
            false,
        )
        .await
        .unwrap();

        let (session, _rx) = member(&fixture, &channel, "last-one").await;
        assert_eq!(channel.session_count().await, 1);

        channel.unregister(session).unwrap();
        let channel_ref = channel.clone();
        wait_for(move || {
            let channel = channel_ref.clone();
            async move { channel.session_count().await == 0 }
        })
        .await;

        channel.stop().await;
        assert!(channel.is_stopped());
    }
}
