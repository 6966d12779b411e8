//! One live WebSocket connection
//!
//! A session is the pair of tasks driving one socket: the reader turns
//! client frames into typed requests and dispatches them, the writer drains
//! the bounded outbound queue and keeps the connection alive with pings.
//! Channels and the server hold the session only to enqueue frames; the
//! socket itself never leaves these two tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::Subscriber;
use crate::workers::WorkerSupervisor;

use super::channel::Channel;
use super::message::{Action, Message, MessageType, Participant, Status};
use super::server::RelayServer;
use super::{
    CLOSE_REASON, MAX_FRAME_BYTES, OUTBOUND_QUEUE_FRAMES, PING_INTERVAL, PONG_INTERVAL,
    REGISTRATION_POLL, WRITE_DELAY,
};

/// Why an enqueue was refused. Queue-full is backpressure, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The bounded queue is saturated; the receiver is slow.
    QueueFull,
    /// The session is past the point of accepting frames.
    Closing,
}

pub(crate) enum Outbound {
    Frame(Vec<u8>),
    Stop,
}

pub struct Session {
    pub id: Uuid,
    subscriber: RwLock<Subscriber>,
    outbound: mpsc::Sender<Outbound>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    registered: AtomicBool,
    closing: AtomicBool,
    cancel: CancellationToken,
    server: Arc<RelayServer>,
}

impl Session {
    /// Create the session, queue it for registration, and start both socket
    /// tasks. Fails when the server is already shutting down.
    pub async fn spawn(
        server: Arc<RelayServer>,
        socket: WebSocket,
        subscriber: Subscriber,
    ) -> Result<Arc<Session>> {
        trace!(name = %subscriber.name, "Creating session");

        let (session, outbound_rx) = Session::build(server.clone(), subscriber, OUTBOUND_QUEUE_FRAMES);
        server.register_session(session.clone()).await?;

        let (sink, stream) = socket.split();
        let supervisor = WorkerSupervisor::instance();
        {
            let session = session.clone();
            supervisor.spawn("session-writer", async move {
                session.write_loop(sink, outbound_rx).await;
            });
        }
        {
            let session = session.clone();
            supervisor.spawn("session-reader", async move {
                session.read_loop(stream).await;
            });
        }

        Ok(session)
    }

    fn build(
        server: Arc<RelayServer>,
        subscriber: Subscriber,
        queue_frames: usize,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_frames);
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            subscriber: RwLock::new(subscriber),
            outbound,
            channels: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            server,
        });
        (session, outbound_rx)
    }

    /// Socketless session for exercising the engine directly.
    #[cfg(test)]
    pub(crate) fn for_test(
        server: Arc<RelayServer>,
        subscriber: Subscriber,
        queue_frames: usize,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        Session::build(server, subscriber, queue_frames)
    }

    /// Current identity snapshot.
    pub async fn subscriber(&self) -> Subscriber {
        self.subscriber.read().await.clone()
    }

    /// Swap in the canonical store row during registration.
    pub(crate) async fn rebind_subscriber(&self, canonical: Subscriber) {
        *self.subscriber.write().await = canonical;
    }

    pub(crate) fn set_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Push one outbound frame.
    pub fn enqueue(&self, frame: Vec<u8>) -> std::result::Result<(), EnqueueError> {
        if self.is_closing() {
            return Err(EnqueueError::Closing);
        }
        self.outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|err| match err {
                TrySendError::Full(_) => EnqueueError::QueueFull,
                TrySendError::Closed(_) => EnqueueError::Closing,
            })
    }

    /// Orderly teardown. Safe from any task and under concurrent invocation;
    /// only the first call performs work.
    pub async fn disconnect(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let name = self.subscriber().await.name;
        trace!(name = %name, "Session disconnect");

        // The socket can die between upgrade and the server's ack; wait until
        // registration has finished before unregistering.
        while !self.is_registered() {
            tokio::time::sleep(REGISTRATION_POLL).await;
        }

        let channels: Vec<Arc<Channel>> = {
            let mut channels = self.channels.lock().await;
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            if channel.unregister(self.clone()).is_err() {
                warn!(channel = %channel.name, "Unregister failed, channel is gone");
            }
        }

        self.server.unregister_session(self.clone()).await;

        // Writer flushes a close frame on the stop sentinel.
        let _ = self.outbound.try_send(Outbound::Stop);

        // Unblock a reader parked on the socket.
        self.cancel.cancel();

        trace!(name = %name, "Session disconnect done");
    }

    /// Arrange membership of `name` without producing an ack. Returns false
    /// when the session was already a member.
    pub(crate) async fn join_channel(self: &Arc<Self>, name: &str) -> Result<bool> {
        let mut channels = self.channels.lock().await;
        if channels.contains_key(name) {
            return Ok(false);
        }
        let channel = self.server.get_channel(name).await?;
        channels.insert(channel.name.clone(), channel.clone());
        drop(channels);

        if let Err(err) = channel.register(self.clone()) {
            warn!(channel = %channel.name, "Channel register failed: {}", err);
        }
        Ok(true)
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WebSocket>) {
        trace!("Listen for subscriber messages");

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = timeout(PONG_INTERVAL, stream.next()) => match read {
                    // Read deadline: the peer stopped answering pings.
                    Err(_) => {
                        debug!("Read deadline expired");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        debug!("WebSocket read error: {}", err);
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                },
            };

            match frame {
                WsMessage::Text(text) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!(bytes = text.len(), "Oversized frame dropped");
                        continue;
                    }
                    self.handle_request(text.as_bytes()).await;
                }
                // A pong refreshes the deadline simply by completing the read.
                WsMessage::Pong(_) | WsMessage::Ping(_) => {}
                WsMessage::Close(_) => break,
                WsMessage::Binary(_) => {
                    warn!("Binary frame dropped");
                }
            }
        }

        self.disconnect().await;
        trace!("Reader going away");
    }

    async fn handle_request(self: &Arc<Self>, raw: &[u8]) {
        let mut message = match Message::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                error!("Decode message failed: {}", err);
                return;
            }
        };

        // Replies reuse the request id; the originator snapshot is always
        // this session, whatever the client claimed.
        message.session = Some(Participant {
            subscriber: self.subscriber().await,
        });

        match message.action {
            Action::SendMessage => self.on_send_message(message).await,
            Action::JoinChannel => self.on_join_channel(message).await,
            Action::LeaveChannel => self.on_leave_channel(message).await,
            Action::JoinPrivateChannel => self.on_join_private_channel(message).await,
            other => {
                warn!(action = other.as_str(), "Unknown request received. Ignored");
            }
        }
    }

    async fn on_send_message(self: &Arc<Self>, message: Message) {
        let channel = {
            let channels = self.channels.lock().await;
            channels.get(&message.channel_name).cloned()
        };

        let mut ack = Message::ack_for(&message);
        match channel {
            Some(channel) => {
                let mut broadcast = message.clone();
                broadcast.message_type = MessageType::Broadcast;
                if let Err(err) = channel.broadcast(broadcast) {
                    error!(channel = %channel.name, "Broadcast failed: {}", err);
                }
                ack.status = Status::Success;
                ack.message = format!("Message sent to {}", message.channel_name);
            }
            None => {
                ack.status = Status::Failed;
                ack.message = format!("Please subscribe to {}", message.channel_name);
            }
        }
        self.send_ack(ack).await;
    }

    async fn on_join_channel(self: &Arc<Self>, message: Message) {
        let mut ack = Message::ack_for(&message);
        match self.join_channel(&message.channel_name).await {
            Ok(true) => {
                ack.sub_action = Some(Action::JoinedChannel);
                ack.status = Status::Success;
                ack.message = format!("Welcome to {}", message.channel_name);
            }
            Ok(false) => {
                ack.sub_action = Some(Action::JoinedChannel);
                ack.status = Status::Success;
                ack.message = format!("Already joined {}", message.channel_name);
            }
            Err(err) => {
                error!("Failed to join channel: {}", err);
                ack.status = Status::Failed;
                ack.message = format!("Can not join channel {}", message.channel_name);
            }
        }
        self.send_ack(ack).await;
    }

    async fn on_leave_channel(self: &Arc<Self>, message: Message) {
        let channel = {
            let mut channels = self.channels.lock().await;
            channels.remove(&message.channel_name)
        };

        let mut ack = Message::ack_for(&message);
        match channel {
            Some(channel) => {
                if let Err(err) = channel.unregister(self.clone()) {
                    warn!(channel = %channel.name, "Channel unregister failed: {}", err);
                }
                ack.sub_action = Some(Action::LeftChannel);
                ack.status = Status::Success;
                ack.message = "Bye!".to_string();
            }
            None => {
                ack.status = Status::Failed;
                ack.message = format!("Failed to leave {}", message.channel_name);
            }
        }
        self.send_ack(ack).await;
    }

    /// Reserved: invites are arranged by the HTTP layer. Sink the request.
    async fn on_join_private_channel(self: &Arc<Self>, message: Message) {
        let mut ack = Message::ack_for(&message);
        ack.status = Status::Success;
        self.send_ack(ack).await;
    }

    async fn send_ack(&self, ack: Message) {
        match ack.encode() {
            Ok(frame) => {
                if let Err(err) = self.enqueue(frame) {
                    warn!(?err, "Dropping ack");
                }
            }
            Err(err) => error!("Encoding failed: {}", err),
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, WsMessage>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        trace!("Listen for session responses");

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        loop {
            tokio::select! {
                queued = outbound.recv() => match queued {
                    None => {
                        warn!("Message queue closed");
                        let _ = timeout(WRITE_DELAY, sink.send(WsMessage::Close(None))).await;
                        break;
                    }
                    Some(Outbound::Stop) => {
                        self.send_close(&mut sink).await;
                        break;
                    }
                    Some(Outbound::Frame(frame)) => {
                        let (payload, stop_after) = Self::drain_queued(frame, &mut outbound);
                        let text = match String::from_utf8(payload) {
                            Ok(text) => text,
                            Err(err) => {
                                error!("Outbound frame is not UTF-8: {}", err);
                                continue;
                            }
                        };
                        match timeout(WRITE_DELAY, sink.send(WsMessage::Text(text))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                debug!("WebSocket write error: {}", err);
                                break;
                            }
                            Err(_) => {
                                debug!("Write deadline expired");
                                break;
                            }
                        }
                        if stop_after {
                            self.send_close(&mut sink).await;
                            break;
                        }
                    }
                },
                _ = ping.tick() => {
                    match timeout(WRITE_DELAY, sink.send(WsMessage::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!("Send ping error: {}", err);
                            break;
                        }
                        Err(_) => {
                            debug!("Ping deadline expired");
                            break;
                        }
                    }
                }
            }
        }

        let _ = sink.close().await;
        self.disconnect().await;
        trace!("Writer going away");
    }

    /// Attach whatever else is queued to the current WebSocket message,
    /// newline-separated, to amortize framing cost.
    fn drain_queued(first: Vec<u8>, outbound: &mut mpsc::Receiver<Outbound>) -> (Vec<u8>, bool) {
        let mut payload = first;
        let mut stop_after = false;
        while let Ok(next) = outbound.try_recv() {
            match next {
                Outbound::Frame(frame) => {
                    payload.push(b'\n');
                    payload.extend_from_slice(&frame);
                }
                Outbound::Stop => {
                    stop_after = true;
                    break;
                }
            }
        }
        (payload, stop_after)
    }

    async fn send_close(&self, sink: &mut SplitSink<WebSocket, WsMessage>) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: CLOSE_REASON.into(),
        };
        if let Ok(Err(err)) = timeout(WRITE_DELAY, sink.send(WsMessage::Close(Some(frame)))).await {
            debug!("WebSocket close error: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::{MemoryChannelStore, MemorySubscriberStore};

    async fn test_server() -> Arc<RelayServer> {
        let server = RelayServer::new(
            Arc::new(MemoryBus::new()),
            Arc::new(MemoryChannelStore::new()),
            Arc::new(MemorySubscriberStore::new()),
            false,
        );
        server.start().await.unwrap();
        server
    }

    async fn registered_session(
        server: &Arc<RelayServer>,
        name: &str,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, rx) = Session::for_test(
            server.clone(),
            Subscriber::anonymous(name, None),
            OUTBOUND_QUEUE_FRAMES,
        );
        server.register_session(session.clone()).await.unwrap();
        while !session.is_registered() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        (session, rx)
    }

    fn drain_frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(frame) = item {
                frames.push(Message::decode(&frame).unwrap());
            }
        }
        frames
    }

    /// Next ack frame, skipping presence broadcasts that may interleave.
    async fn next_ack(rx: &mut mpsc::Receiver<Outbound>) -> Message {
        loop {
            match timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("queue closed")
            {
                Outbound::Frame(frame) => {
                    let message = Message::decode(&frame).unwrap();
                    if message.message_type == MessageType::Ack {
                        return message;
                    }
                }
                Outbound::Stop => panic!("unexpected stop sentinel"),
            }
        }
    }

    fn request(action: Action, channel: &str) -> Vec<u8> {
        let mut message = Message::new(MessageType::Request, action);
        message.channel_name = channel.to_string();
        message.encode().unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_queue_full() {
        let server = test_server().await;
        let (session, _rx) =
            Session::for_test(server, Subscriber::anonymous("slow", None), 2);

        assert!(session.enqueue(b"a".to_vec()).is_ok());
        assert!(session.enqueue(b"b".to_vec()).is_ok());
        assert_eq!(session.enqueue(b"c".to_vec()), Err(EnqueueError::QueueFull));
    }

    #[tokio::test]
    async fn test_enqueue_refused_while_closing() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "quitter").await;

        session.disconnect().await;
        assert_eq!(
            session.enqueue(b"late".to_vec()),
            Err(EnqueueError::Closing)
        );

        // The writer-facing queue ends with the stop sentinel.
        let mut saw_stop = false;
        while let Ok(item) = rx.try_recv() {
            if matches!(item, Outbound::Stop) {
                saw_stop = true;
            }
        }
        assert!(saw_stop);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "flaky").await;

        session.disconnect().await;
        session.disconnect().await;
        session.disconnect().await;

        let mut stops = 0;
        while let Ok(item) = rx.try_recv() {
            if matches!(item, Outbound::Stop) {
                stops += 1;
            }
        }
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_registration() {
        let server = test_server().await;
        let (session, _rx) = Session::for_test(
            server.clone(),
            Subscriber::anonymous("early", None),
            OUTBOUND_QUEUE_FRAMES,
        );

        // Socket died before the server ack: disconnect must block until the
        // registration lands, then unregister cleanly.
        let disconnecting = {
            let session = session.clone();
            tokio::spawn(async move { session.disconnect().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!disconnecting.is_finished());

        server.register_session(session.clone()).await.unwrap();
        timeout(std::time::Duration::from_secs(5), disconnecting)
            .await
            .expect("disconnect never finished")
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_without_join_fails() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        session
            .handle_request(&request(Action::SendMessage, "channel1"))
            .await;

        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.status, Status::Failed);
        assert_eq!(ack.message, "Please subscribe to channel1");
    }

    #[tokio::test]
    async fn test_join_then_duplicate_join() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        session
            .handle_request(&request(Action::JoinChannel, "channel1"))
            .await;
        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.status, Status::Success);
        assert_eq!(ack.sub_action, Some(Action::JoinedChannel));
        assert_eq!(ack.message, "Welcome to channel1");

        session
            .handle_request(&request(Action::JoinChannel, "channel1"))
            .await;
        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.status, Status::Success);
        assert_eq!(ack.message, "Already joined channel1");
    }

    #[tokio::test]
    async fn test_leave_without_join_fails() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        session
            .handle_request(&request(Action::LeaveChannel, "channel1"))
            .await;
        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.status, Status::Failed);
        assert_eq!(ack.message, "Failed to leave channel1");
    }

    #[tokio::test]
    async fn test_join_leave_then_send_fails() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        session
            .handle_request(&request(Action::JoinChannel, "channel1"))
            .await;
        let _welcome = next_ack(&mut rx).await;

        session
            .handle_request(&request(Action::LeaveChannel, "channel1"))
            .await;
        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.sub_action, Some(Action::LeftChannel));
        assert_eq!(ack.status, Status::Success);

        session
            .handle_request(&request(Action::SendMessage, "channel1"))
            .await;
        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.status, Status::Failed);
        assert_eq!(ack.message, "Please subscribe to channel1");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        session.handle_request(b"{not json").await;
        session.handle_request(b"{}").await;

        assert!(drain_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_ignored() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        let raw = format!(
            r#"{{"id":"{}","messagetype":0,"requesttype":"no-such-action","channelname":"x"}}"#,
            Uuid::new_v4()
        );
        session.handle_request(raw.as_bytes()).await;
        assert!(drain_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_private_channel_is_acked() {
        let server = test_server().await;
        let (session, mut rx) = registered_session(&server, "santzky").await;
        drain_frames(&mut rx);

        session
            .handle_request(&request(Action::JoinPrivateChannel, "secret"))
            .await;
        let ack = next_ack(&mut rx).await;
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.status, Status::Success);
    }
}
