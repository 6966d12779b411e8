//! Wire envelope shared by clients, nodes, and the bus

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::Subscriber;

/// Direction/kind of an envelope.
///
/// The id ties each ack back to its request; the type tells the receiver
/// whether a reply is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    /// Requires exactly one ack from the other side.
    Request = 0,
    /// Reply to a request, keyed by its id.
    Ack = 1,
    /// Fan-out frame; no reply owed.
    Broadcast = 2,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Ack),
            2 => Ok(MessageType::Broadcast),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// Closed set of request actions. Anything off the list decodes to
/// [`Action::Unknown`], which handlers log and drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Action {
    #[serde(rename = "send-msg")]
    SendMessage,
    #[serde(rename = "join-channel")]
    JoinChannel,
    #[serde(rename = "leave-channel")]
    LeaveChannel,
    #[serde(rename = "joined-channel")]
    JoinedChannel,
    #[serde(rename = "left-channel")]
    LeftChannel,
    #[serde(rename = "join-private-channel")]
    JoinPrivateChannel,
    #[serde(rename = "subscriber-joined")]
    SubscriberJoined,
    #[serde(rename = "subscriber-left")]
    SubscriberLeft,
    #[serde(rename = "unknown")]
    Unknown,
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.as_str() {
            "send-msg" => Action::SendMessage,
            "join-channel" => Action::JoinChannel,
            "leave-channel" => Action::LeaveChannel,
            "joined-channel" => Action::JoinedChannel,
            "left-channel" => Action::LeftChannel,
            "join-private-channel" => Action::JoinPrivateChannel,
            "subscriber-joined" => Action::SubscriberJoined,
            "subscriber-left" => Action::SubscriberLeft,
            _ => Action::Unknown,
        }
    }
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SendMessage => "send-msg",
            Action::JoinChannel => "join-channel",
            Action::LeaveChannel => "leave-channel",
            Action::JoinedChannel => "joined-channel",
            Action::LeftChannel => "left-channel",
            Action::JoinPrivateChannel => "join-private-channel",
            Action::SubscriberJoined => "subscriber-joined",
            Action::SubscriberLeft => "subscriber-left",
            Action::Unknown => "unknown",
        }
    }
}

/// Request outcome carried on acks; empty on everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
    #[default]
    #[serde(rename = "")]
    None,
}

/// Snapshot of the originating session carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Participant {
    #[serde(default)]
    pub subscriber: Subscriber,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,

    #[serde(rename = "messagetype")]
    pub message_type: MessageType,

    #[serde(rename = "requesttype")]
    pub action: Action,

    #[serde(
        rename = "requestsubtype",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sub_action: Option<Action>,

    #[serde(default)]
    pub message: String,

    #[serde(rename = "channelname", default)]
    pub channel_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Participant>,

    #[serde(default)]
    pub status: Status,
}

impl Message {
    pub fn new(message_type: MessageType, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            action,
            sub_action: None,
            message: String::new(),
            channel_name: String::new(),
            session: None,
            status: Status::None,
        }
    }

    /// The ack skeleton for a request: same id, action, channel, and
    /// originator; status filled in by the handler.
    pub fn ack_for(request: &Message) -> Self {
        Self {
            id: request.id,
            message_type: MessageType::Ack,
            action: request.action,
            sub_action: None,
            message: String::new(),
            channel_name: request.channel_name.clone(),
            session: request.session.clone(),
            status: Status::None,
        }
    }

    pub fn with_session(mut self, subscriber: Subscriber) -> Self {
        self.session = Some(Participant { subscriber });
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Subscriber id of the originator, when the envelope carries one.
    pub fn originator_id(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|participant| participant.subscriber.id.as_str())
    }
}
