use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, MessageStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged as the `signal` of call events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A participant reference as the server sends it: either a bare id or a
/// populated user document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantRef {
    Id(UserId),
    Profile {
        #[serde(rename = "_id")]
        id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ParticipantRef {
    pub fn id(&self) -> &UserId {
        match self {
            Self::Id(id) => id,
            Self::Profile { id, .. } => id,
        }
    }
}

impl From<UserId> for ParticipantRef {
    fn from(value: UserId) -> Self {
        Self::Id(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub from: ParticipantRef,
    pub to: ParticipantRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "createdAt", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub read: bool,
}

impl MessagePayload {
    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_flags(self.delivered, self.read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default, alias = "username")]
    pub name: Option<String>,
    #[serde(default)]
    pub online: bool,
}

/// Events the client emits over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    CallUser {
        to: UserId,
        from: UserId,
        name: String,
        signal: SessionDescription,
    },
    AnswerCall {
        to: UserId,
        from: UserId,
        signal: SessionDescription,
    },
    RejectCall {
        to: UserId,
        from: UserId,
    },
    EndCall {
        to: UserId,
    },
    PrivateMessage {
        from: UserId,
        to: UserId,
        content: String,
    },
    MarkAsRead {
        from: UserId,
    },
    DeleteMessage(MessageId),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallUser { .. } => "call_user",
            Self::AnswerCall { .. } => "answer_call",
            Self::RejectCall { .. } => "reject_call",
            Self::EndCall { .. } => "end_call",
            Self::PrivateMessage { .. } => "private_message",
            Self::MarkAsRead { .. } => "mark_as_read",
            Self::DeleteMessage(_) => "delete_message",
        }
    }
}

/// Events the server pushes over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    IncomingCall {
        from: UserId,
        signal: SessionDescription,
        #[serde(default)]
        name: Option<String>,
    },
    CallAnswered {
        signal: SessionDescription,
    },
    CallRejected {},
    CallEnded {},
    PrivateMessage(MessagePayload),
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    MessagesRead {
        from: UserId,
        to: UserId,
    },
    MessageDeleted(MessageId),
    UserOnline(UserId),
    UserOffline(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncomingCall,
    CallAnswered,
    CallRejected,
    CallEnded,
    PrivateMessage,
    MessageDelivered,
    MessagesRead,
    MessageDeleted,
    UserOnline,
    UserOffline,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::IncomingCall,
        EventKind::CallAnswered,
        EventKind::CallRejected,
        EventKind::CallEnded,
        EventKind::PrivateMessage,
        EventKind::MessageDelivered,
        EventKind::MessagesRead,
        EventKind::MessageDeleted,
        EventKind::UserOnline,
        EventKind::UserOffline,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::IncomingCall => "incoming_call",
            Self::CallAnswered => "call_answered",
            Self::CallRejected => "call_rejected",
            Self::CallEnded => "call_ended",
            Self::PrivateMessage => "private_message",
            Self::MessageDelivered => "message_delivered",
            Self::MessagesRead => "messages_read",
            Self::MessageDeleted => "message_deleted",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
        }
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::IncomingCall { .. } => EventKind::IncomingCall,
            Self::CallAnswered { .. } => EventKind::CallAnswered,
            Self::CallRejected {} => EventKind::CallRejected,
            Self::CallEnded {} => EventKind::CallEnded,
            Self::PrivateMessage(_) => EventKind::PrivateMessage,
            Self::MessageDelivered { .. } => EventKind::MessageDelivered,
            Self::MessagesRead { .. } => EventKind::MessagesRead,
            Self::MessageDeleted(_) => EventKind::MessageDeleted,
            Self::UserOnline(_) => EventKind::UserOnline,
            Self::UserOffline(_) => EventKind::UserOffline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_events_use_wire_names_and_payload_shapes() {
        let request = ClientRequest::CallUser {
            to: UserId::from("bob"),
            from: UserId::from("alice"),
            name: "Alice".to_string(),
            signal: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["type"], "call_user");
        assert_eq!(value["payload"]["to"], "bob");
        assert_eq!(value["payload"]["signal"]["type"], "offer");
        assert_eq!(value["payload"]["signal"]["sdp"], "v=0");

        let delete = serde_json::to_value(ClientRequest::DeleteMessage(MessageId::from("m1")))
            .expect("encode");
        assert_eq!(delete["type"], "delete_message");
        assert_eq!(delete["payload"], "m1");
    }

    #[test]
    fn decodes_inbound_message_with_populated_participants() {
        let raw = r#"{
            "type": "private_message",
            "payload": {
                "_id": "m42",
                "from": {"_id": "bob", "name": "Bob"},
                "to": "alice",
                "content": "hi",
                "createdAt": "2024-01-01T00:00:00Z",
                "delivered": true
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        let ServerEvent::PrivateMessage(message) = event else {
            panic!("unexpected event");
        };
        assert_eq!(message.from.id(), &UserId::from("bob"));
        assert_eq!(message.to.id(), &UserId::from("alice"));
        assert_eq!(message.status(), MessageStatus::Delivered);
    }

    #[test]
    fn decodes_payloadless_and_bare_id_events() {
        let rejected: ServerEvent =
            serde_json::from_str(r#"{"type":"call_rejected","payload":{}}"#).expect("decode");
        assert_eq!(rejected.kind(), EventKind::CallRejected);

        let delivered: ServerEvent =
            serde_json::from_str(r#"{"type":"message_delivered","payload":{"messageId":"m1"}}"#)
                .expect("decode");
        assert_eq!(
            delivered,
            ServerEvent::MessageDelivered {
                message_id: MessageId::from("m1")
            }
        );

        let online: ServerEvent =
            serde_json::from_str(r#"{"type":"user_online","payload":"bob"}"#).expect("decode");
        assert_eq!(online, ServerEvent::UserOnline(UserId::from("bob")));
    }

    #[test]
    fn status_follows_read_then_delivered_flags() {
        assert_eq!(MessageStatus::from_flags(false, false), MessageStatus::Sent);
        assert_eq!(MessageStatus::from_flags(true, false), MessageStatus::Delivered);
        assert_eq!(MessageStatus::from_flags(false, true), MessageStatus::Read);
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
    }

    #[test]
    fn signals_are_offers_or_answers_only() {
        let answer: SessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0"}"#).expect("decode");
        assert_eq!(answer, SessionDescription::answer("v=0"));
        assert!(
            serde_json::from_str::<SessionDescription>(r#"{"type":"rollback","sdp":""}"#).is_err()
        );
    }
}
