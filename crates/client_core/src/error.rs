use shared::domain::{CallPhase, MessageId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no auth token available; sign in before connecting")]
    AuthRequired,
    #[error("Microphone access is required to make a call: {0}")]
    MediaUnavailable(String),
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
    #[error("stale {event} event ignored in phase {phase:?}")]
    StaleEvent {
        event: &'static str,
        phase: CallPhase,
    },
    #[error("a call is already in progress")]
    CallInProgress,
    #[error("cannot {action} while call phase is {phase:?}")]
    InvalidCallPhase {
        action: &'static str,
        phase: CallPhase,
    },
    #[error("call attempt was cancelled before it completed")]
    CallCancelled,
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
    #[error("no conversation is open")]
    NoConversation,
    #[error("message must have content or attachments")]
    EmptyMessage,
    #[error("message {0} is not yet confirmed by the server")]
    UnconfirmedMessage(MessageId),
    #[error("message {0} was not authored by the local user")]
    NotMessageAuthor(MessageId),
    #[error("api request failed: {0}")]
    Api(String),
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleEvent { .. })
    }
}
