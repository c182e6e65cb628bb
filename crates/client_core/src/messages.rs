use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{LocalUser, MessageId, MessageStatus, UserId, TEMP_MESSAGE_ID_PREFIX},
    protocol::{ClientRequest, MessagePayload},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::{AttachmentDraft, AttachmentUpload, ChatApi},
    error::ClientError,
    presence::PresenceTracker,
    transport::EventSink,
    ClientEvent,
};

/// Status upgrades received for ids not seen yet are held up to this many.
pub const PENDING_UPGRADE_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Image(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub from: UserId,
    pub to: UserId,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub pending_confirmation: bool,
}

impl Message {
    fn from_payload(payload: MessagePayload) -> Self {
        let status = payload.status();
        let attachment = match (payload.image, payload.file) {
            (Some(image), _) => Some(Attachment::Image(image)),
            (None, Some(file)) => Some(Attachment::File(file)),
            (None, None) => None,
        };
        Self {
            id: payload.id,
            from: payload.from.id().clone(),
            to: payload.to.id().clone(),
            content: payload.content,
            attachment,
            created_at: payload.created_at,
            status,
            pending_confirmation: false,
        }
    }

    fn partner<'a>(&'a self, me: &UserId) -> &'a UserId {
        if &self.from == me {
            &self.to
        } else {
            &self.from
        }
    }
}

#[derive(Default)]
struct Conversations {
    open_partner: Option<UserId>,
    threads: HashMap<UserId, Vec<Message>>,
    pending_upgrades: VecDeque<(MessageId, MessageStatus)>,
}

impl Conversations {
    fn find_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.threads
            .values_mut()
            .flat_map(|thread| thread.iter_mut())
            .find(|message| &message.id == id)
    }

    fn find(&self, id: &MessageId) -> Option<&Message> {
        self.threads
            .values()
            .flat_map(|thread| thread.iter())
            .find(|message| &message.id == id)
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        for thread in self.threads.values_mut() {
            if let Some(index) = thread.iter().position(|message| &message.id == id) {
                return Some(thread.remove(index));
            }
        }
        None
    }

    fn buffer_upgrade(&mut self, id: MessageId, status: MessageStatus) {
        if self.pending_upgrades.len() >= PENDING_UPGRADE_LIMIT {
            self.pending_upgrades.pop_front();
        }
        self.pending_upgrades.push_back((id, status));
    }

    /// Removes buffered upgrades for `id`, returning the highest.
    fn take_buffered(&mut self, id: &MessageId) -> Option<MessageStatus> {
        let mut best = None;
        self.pending_upgrades.retain(|(pending_id, status)| {
            if pending_id == id {
                best = best.max(Some(*status));
                false
            } else {
                true
            }
        });
        best
    }
}

/// Keeps per-conversation message lists and their delivery status in step
/// with the server.
pub struct MessageReconciler {
    local_user: LocalUser,
    api: Arc<dyn ChatApi>,
    sink: Arc<dyn EventSink>,
    presence: Arc<PresenceTracker>,
    state: Mutex<Conversations>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageReconciler {
    pub fn new(
        local_user: LocalUser,
        api: Arc<dyn ChatApi>,
        sink: Arc<dyn EventSink>,
        presence: Arc<PresenceTracker>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            local_user,
            api,
            sink,
            presence,
            state: Mutex::new(Conversations::default()),
            events,
        }
    }

    pub async fn open_partner(&self) -> Option<UserId> {
        self.state.lock().await.open_partner.clone()
    }

    pub async fn messages_with(&self, peer: &UserId) -> Vec<Message> {
        self.state
            .lock()
            .await
            .threads
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.state.lock().await.find(id).cloned()
    }

    pub async fn close_conversation(&self) {
        self.state.lock().await.open_partner = None;
    }

    /// Selects `peer` as the open conversation and loads its history.
    pub async fn open_conversation(&self, peer: UserId) -> Result<Vec<Message>, ClientError> {
        self.state.lock().await.open_partner = Some(peer.clone());

        let history = self
            .api
            .fetch_history(&self.local_user.id, &peer)
            .await
            .map_err(|err| ClientError::Api(format!("{err:#}")))?;

        let messages = {
            let mut state = self.state.lock().await;
            for payload in history {
                let mut message = Message::from_payload(payload);
                if let Some(buffered) = state.take_buffered(&message.id) {
                    message.status = message.status.max(buffered);
                }
                if let Some(existing) = state.find_mut(&message.id) {
                    self.raise_status(existing, message.status);
                    continue;
                }
                let echoed =
                    message.from == self.local_user.id && self.confirm_echo(&mut state, &message);
                if !echoed {
                    state.threads.entry(peer.clone()).or_default().push(message);
                }
            }
            let thread = state.threads.entry(peer.clone()).or_default();
            thread.sort_by_key(|message| message.created_at);
            thread.clone()
        };
        info!(peer_id = %peer, messages = messages.len(), "messages: conversation opened");

        let _ = self.events.send(ClientEvent::ConversationLoaded {
            peer: peer.clone(),
            messages: messages.clone(),
        });
        self.transmit(ClientRequest::MarkAsRead { from: peer });
        Ok(messages)
    }

    /// Sends a text message to the open conversation partner. Returns the
    /// temporary id, or `None` when the channel was down and nothing was sent.
    pub async fn send_text(&self, content: &str) -> Result<Option<MessageId>, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let peer = self.open_partner().await.ok_or(ClientError::NoConversation)?;
        let status = self.seeded_status(&peer).await;

        let mut state = self.state.lock().await;
        let sent = self.sink.emit(ClientRequest::PrivateMessage {
            from: self.local_user.id.clone(),
            to: peer.clone(),
            content: content.to_string(),
        });
        if !sent {
            debug!(peer_id = %peer, "messages: channel not connected; send skipped");
            return Ok(None);
        }

        let message = Message {
            id: MessageId::new(format!("{TEMP_MESSAGE_ID_PREFIX}{}", Uuid::new_v4())),
            from: self.local_user.id.clone(),
            to: peer.clone(),
            content: Some(content.to_string()),
            attachment: None,
            created_at: Utc::now(),
            status,
            pending_confirmation: true,
        };
        let id = message.id.clone();
        state.threads.entry(peer).or_default().push(message.clone());
        drop(state);

        let _ = self.events.send(ClientEvent::MessageAppended(message));
        Ok(Some(id))
    }

    pub async fn send_with_attachments(
        &self,
        content: Option<&str>,
        attachments: Vec<AttachmentUpload>,
    ) -> Result<Vec<Message>, ClientError> {
        let content = content
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .map(str::to_string);
        if content.is_none() && attachments.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let peer = self.open_partner().await.ok_or(ClientError::NoConversation)?;

        let stored = self
            .api
            .send_attachments(AttachmentDraft {
                from: self.local_user.id.clone(),
                to: peer.clone(),
                content,
                attachments,
            })
            .await
            .map_err(|err| ClientError::Api(format!("{err:#}")))?;
        let seeded = self.seeded_status(&peer).await;

        let mut appended = Vec::new();
        let mut state = self.state.lock().await;
        for payload in stored {
            let mut message = Message::from_payload(payload);
            message.status = message.status.max(seeded);
            if let Some(buffered) = state.take_buffered(&message.id) {
                message.status = message.status.max(buffered);
            }
            if let Some(existing) = state.find_mut(&message.id) {
                self.raise_status(existing, message.status);
                continue;
            }
            state
                .threads
                .entry(peer.clone())
                .or_default()
                .push(message.clone());
            appended.push(message);
        }
        drop(state);

        for message in &appended {
            let _ = self.events.send(ClientEvent::MessageAppended(message.clone()));
        }
        Ok(appended)
    }

    pub async fn handle_inbound(&self, payload: MessagePayload) {
        let me = &self.local_user.id;
        let from = payload.from.id().clone();
        let to = payload.to.id().clone();
        if &from != me && &to != me {
            debug!(message_id = %payload.id, "messages: ignoring message for other users");
            return;
        }

        let mut incoming = Message::from_payload(payload);
        let mut appended = None;
        let mut state = self.state.lock().await;
        if let Some(buffered) = state.take_buffered(&incoming.id) {
            incoming.status = incoming.status.max(buffered);
        }

        if let Some(existing) = state.find_mut(&incoming.id) {
            self.raise_status(existing, incoming.status);
        } else if &from == me && self.confirm_echo(&mut state, &incoming) {
            debug!(id = %incoming.id, "messages: optimistic message confirmed");
        } else {
            let partner = incoming.partner(me).clone();
            state.threads.entry(partner).or_default().push(incoming.clone());
            appended = Some(incoming);
        }

        let read_now = &to == me && state.open_partner.as_ref() == Some(&from);
        drop(state);

        if let Some(message) = appended {
            let _ = self.events.send(ClientEvent::MessageAppended(message));
        }
        if read_now {
            self.transmit(ClientRequest::MarkAsRead { from });
        }
    }

    /// Swaps the temporary id of the oldest matching unconfirmed message for
    /// the server id carried by its echo.
    fn confirm_echo(&self, state: &mut Conversations, echo: &Message) -> bool {
        let Some(pending) = state.threads.get_mut(&echo.to).and_then(|thread| {
            thread.iter_mut().find(|message| {
                message.pending_confirmation
                    && message.from == echo.from
                    && message.to == echo.to
                    && message.content == echo.content
            })
        }) else {
            return false;
        };
        let temp_id = std::mem::replace(&mut pending.id, echo.id.clone());
        pending.pending_confirmation = false;
        pending.created_at = echo.created_at;
        let _ = self.events.send(ClientEvent::MessageConfirmed {
            temp_id,
            id: echo.id.clone(),
        });
        self.raise_status(pending, echo.status);
        true
    }

    pub async fn handle_delivered(&self, id: MessageId) {
        let mut state = self.state.lock().await;
        match state.find_mut(&id) {
            Some(message) => {
                if message.status == MessageStatus::Sent {
                    self.raise_status(message, MessageStatus::Delivered);
                }
            }
            None => {
                debug!(message_id = %id, "messages: buffering delivery for unknown message");
                state.buffer_upgrade(id, MessageStatus::Delivered);
            }
        }
    }

    /// Marks everything `from` sent to `to` as read. No other pair changes.
    pub async fn handle_read(&self, from: UserId, to: UserId) {
        let me = &self.local_user.id;
        let partner = if &from == me { &to } else { &from };
        let mut state = self.state.lock().await;
        let Some(thread) = state.threads.get_mut(partner) else {
            return;
        };
        for message in thread
            .iter_mut()
            .filter(|message| message.from == from && message.to == to)
        {
            self.raise_status(message, MessageStatus::Read);
        }
    }

    /// Upgrades still-SENT messages to `peer` once it is reachable, when it
    /// is the open conversation partner.
    pub async fn upgrade_reachable(&self, peer: &UserId) {
        let mut state = self.state.lock().await;
        if state.open_partner.as_ref() != Some(peer) {
            return;
        }
        let Some(thread) = state.threads.get_mut(peer) else {
            return;
        };
        for message in thread.iter_mut().filter(|message| {
            &message.to == peer && message.status == MessageStatus::Sent
        }) {
            self.raise_status(message, MessageStatus::Delivered);
        }
    }

    /// Deletes one of the local user's confirmed messages everywhere.
    pub async fn delete_message(&self, id: &MessageId) -> Result<(), ClientError> {
        {
            let state = self.state.lock().await;
            let Some(message) = state.find(id) else {
                debug!(message_id = %id, "messages: delete for unknown message");
                return Ok(());
            };
            if message.pending_confirmation || id.is_temporary() {
                return Err(ClientError::UnconfirmedMessage(id.clone()));
            }
            if message.from != self.local_user.id {
                return Err(ClientError::NotMessageAuthor(id.clone()));
            }
        }

        self.api
            .delete_message(id)
            .await
            .map_err(|err| ClientError::Api(format!("{err:#}")))?;

        let removed = self.state.lock().await.remove(id);
        if removed.is_some() {
            let _ = self
                .events
                .send(ClientEvent::MessageRemoved { id: id.clone() });
        }
        info!(message_id = %id, "messages: message deleted");
        self.transmit(ClientRequest::DeleteMessage(id.clone()));
        Ok(())
    }

    pub async fn handle_deleted(&self, id: MessageId) {
        let removed = self.state.lock().await.remove(&id);
        if removed.is_some() {
            let _ = self.events.send(ClientEvent::MessageRemoved { id });
        }
    }

    async fn seeded_status(&self, peer: &UserId) -> MessageStatus {
        if self.presence.is_online(peer).await {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }

    /// Moves `message` forward to `status`. Never regresses.
    fn raise_status(&self, message: &mut Message, status: MessageStatus) {
        if status <= message.status {
            return;
        }
        message.status = status;
        let _ = self.events.send(ClientEvent::MessageStatusChanged {
            id: message.id.clone(),
            status,
        });
    }

    fn transmit(&self, request: ClientRequest) {
        let name = request.name();
        if !self.sink.emit(request) {
            warn!(event = name, "messages: channel not connected; event dropped");
        }
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
