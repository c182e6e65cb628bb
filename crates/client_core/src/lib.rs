use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rtc_integration::{LocalMediaStream, MediaDevices, PeerConnectionFactory, PeerConnectionSession};
use shared::{
    domain::{ContactPresence, LocalUser, MessageId, MessageStatus, UserId},
    protocol::{EventKind, ServerEvent, UserSummary},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod call;
pub mod config;
pub mod error;
pub mod messages;
pub mod presence;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use api::{AttachmentDraft, AttachmentUpload, ChatApi, HttpChatApi};
pub use call::{CallController, CallSnapshot};
pub use config::{load_settings, BackoffPolicy, ClientSettings, ReconnectPolicy};
pub use error::ClientError;
pub use messages::{Attachment, Message, MessageReconciler};
pub use presence::PresenceTracker;
pub use transport::{ChannelManager, ConnectionStatus, EventSink, Subscription};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStatusChanged(ConnectionStatus),
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    ConversationLoaded {
        peer: UserId,
        messages: Vec<Message>,
    },
    MessageAppended(Message),
    MessageStatusChanged {
        id: MessageId,
        status: MessageStatus,
    },
    MessageConfirmed {
        temp_id: MessageId,
        id: MessageId,
    },
    MessageRemoved {
        id: MessageId,
    },
    CallStateChanged(CallSnapshot),
    IncomingCall {
        from: UserId,
        name: Option<String>,
    },
    RemoteAudioAttached {
        stream_id: String,
    },
    Error(String),
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalMediaStream>> {
        Err(anyhow!("no audio capture backend is available"))
    }
}

pub struct MissingPeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for MissingPeerConnectionFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnectionSession>> {
        Err(anyhow!("peer connection backend is unavailable"))
    }
}

#[derive(Default)]
struct ClientSession {
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

/// One signed-in user's connection to the chat backend: channel, presence,
/// conversations and the call session.
pub struct ChatClient {
    local_user: LocalUser,
    auth_token: Option<String>,
    api: Arc<dyn ChatApi>,
    channel: Arc<ChannelManager>,
    presence: Arc<PresenceTracker>,
    calls: Arc<CallController>,
    messages: Arc<MessageReconciler>,
    session: Mutex<ClientSession>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        settings: &ClientSettings,
        local_user: LocalUser,
        auth_token: Option<String>,
    ) -> Result<Arc<Self>, ClientError> {
        let api = Arc::new(HttpChatApi::new(
            settings.api_base_url(),
            auth_token.clone().unwrap_or_default(),
        ));
        Self::new_with_dependencies(
            settings,
            local_user,
            auth_token,
            api,
            Arc::new(MissingMediaDevices),
            Arc::new(MissingPeerConnectionFactory),
        )
    }

    pub fn new_with_dependencies(
        settings: &ClientSettings,
        local_user: LocalUser,
        auth_token: Option<String>,
        api: Arc<dyn ChatApi>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Arc<Self>, ClientError> {
        let (events, _) = broadcast::channel(settings.event_buffer);
        let channel = ChannelManager::new(settings.websocket_url()?, settings.reconnect.clone());
        let sink: Arc<dyn EventSink> = channel.clone();
        let presence = Arc::new(PresenceTracker::new(events.clone()));
        let calls = CallController::new(
            local_user.clone(),
            Arc::clone(&sink),
            media,
            peers,
            events.clone(),
        );
        let messages = Arc::new(MessageReconciler::new(
            local_user.clone(),
            Arc::clone(&api),
            sink,
            Arc::clone(&presence),
            events.clone(),
        ));
        Ok(Arc::new(Self {
            local_user,
            auth_token,
            api,
            channel,
            presence,
            calls,
            messages,
            session: Mutex::new(ClientSession::default()),
            events,
        }))
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    /// Connects the channel and starts routing its events. Calling it again
    /// while started only re-checks the connection.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut session = self.session.lock().await;
        if !session.subscriptions.is_empty() {
            return self.channel.connect(self.auth_token.as_deref());
        }

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<ServerEvent>();
        for kind in EventKind::ALL {
            let tx = dispatch_tx.clone();
            session.subscriptions.push(self.channel.on(kind, move |event| {
                let _ = tx.send(event.clone());
            }));
        }
        drop(dispatch_tx);

        let client = Arc::downgrade(self);
        session.tasks.push(tokio::spawn(async move {
            while let Some(event) = dispatch_rx.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.handle_server_event(event).await;
            }
        }));

        let mut status = self.channel.subscribe_status();
        let client = Arc::downgrade(self);
        session.tasks.push(tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.publish_status(current);
            }
        }));

        if let Err(err) = self.channel.connect(self.auth_token.as_deref()) {
            session.subscriptions.clear();
            for task in session.tasks.drain(..) {
                task.abort();
            }
            warn!("client: failed to start: {err}");
            return Err(err);
        }
        info!(user_id = %self.local_user.id, "client: started");
        Ok(())
    }

    /// Ends any call, stops routing events and closes the channel.
    pub async fn stop(&self) {
        self.calls.end_call().await;
        {
            let mut session = self.session.lock().await;
            session.subscriptions.clear();
            for task in session.tasks.drain(..) {
                task.abort();
            }
        }
        self.channel.disconnect();
        self.messages.close_conversation().await;
        self.publish_status(ConnectionStatus::Disconnected);
        info!(user_id = %self.local_user.id, "client: stopped");
    }

    fn publish_status(&self, status: ConnectionStatus) {
        debug!(?status, "client: connection status changed");
        let _ = self
            .events
            .send(ClientEvent::ConnectionStatusChanged(status));
        if let ConnectionStatus::Lost { attempts } = status {
            let _ = self.events.send(ClientEvent::Error(
                ClientError::ConnectionLost { attempts }.to_string(),
            ));
        }
    }

    /// Applies one inbound channel event to the owning component.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::IncomingCall { from, signal, name } => {
                log_outcome(self.calls.handle_incoming_call(from, signal, name).await);
            }
            ServerEvent::CallAnswered { signal } => {
                log_outcome(self.calls.handle_remote_answer(signal).await);
            }
            ServerEvent::CallRejected {} => self.calls.handle_remote_reject().await,
            ServerEvent::CallEnded {} => self.calls.handle_remote_end().await,
            ServerEvent::PrivateMessage(payload) => self.messages.handle_inbound(payload).await,
            ServerEvent::MessageDelivered { message_id } => {
                self.messages.handle_delivered(message_id).await;
            }
            ServerEvent::MessagesRead { from, to } => self.messages.handle_read(from, to).await,
            ServerEvent::MessageDeleted(id) => self.messages.handle_deleted(id).await,
            ServerEvent::UserOnline(user_id) => {
                if self.presence.set_online(&user_id, true).await {
                    self.messages.upgrade_reachable(&user_id).await;
                }
            }
            ServerEvent::UserOffline(user_id) => {
                self.presence.set_online(&user_id, false).await;
            }
        }
    }

    /// Fetches the contact list, minus the local user, and seeds presence.
    pub async fn load_contacts(&self) -> Result<Vec<UserSummary>, ClientError> {
        let users: Vec<UserSummary> = self
            .api
            .list_users()
            .await
            .map_err(|err| ClientError::Api(format!("{err:#}")))?
            .into_iter()
            .filter(|user| user.id != self.local_user.id)
            .collect();
        self.presence.seed(&users).await;
        Ok(users)
    }

    pub async fn contacts(&self) -> Vec<ContactPresence> {
        self.presence.contacts().await
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.presence.is_online(user_id).await
    }

    pub async fn open_conversation(&self, peer: UserId) -> Result<Vec<Message>, ClientError> {
        self.messages.open_conversation(peer).await
    }

    pub async fn close_conversation(&self) {
        self.messages.close_conversation().await;
    }

    pub async fn messages_with(&self, peer: &UserId) -> Vec<Message> {
        self.messages.messages_with(peer).await
    }

    pub async fn send_text(&self, content: &str) -> Result<Option<MessageId>, ClientError> {
        self.messages.send_text(content).await
    }

    pub async fn send_with_attachments(
        &self,
        content: Option<&str>,
        attachments: Vec<AttachmentUpload>,
    ) -> Result<Vec<Message>, ClientError> {
        self.messages
            .send_with_attachments(content, attachments)
            .await
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<(), ClientError> {
        self.messages.delete_message(id).await
    }

    /// Whether the call action should be offered for `peer`.
    pub async fn call_eligible(&self, peer: &UserId) -> bool {
        self.calls.is_idle().await && self.presence.is_online(peer).await
    }

    pub async fn call_snapshot(&self) -> Option<CallSnapshot> {
        self.calls.snapshot().await
    }

    pub async fn start_call(
        &self,
        peer: UserId,
        peer_display_name: Option<String>,
    ) -> Result<(), ClientError> {
        self.calls.start_call(peer, peer_display_name).await
    }

    pub async fn accept_call(&self) -> Result<(), ClientError> {
        self.calls.accept_call().await
    }

    pub async fn reject_call(&self) -> Result<(), ClientError> {
        self.calls.reject_call().await
    }

    pub async fn cancel_call(&self) -> Result<(), ClientError> {
        self.calls.cancel_call().await
    }

    pub async fn end_call(&self) {
        self.calls.end_call().await;
    }
}

fn log_outcome(result: Result<(), ClientError>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_stale() => {}
        Err(err) => warn!("client: failed to apply channel event: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
