use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, EventKind, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{config::ReconnectPolicy, error::ClientError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Lost { attempts: u32 },
}

/// Outbound side of the channel as the components see it. Returns whether
/// the event was handed to a live channel.
pub trait EventSink: Send + Sync {
    fn emit(&self, request: ClientRequest) -> bool;
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
}

impl ListenerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(u64, Handler)>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, kind: EventKind, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entry(kind).or_default().push((id, handler));
        id
    }

    fn remove(&self, kind: EventKind, id: u64) {
        let mut listeners = self.lock();
        if let Some(handlers) = listeners.get_mut(&kind) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.is_empty() {
                listeners.remove(&kind);
            }
        }
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Runs every handler for the event's kind, outside the registry lock so
    /// handlers may subscribe or unsubscribe.
    pub(crate) fn dispatch(&self, event: &ServerEvent) -> usize {
        let handlers: Vec<Handler> = self
            .lock()
            .get(&event.kind())
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

/// Listener registration handle. Dropping it unregisters the listener.
#[must_use = "dropping a subscription unregisters its listener"]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, self.id);
        }
    }
}

enum Command {
    Send(String),
    Close,
}

enum PumpExit {
    Shutdown,
    Dropped,
}

pub(crate) struct ChannelShared {
    generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    pub(crate) listeners: Arc<ListenerRegistry>,
}

impl ChannelShared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish_status(&self, generation: u64, status: ConnectionStatus) {
        if self.is_current(generation) {
            self.status.send_replace(status);
        }
    }

    fn deliver(&self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            return;
        }
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                let handled = self.listeners.dispatch(&event);
                debug!(event = event.kind().name(), handled, "transport: event received");
            }
            Err(err) => warn!("transport: invalid server event: {err}"),
        }
    }
}

struct ChannelInner {
    token: Option<String>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

/// Owns the single authenticated event channel to the server.
pub struct ChannelManager {
    websocket_url: Url,
    policy: ReconnectPolicy,
    pub(crate) shared: Arc<ChannelShared>,
    inner: Mutex<ChannelInner>,
}

impl ChannelManager {
    pub fn new(websocket_url: Url, policy: ReconnectPolicy) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            websocket_url,
            policy,
            shared: Arc::new(ChannelShared {
                generation: AtomicU64::new(0),
                status,
                listeners: Arc::new(ListenerRegistry::default()),
            }),
            inner: Mutex::new(ChannelInner {
                token: None,
                commands: None,
            }),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the channel task. Must be called from within a tokio runtime.
    pub fn connect(&self, auth_token: Option<&str>) -> Result<(), ClientError> {
        let token = auth_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ClientError::AuthRequired)?;
        let auth_header = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ClientError::Transport(format!("invalid auth token: {err}")))?;

        let mut inner = self.lock_inner();
        let live = inner
            .commands
            .as_ref()
            .is_some_and(|commands| !commands.is_closed());
        if live && inner.token.as_deref() == Some(token) {
            debug!("transport: channel already live for this token");
            return Ok(());
        }
        if let Some(previous) = inner.commands.take() {
            let _ = previous.send(Command::Close);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands, command_rx) = mpsc::unbounded_channel();
        inner.token = Some(token.to_string());
        inner.commands = Some(commands);
        self.shared.status.send_replace(ConnectionStatus::Connecting);

        info!(url = %self.websocket_url, generation, "transport: connecting channel");
        tokio::spawn(run_channel(
            Arc::clone(&self.shared),
            self.websocket_url.clone(),
            auth_header,
            self.policy.clone(),
            generation,
            command_rx,
        ));
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut inner = self.lock_inner();
        inner.token = None;
        let Some(commands) = inner.commands.take() else {
            return;
        };
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let _ = commands.send(Command::Close);
        self.shared
            .status
            .send_replace(ConnectionStatus::Disconnected);
        info!("transport: channel disconnected");
    }

    /// Sends an event if the channel is connected; otherwise drops it.
    pub fn send(&self, request: &ClientRequest) -> bool {
        if !self.is_connected() {
            debug!(
                event = request.name(),
                "transport: channel not connected; dropping outbound event"
            );
            return false;
        }
        let payload = match serde_json::to_string(request) {
            Ok(payload) => payload,
            Err(err) => {
                error!(event = request.name(), "transport: failed to encode event: {err}");
                return false;
            }
        };
        let inner = self.lock_inner();
        inner
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(Command::Send(payload)).is_ok())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.shared.listeners.insert(kind, Arc::new(handler));
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.shared.listeners),
        }
    }

    pub fn off(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }
}

impl EventSink for ChannelManager {
    fn emit(&self, request: ClientRequest) -> bool {
        self.send(&request)
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_channel(
    shared: Arc<ChannelShared>,
    url: Url,
    auth_header: HeaderValue,
    policy: ReconnectPolicy,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut failures: u32 = 0;
    loop {
        match open_socket(&url, &auth_header).await {
            Ok(socket) => {
                failures = 0;
                shared.publish_status(generation, ConnectionStatus::Connected);
                info!(url = %url, "transport: channel connected");
                match pump(&shared, generation, socket, &mut commands).await {
                    PumpExit::Shutdown => {
                        info!("transport: channel closed by client");
                        return;
                    }
                    PumpExit::Dropped => warn!("transport: channel dropped"),
                }
            }
            Err(err) => warn!(attempt = failures, "transport: connect failed: {err:#}"),
        }

        failures += 1;
        if failures > policy.max_attempts {
            error!(
                attempts = policy.max_attempts,
                "transport: reconnect budget exhausted; giving up"
            );
            shared.publish_status(
                generation,
                ConnectionStatus::Lost {
                    attempts: policy.max_attempts,
                },
            );
            return;
        }

        shared.publish_status(generation, ConnectionStatus::Reconnecting { attempt: failures });
        let delay = policy.delay_for(failures);
        debug!(attempt = failures, ?delay, "transport: scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_close(&mut commands) => {
                info!("transport: reconnect cancelled by client");
                return;
            }
        }
    }
}

async fn open_socket(url: &Url, auth_header: &HeaderValue) -> anyhow::Result<Socket> {
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(AUTHORIZATION, auth_header.clone());
    let (socket, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    Ok(socket)
}

async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Close => return,
            Command::Send(_) => debug!("transport: dropping outbound event while reconnecting"),
        }
    }
}

async fn pump(
    shared: &ChannelShared,
    generation: u64,
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> PumpExit {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(payload)) => {
                    if let Err(err) = writer.send(Message::Text(payload)).await {
                        warn!("transport: send failed: {err}");
                        return PumpExit::Dropped;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.deliver(generation, &text),
                Some(Ok(Message::Close(_))) | None => return PumpExit::Dropped,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("transport: receive failed: {err}");
                    return PumpExit::Dropped;
                }
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
