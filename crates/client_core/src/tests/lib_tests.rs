use super::*;
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use shared::{
    domain::CallPhase,
    protocol::{ClientRequest, MessagePayload, SessionDescription},
};
use tokio::net::TcpListener;

use crate::test_support::{message_payload, MockFactory, MockMedia};

const CLOSE_FRAME: &str = "__close__";

#[derive(Clone)]
struct WsState {
    connections: Arc<AtomicUsize>,
    push: broadcast::Sender<String>,
    inbound: mpsc::UnboundedSender<String>,
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let outbound = state.push.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, outbound, state.inbound))
}

async fn serve_socket(
    mut socket: WebSocket,
    mut outbound: broadcast::Receiver<String>,
    inbound: mpsc::UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Ok(text) if text == CLOSE_FRAME => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return;
                }
                Ok(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = inbound.send(text);
                }
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    push: broadcast::Sender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl TestServer {
    fn push(&self, event: ServerEvent) {
        let frame = serde_json::to_string(&event).expect("encode event");
        self.push.send(frame).expect("connected socket");
    }

    fn drop_connection(&self) {
        self.push
            .send(CLOSE_FRAME.to_string())
            .expect("connected socket");
    }

    async fn next_request(&mut self) -> ClientRequest {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("request timeout")
            .expect("inbound frame");
        serde_json::from_str(&frame).expect("decode request")
    }
}

async fn spawn_ws_server() -> TestServer {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (push, _) = broadcast::channel(64);
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let state = WsState {
        connections: Arc::new(AtomicUsize::new(0)),
        push: push.clone(),
        inbound: inbound_tx,
    };
    let server = TestServer {
        addr,
        connections: Arc::clone(&state.connections),
        push,
        inbound,
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    server
}

struct ContactsApi;

#[async_trait]
impl ChatApi for ContactsApi {
    async fn fetch_profile(&self) -> anyhow::Result<LocalUser> {
        Ok(alice())
    }

    async fn list_users(&self) -> anyhow::Result<Vec<UserSummary>> {
        Ok(vec![
            summary("alice", true),
            summary("bob", false),
            summary("carol", true),
        ])
    }

    async fn fetch_history(
        &self,
        _me: &UserId,
        _peer: &UserId,
    ) -> anyhow::Result<Vec<MessagePayload>> {
        Ok(Vec::new())
    }

    async fn send_attachments(
        &self,
        _draft: AttachmentDraft,
    ) -> anyhow::Result<Vec<MessagePayload>> {
        Ok(Vec::new())
    }

    async fn delete_message(&self, _message_id: &MessageId) -> anyhow::Result<()> {
        Ok(())
    }
}

fn alice() -> LocalUser {
    LocalUser {
        id: UserId::from("alice"),
        name: "Alice".to_string(),
    }
}

fn summary(id: &str, online: bool) -> UserSummary {
    UserSummary {
        id: UserId::from(id),
        name: Some(id.to_string()),
        online,
    }
}

fn settings_for(server_url: String) -> ClientSettings {
    ClientSettings {
        server_url,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff: BackoffPolicy::Fixed,
        },
        ..ClientSettings::default()
    }
}

fn client_for(settings: &ClientSettings, token: Option<&str>) -> Arc<ChatClient> {
    ChatClient::new_with_dependencies(
        settings,
        alice(),
        token.map(str::to_string),
        Arc::new(ContactsApi),
        Arc::new(MockMedia::default()),
        Arc::new(MockFactory::default()),
    )
    .expect("client")
}

async fn connected_client(server: &TestServer) -> Arc<ChatClient> {
    let client = client_for(&settings_for(format!("http://{}", server.addr)), Some("token-a"));
    client.load_contacts().await.expect("contacts");
    client.start().await.expect("start");
    wait_for_connected(&client).await;
    client
}

async fn wait_for_connected(client: &ChatClient) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.connection_status() != ConnectionStatus::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connect timeout");
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("client event");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event timeout")
}

#[tokio::test]
async fn start_without_a_token_fails() {
    let client = client_for(&settings_for("http://127.0.0.1:9".to_string()), None);

    assert!(matches!(client.start().await, Err(ClientError::AuthRequired)));
    assert!(matches!(client.start().await, Err(ClientError::AuthRequired)));
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn invalid_server_url_is_rejected() {
    let result = ChatClient::new_with_dependencies(
        &settings_for("ftp://example.com".to_string()),
        alice(),
        Some("token".to_string()),
        Arc::new(ContactsApi),
        Arc::new(MissingMediaDevices),
        Arc::new(MissingPeerConnectionFactory),
    );
    assert!(matches!(result, Err(ClientError::InvalidServerUrl(_))));
}

#[tokio::test]
async fn load_contacts_skips_self_and_seeds_presence() {
    let client = client_for(&settings_for("http://127.0.0.1:9".to_string()), Some("t"));

    let contacts = client.load_contacts().await.expect("contacts");

    assert_eq!(
        contacts.iter().map(|user| user.id.as_str()).collect::<Vec<_>>(),
        vec!["bob", "carol"]
    );
    assert!(!client.is_online(&UserId::from("bob")).await);
    assert!(client.is_online(&UserId::from("carol")).await);
    assert!(client.call_eligible(&UserId::from("carol")).await);
    assert!(!client.call_eligible(&UserId::from("bob")).await);
    assert!(!client.call_eligible(&UserId::from("alice")).await);
}

#[tokio::test]
async fn channel_events_drive_message_status() {
    let mut server = spawn_ws_server().await;
    let client = connected_client(&server).await;
    let mut events = client.subscribe_events();
    let bob = UserId::from("bob");

    client.open_conversation(bob.clone()).await.expect("open");
    assert_eq!(
        server.next_request().await,
        ClientRequest::MarkAsRead { from: bob.clone() }
    );

    let temp_id = client.send_text("hi bob").await.expect("send").expect("temp id");
    assert_eq!(
        server.next_request().await,
        ClientRequest::PrivateMessage {
            from: UserId::from("alice"),
            to: bob.clone(),
            content: "hi bob".to_string(),
        }
    );
    assert_eq!(
        client.messages_with(&bob).await[0].status,
        MessageStatus::Sent
    );

    server.push(ServerEvent::UserOnline(bob.clone()));
    wait_for_event(&mut events, |event| {
        matches!(
            event,
            ClientEvent::MessageStatusChanged { id, status: MessageStatus::Delivered }
                if id == &temp_id
        )
    })
    .await;
    assert!(client.is_online(&bob).await);

    server.push(ServerEvent::MessagesRead {
        from: UserId::from("alice"),
        to: bob.clone(),
    });
    wait_for_event(&mut events, |event| {
        matches!(
            event,
            ClientEvent::MessageStatusChanged { id, status: MessageStatus::Read }
                if id == &temp_id
        )
    })
    .await;

    server.push(ServerEvent::PrivateMessage(message_payload(
        "m-2", "bob", "alice", "hello back",
    )));
    wait_for_event(&mut events, |event| {
        matches!(
            event,
            ClientEvent::MessageAppended(message) if message.id == MessageId::from("m-2")
        )
    })
    .await;
    assert_eq!(
        server.next_request().await,
        ClientRequest::MarkAsRead { from: bob }
    );

    client.stop().await;
}

#[tokio::test]
async fn incoming_call_is_answered_and_ended_remotely() {
    let mut server = spawn_ws_server().await;
    let client = connected_client(&server).await;
    let mut events = client.subscribe_events();

    server.push(ServerEvent::IncomingCall {
        from: UserId::from("carol"),
        signal: SessionDescription::offer("carol-offer"),
        name: Some("Carol".to_string()),
    });
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::IncomingCall { from, .. } if from == &UserId::from("carol"))
    })
    .await;
    assert!(!client.call_eligible(&UserId::from("carol")).await);

    client.accept_call().await.expect("accept");
    assert_eq!(
        server.next_request().await,
        ClientRequest::AnswerCall {
            to: UserId::from("carol"),
            from: UserId::from("alice"),
            signal: SessionDescription::answer("answer-sdp"),
        }
    );
    assert_eq!(
        client.call_snapshot().await.expect("session").phase,
        CallPhase::Active
    );

    server.push(ServerEvent::CallEnded {});
    wait_for_event(&mut events, |event| {
        matches!(
            event,
            ClientEvent::CallStateChanged(snapshot) if snapshot.phase == CallPhase::Idle
        )
    })
    .await;
    assert!(client.call_snapshot().await.is_none());

    client.stop().await;
}

#[tokio::test]
async fn ringing_call_survives_a_reconnect() {
    let mut server = spawn_ws_server().await;
    let client = connected_client(&server).await;
    let mut events = client.subscribe_events();

    client
        .start_call(UserId::from("carol"), Some("Carol".to_string()))
        .await
        .expect("start call");
    assert_eq!(server.next_request().await.name(), "call_user");

    server.drop_connection();
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.connections.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconnect timeout");
    wait_for_connected(&client).await;
    assert_eq!(
        client.call_snapshot().await.expect("session").phase,
        CallPhase::RingingOut
    );

    server.push(ServerEvent::CallAnswered {
        signal: SessionDescription::answer("carol-answer"),
    });
    wait_for_event(&mut events, |event| {
        matches!(
            event,
            ClientEvent::CallStateChanged(snapshot) if snapshot.phase == CallPhase::Active
        )
    })
    .await;

    client.stop().await;
    assert_eq!(server.next_request().await.name(), "end_call");
}

#[tokio::test]
async fn spent_reconnect_budget_is_reported_as_lost() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr")
    };
    let mut settings = settings_for(format!("http://{addr}"));
    settings.reconnect.max_attempts = 1;
    let client = client_for(&settings, Some("token-a"));
    let mut events = client.subscribe_events();

    client.start().await.expect("start");

    wait_for_event(&mut events, |event| {
        matches!(
            event,
            ClientEvent::ConnectionStatusChanged(ConnectionStatus::Lost { attempts: 1 })
        )
    })
    .await;
    let error = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Error(_))).await;
    assert!(matches!(error, ClientEvent::Error(message) if message.contains("1")));
    assert_eq!(
        client.connection_status(),
        ConnectionStatus::Lost { attempts: 1 }
    );
}

#[tokio::test]
async fn stop_ends_the_call_and_disconnects() {
    let mut server = spawn_ws_server().await;
    let client = connected_client(&server).await;

    client
        .start_call(UserId::from("carol"), None)
        .await
        .expect("start call");
    assert_eq!(server.next_request().await.name(), "call_user");

    client.stop().await;

    assert_eq!(
        server.next_request().await,
        ClientRequest::EndCall {
            to: UserId::from("carol"),
        }
    );
    assert!(client.call_snapshot().await.is_none());
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    assert!(client.send_text("after stop").await.is_err());
}
