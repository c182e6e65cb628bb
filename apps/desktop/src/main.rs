use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ChatApi, ChatClient, ClientEvent, HttpChatApi};
use shared::domain::{MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides server_url from client.toml / CHAT_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    /// Conversation to open on startup.
    #[arg(long)]
    peer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let profile = HttpChatApi::new(settings.api_base_url(), args.token.clone())
        .fetch_profile()
        .await?;
    println!("Signed in as {} ({})", profile.name, profile.id);

    let client = ChatClient::new(&settings, profile, Some(args.token))?;
    spawn_event_printer(&client);
    client.start().await?;

    for contact in client.load_contacts().await? {
        let state = if contact.online { "online" } else { "offline" };
        println!(
            "  {} {} [{state}]",
            contact.id,
            contact.name.as_deref().unwrap_or("")
        );
    }

    if let Some(peer) = args.peer {
        client.open_conversation(UserId::from(peer.as_str())).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&client, line).await {
            warn!("desktop: {err}");
            println!("! {err}");
        }
    }

    client.stop().await;
    Ok(())
}

async fn run_command(client: &ChatClient, line: &str) -> Result<()> {
    let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
    let argument = argument.trim();
    match command {
        "/open" => {
            let messages = client
                .open_conversation(UserId::from(argument))
                .await?;
            for message in messages {
                println!(
                    "  [{:?}] {}: {}",
                    message.status,
                    message.from,
                    message.content.as_deref().unwrap_or("<attachment>")
                );
            }
        }
        "/call" => {
            let peer = UserId::from(argument);
            if !client.call_eligible(&peer).await {
                println!("! {peer} cannot be called right now");
                return Ok(());
            }
            client.start_call(peer, None).await?;
        }
        "/accept" => client.accept_call().await?,
        "/reject" => client.reject_call().await?,
        "/cancel" => client.cancel_call().await?,
        "/end" => client.end_call().await,
        "/delete" => client.delete_message(&MessageId::from(argument)).await?,
        _ if command.starts_with('/') => println!("! unknown command {command}"),
        _ => {
            if client.send_text(line).await?.is_none() {
                println!("! not connected; message was not sent");
            }
        }
    }
    Ok(())
}

fn spawn_event_printer(client: &Arc<ChatClient>) {
    let mut events = BroadcastStream::new(client.subscribe_events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                continue;
            };
            match event {
                ClientEvent::ConnectionStatusChanged(status) => {
                    println!("* connection: {status:?}");
                }
                ClientEvent::PresenceChanged { user_id, online } => {
                    println!("* {user_id} is {}", if online { "online" } else { "offline" });
                }
                ClientEvent::MessageAppended(message) => println!(
                    "{} -> {}: {}",
                    message.from,
                    message.to,
                    message.content.as_deref().unwrap_or("<attachment>")
                ),
                ClientEvent::MessageStatusChanged { id, status } => {
                    println!("* message {id} is {status:?}");
                }
                ClientEvent::MessageConfirmed { temp_id, id } => {
                    println!("* message {temp_id} stored as {id}");
                }
                ClientEvent::MessageRemoved { id } => println!("* message {id} deleted"),
                ClientEvent::ConversationLoaded { peer, messages } => {
                    println!("* conversation with {peer}: {} messages", messages.len());
                }
                ClientEvent::CallStateChanged(snapshot) => {
                    println!("* call with {}: {:?}", snapshot.peer_id, snapshot.phase);
                }
                ClientEvent::IncomingCall { from, name } => println!(
                    "* incoming call from {} (/accept or /reject)",
                    name.unwrap_or_else(|| from.to_string())
                ),
                ClientEvent::RemoteAudioAttached { stream_id } => {
                    println!("* remote audio attached: {stream_id}");
                }
                ClientEvent::Error(message) => println!("! {message}"),
            }
        }
    });
}
