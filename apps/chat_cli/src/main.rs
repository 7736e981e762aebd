use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    profile::{avatar_path, current_avatar, cycle_avatar},
    AuthGate, AuthState, ChatSession, ClientEvent, ConnectionState, HttpAuthApi, RenderedMessage,
    SendOutcome, ViewEntry,
};
use shared::{domain::Peer, protocol::PushKeys};
use storage::LocalStore;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{BroadcastStream, LinesStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_database_url, Settings, DEFAULT_CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(name = "chat", about = "Terminal client for 1:1 chat")]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    relay_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        #[arg(long, env = "CHAT_PASSWORD")]
        password: String,
    },
    Signup {
        username: String,
        #[arg(long, env = "CHAT_PASSWORD")]
        password: String,
    },
    Logout,
    Whoami,
    /// List recently-contacted peers, plus matches when the query is long enough.
    Users { query: Option<String> },
    /// Open a conversation; lines typed are sent, `/block` and `/quit` are commands.
    Chat { username: String },
    Block { username: String },
    /// Register a web-push subscription for the logged-in user.
    Push {
        endpoint: String,
        #[arg(long)]
        p256dh: String,
        #[arg(long)]
        auth: String,
    },
    /// Show the avatar icon, or advance to the next one with `--next`.
    Avatar {
        #[arg(long)]
        next: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = load_settings(&args.config);
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }
    if let Some(url) = args.relay_url {
        settings.relay_url = Some(url);
    }
    if let Some(url) = args.database_url {
        settings.database_url = url;
    }

    let database_url = normalize_database_url(&settings.database_url);
    let store = LocalStore::new(&database_url).await?;
    let gate = AuthGate::new(
        store.clone(),
        Arc::new(HttpAuthApi::new(&settings.server_url)?),
        settings.auth_options(),
    );

    match args.command {
        Command::Login { username, password } => {
            let identity = gate.login(&username, &password).await?;
            println!("logged in as {} ({})", identity.username, identity.user_id);
        }
        Command::Signup { username, password } => {
            let identity = gate.signup(&username, &password).await?;
            println!("account created for {} ({})", identity.username, identity.user_id);
        }
        Command::Logout => {
            gate.logout().await?;
            println!("logged out");
        }
        Command::Whoami => match gate.check_authentication().await? {
            AuthState::Authenticated(identity) => {
                let avatar = avatar_path(current_avatar(&store).await?);
                println!("{} ({}) {avatar}", identity.username, identity.user_id);
            }
            AuthState::LoggedOut(reason) => println!("not logged in: {reason:?}"),
        },
        Command::Users { query } => {
            let session = open_session(&settings, &gate, store).await?;
            let peers = session
                .directory()
                .search(query.as_deref().unwrap_or_default())
                .await;
            session.close().await;
            for peer in peers? {
                print_peer(&peer);
            }
        }
        Command::Chat { username } => {
            let session = open_session(&settings, &gate, store).await?;
            let result = chat(&session, &username).await;
            session.close().await;
            result?;
        }
        Command::Block { username } => {
            let session = open_session(&settings, &gate, store).await?;
            let result = match find_peer(&session, &username).await {
                Ok(peer) => session.moderation().block(&peer.user_id).await,
                Err(err) => Err(err),
            };
            session.close().await;
            result?;
            println!("blocked {username}");
        }
        Command::Push {
            endpoint,
            p256dh,
            auth,
        } => {
            let session = open_session(&settings, &gate, store).await?;
            let result = session
                .register_push(&endpoint, PushKeys { p256dh, auth })
                .await;
            session.close().await;
            result?;
            println!("push notifications registered");
        }
        Command::Avatar { next } => {
            let index = if next {
                cycle_avatar(&store).await?
            } else {
                current_avatar(&store).await?
            };
            println!("{}", avatar_path(index));
        }
    }

    Ok(())
}

async fn open_session(settings: &Settings, gate: &AuthGate, store: LocalStore) -> Result<ChatSession> {
    if let AuthState::LoggedOut(reason) = gate.check_authentication().await? {
        bail!("not logged in ({reason:?}); run `chat login <username>` first");
    }
    let token = store
        .bearer_token()
        .await?
        .ok_or_else(|| anyhow!("bearer token disappeared after authentication"))?;
    ChatSession::connect(
        &settings.server_url,
        settings.relay_options()?,
        &token,
        store,
        settings.session_options(),
    )
    .await
}

async fn find_peer(session: &ChatSession, username: &str) -> Result<Peer> {
    session.directory().search(username).await?;
    session
        .directory()
        .find_by_username(username)
        .await
        .ok_or_else(|| anyhow!("no user named '{username}'"))
}

fn print_peer(peer: &Peer) {
    let status = if peer.online { "online" } else { "offline" };
    println!("{:<24} {:<8} {}", peer.username, status, peer.user_id);
}

async fn chat(session: &ChatSession, username: &str) -> Result<()> {
    let peer = find_peer(session, username).await?;
    let conversation = session.conversation();
    let events = BroadcastStream::new(session.subscribe_events());
    conversation.select_peer(peer.clone()).await?;

    // Messages in the snapshot may also be queued as appended events.
    let mut shown = Vec::new();
    for entry in conversation.snapshot().await.entries {
        match entry {
            ViewEntry::Message(rendered) => {
                print_message(&rendered, &peer.username);
                shown.push(rendered);
            }
            ViewEntry::Notice(notice) => println!("-- {notice}"),
        }
    }

    let printer = tokio::spawn(print_events(events, shown, peer.username.clone()));
    let mut lines = LinesStream::new(BufReader::new(io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        match line.trim() {
            "/quit" => break,
            "/block" => {
                session.moderation().block(&peer.user_id).await?;
                println!("-- blocked {}", peer.username);
                break;
            }
            "" => {}
            text => {
                conversation.notify_typing().await;
                if let SendOutcome::Emitted { local_id, delivery } =
                    conversation.send_message(text).await?
                {
                    if delivery.is_failed() {
                        warn!(%local_id, ?delivery, "message not delivered");
                    }
                }
            }
        }
    }
    printer.abort();
    info!(peer = %peer.username, "conversation ended");
    Ok(())
}

fn print_message(rendered: &RenderedMessage, peer_name: &str) {
    let who = if rendered.is_self { "you" } else { peer_name };
    println!("[{who}] {}", rendered.message.body);
}

// The read flag may have flipped between the event and the snapshot.
fn same_message(a: &RenderedMessage, b: &RenderedMessage) -> bool {
    a.message.message_id == b.message.message_id
        && a.message.sender_id == b.message.sender_id
        && a.message.body == b.message.body
        && a.message.timestamp == b.message.timestamp
}

async fn print_events(
    mut events: BroadcastStream<ClientEvent>,
    mut shown: Vec<RenderedMessage>,
    peer_name: String,
) {
    while let Some(event) = events.next().await {
        let Ok(event) = event else {
            continue;
        };
        match event {
            ClientEvent::MessageAppended(rendered) => {
                if let Some(pos) = shown.iter().position(|seen| same_message(seen, &rendered)) {
                    shown.swap_remove(pos);
                    continue;
                }
                print_message(&rendered, &peer_name);
            }
            ClientEvent::TypingStarted { .. } => println!("-- {peer_name} is typing..."),
            ClientEvent::TypingStopped { .. } => println!("-- {peer_name} stopped typing"),
            ClientEvent::PeerOffline { .. } => println!("-- {peer_name} went offline"),
            ClientEvent::HistoryFailed { reason, .. } => println!("-- history unavailable: {reason}"),
            ClientEvent::ConnectionChanged(ConnectionState::Reconnecting { attempt }) => {
                println!("-- connection lost, reconnecting (attempt {attempt})");
            }
            ClientEvent::ConnectionChanged(ConnectionState::Closed) => {
                println!("-- connection closed");
            }
            ClientEvent::Error(message) => println!("-- error: {message}"),
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
