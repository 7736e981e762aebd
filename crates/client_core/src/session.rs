use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use shared::{
    domain::{Peer, UserId},
    protocol::{PushKeys, PushSubscription, ServerEvent},
};
use storage::LocalStore;
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    api::{ChatApi, HttpChatApi},
    conversation::{ConversationController, RenderedMessage},
    directory::DirectoryController,
    identity::{resolve_identity, Identity},
    moderation::ModerationController,
    transport::{ConnectionState, RelayEvent, RelayOptions, RelayTransport, WsRelay},
};

pub const DEFAULT_SEARCH_MIN_QUERY_LEN: usize = 3;
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub search_min_query_len: usize,
    pub typing_idle: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            search_min_query_len: DEFAULT_SEARCH_MIN_QUERY_LEN,
            typing_idle: DEFAULT_TYPING_IDLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Blocked,
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConversationOpened { peer: Peer },
    ConversationClosed { peer_id: UserId, reason: CloseReason },
    HistoryLoaded { peer_id: UserId, count: usize },
    HistoryFailed { peer_id: UserId, reason: String },
    MessageAppended(RenderedMessage),
    MessagesMarkedRead { peer_id: UserId, count: usize },
    TypingStarted { peer_id: UserId },
    TypingStopped { peer_id: UserId },
    DirectoryUpdated(Vec<Peer>),
    PeerOffline { peer_id: UserId },
    PeerBlocked { peer_id: UserId },
    ConnectionChanged(ConnectionState),
    Error(String),
}

pub struct SessionContext {
    identity: Identity,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn RelayTransport>,
    store: LocalStore,
    options: SessionOptions,
    events: broadcast::Sender<ClientEvent>,
    blocked: RwLock<HashSet<UserId>>,
}

impl SessionContext {
    pub fn new(
        identity: Identity,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RelayTransport>,
        store: LocalStore,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            identity,
            api,
            transport,
            store,
            options,
            events,
            blocked: RwLock::new(HashSet::new()),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn self_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn api(&self) -> &dyn ChatApi {
        self.api.as_ref()
    }

    pub fn transport(&self) -> &dyn RelayTransport {
        self.transport.as_ref()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn is_blocked(&self, user_id: &UserId) -> bool {
        self.blocked.read().await.contains(user_id)
    }

    pub async fn blocked_peers(&self) -> HashSet<UserId> {
        self.blocked.read().await.clone()
    }

    pub(crate) async fn mark_blocked(&self, user_id: UserId) {
        self.blocked.write().await.insert(user_id);
    }
}

pub struct ChatSession {
    ctx: Arc<SessionContext>,
    conversation: Arc<ConversationController>,
    directory: Arc<DirectoryController>,
    moderation: ModerationController,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn start(ctx: Arc<SessionContext>) -> Self {
        let conversation = ConversationController::new(Arc::clone(&ctx));
        let directory = DirectoryController::new(Arc::clone(&ctx));
        let moderation = ModerationController::new(
            Arc::clone(&ctx),
            Arc::clone(&conversation),
            Arc::clone(&directory),
        );

        let relay_events = ctx.transport().subscribe();
        let pump = tokio::spawn(route_relay_events(
            Arc::clone(&ctx),
            Arc::clone(&conversation),
            Arc::clone(&directory),
            relay_events,
        ));

        info!(user_id = %ctx.self_id(), "chat session started");
        Self {
            ctx,
            conversation,
            directory,
            moderation,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub async fn connect(
        server_url: &str,
        relay: RelayOptions,
        token: &str,
        store: LocalStore,
        options: SessionOptions,
    ) -> Result<Self> {
        let identity = resolve_identity(Some(token), Utc::now())?;
        let api = HttpChatApi::new(server_url, token)?;
        let transport = WsRelay::connect(relay, token)
            .await
            .context("relay connection failed")?;
        let ctx = SessionContext::new(
            identity,
            Arc::new(api),
            Arc::new(transport),
            store,
            options,
        );
        Ok(Self::start(ctx))
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn conversation(&self) -> &Arc<ConversationController> {
        &self.conversation
    }

    pub fn directory(&self) -> &Arc<DirectoryController> {
        &self.directory
    }

    pub fn moderation(&self) -> &ModerationController {
        &self.moderation
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.subscribe()
    }

    pub async fn register_push(&self, endpoint: &str, keys: PushKeys) -> Result<()> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            bail!("push endpoint must not be empty");
        }
        let subscription = PushSubscription {
            endpoint: endpoint.to_string(),
            expiration_time: None,
            keys,
            user_id: self.ctx.self_id().clone(),
        };
        self.ctx
            .api()
            .subscribe_push(&subscription)
            .await
            .context("push subscription was not registered")?;
        info!(user_id = %self.ctx.self_id(), "push subscription registered");
        Ok(())
    }

    /// Stops event routing, closes the relay and discards the active
    /// conversation. The stored token is left alone.
    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.ctx.transport().shutdown().await;
        self.conversation.reset(CloseReason::LoggedOut).await;
        debug!(user_id = %self.ctx.self_id(), "chat session closed");
    }

    pub async fn logout(&self) -> Result<()> {
        self.close().await;
        self.ctx.store().clear_bearer_token().await?;
        info!(user_id = %self.ctx.self_id(), "logged out");
        Ok(())
    }
}

async fn route_relay_events(
    ctx: Arc<SessionContext>,
    conversation: Arc<ConversationController>,
    directory: Arc<DirectoryController>,
    mut relay_events: broadcast::Receiver<RelayEvent>,
) {
    // Dropped with the pump, which aborts any resync still in flight.
    let mut resyncs = JoinSet::new();
    loop {
        match relay_events.recv().await {
            Ok(RelayEvent::Server(ServerEvent::ReceiveMessage(message))) => {
                conversation.handle_message(message).await;
            }
            Ok(RelayEvent::Server(ServerEvent::Typing { sender_id, .. })) => {
                conversation.handle_typing(&sender_id).await;
            }
            Ok(RelayEvent::Server(ServerEvent::UserOffline(user_id))) => {
                directory.mark_offline(&user_id).await;
            }
            Ok(RelayEvent::ConnectionChanged(state)) => {
                ctx.emit(ClientEvent::ConnectionChanged(state));
                match state {
                    ConnectionState::Connected => {
                        // History reloads off the pump; live events keep flowing meanwhile.
                        resyncs.shutdown().await;
                        let ctx = Arc::clone(&ctx);
                        let conversation = Arc::clone(&conversation);
                        resyncs.spawn(async move {
                            if let Err(err) = conversation.resync().await {
                                warn!(%err, "conversation resync after reconnect failed");
                                ctx.emit(ClientEvent::Error(err.to_string()));
                            }
                        });
                    }
                    ConnectionState::Closed => break,
                    _ => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "relay event consumer lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
