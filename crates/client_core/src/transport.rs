use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, OutboundMessage, ServerEvent},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;
const EVENT_BUFFER: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("relay outbound queue is full")]
    QueueFull,
    #[error("relay connection is closed")]
    Closed,
}

/// Result of handing a frame to the relay. `Sent` means it went to a live
/// connection; nothing is acknowledged end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    Failed(DeliveryError),
}

impl Delivery {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Server(ServerEvent),
    ConnectionChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub outbound_queue: usize,
}

impl RelayOptions {
    pub fn new(relay_url: &str) -> Result<Self> {
        let url = Url::parse(relay_url.trim())
            .with_context(|| format!("invalid relay url '{relay_url}'"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!("relay_url must start with ws:// or wss://"));
        }
        Ok(Self {
            url,
            reconnect: ReconnectPolicy::default(),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        })
    }

    pub fn from_server_url(server_url: &str) -> Result<Self> {
        let server_url = server_url.trim().trim_end_matches('/');
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Self::new(&format!("{ws_url}/ws"))
    }

    fn authenticated_url(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn emit(&self, request: ClientRequest) -> Delivery;
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;
    fn state(&self) -> ConnectionState;
    async fn shutdown(&self);

    /// Advisory and idempotent: associates this connection with the pair's room.
    async fn join(&self, self_id: &UserId, peer_id: &UserId) -> Delivery {
        self.emit(ClientRequest::Join {
            sender_user_id: self_id.clone(),
            recipient_user_id: peer_id.clone(),
        })
        .await
    }

    async fn send(&self, message: OutboundMessage) -> Delivery {
        self.emit(ClientRequest::SendMessage(message)).await
    }

    async fn emit_typing(&self, self_id: &UserId, peer_id: &UserId) -> Delivery {
        self.emit(ClientRequest::Typing {
            sender_id: self_id.clone(),
            receiver_id: peer_id.clone(),
        })
        .await
    }
}

pub struct WsRelay {
    outbound: mpsc::Sender<ClientRequest>,
    events: broadcast::Sender<RelayEvent>,
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    last_join: Arc<Mutex<Option<ClientRequest>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsRelay {
    pub async fn connect(options: RelayOptions, token: &str) -> Result<Self> {
        let target = options.authenticated_url(token);
        let (stream, _) = connect_async(target.as_str())
            .await
            .with_context(|| format!("failed to connect relay: {}", options.url))?;
        info!(url = %options.url, "relay connected");

        let (outbound, outbound_rx) = mpsc::channel(options.outbound_queue.max(1));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);
        let last_join = Arc::new(Mutex::new(None));

        let supervisor = tokio::spawn(supervise(
            stream,
            target,
            options,
            outbound_rx,
            events.clone(),
            Arc::clone(&state_tx),
            Arc::clone(&last_join),
        ));

        Ok(Self {
            outbound,
            events,
            state,
            state_tx,
            last_join,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }
}

#[async_trait]
impl RelayTransport for WsRelay {
    async fn emit(&self, request: ClientRequest) -> Delivery {
        if matches!(request, ClientRequest::Join { .. }) {
            *self.last_join.lock().await = Some(request.clone());
        }
        let name = request.name();
        let connected = *self.state.borrow() == ConnectionState::Connected;
        match self.outbound.try_send(request) {
            Ok(()) if connected => Delivery::Sent,
            Ok(()) => {
                debug!(frame = name, "relay offline; frame queued");
                Delivery::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(frame = name, "relay outbound queue full; frame dropped");
                Delivery::Failed(DeliveryError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Failed(DeliveryError::Closed),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        publish_state(&self.state_tx, &self.events, ConnectionState::Closed);
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.supervisor.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn publish_state(
    state_tx: &watch::Sender<ConnectionState>,
    events: &broadcast::Sender<RelayEvent>,
    state: ConnectionState,
) {
    let changed = state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        let _ = events.send(RelayEvent::ConnectionChanged(state));
    }
}

enum PumpExit {
    OutboundClosed,
    ConnectionLost(String),
}

async fn supervise(
    first: WsStream,
    target: Url,
    options: RelayOptions,
    mut outbound_rx: mpsc::Receiver<ClientRequest>,
    events: broadcast::Sender<RelayEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    last_join: Arc<Mutex<Option<ClientRequest>>>,
) {
    let mut stream = Some(first);
    let mut attempt = 0u32;

    loop {
        if let Some(ws) = stream.take() {
            attempt = 0;
            match pump(ws, &mut outbound_rx, &events).await {
                PumpExit::OutboundClosed => break,
                PumpExit::ConnectionLost(reason) => {
                    warn!(url = %options.url, %reason, "relay connection lost");
                }
            }
        }

        attempt += 1;
        if !options.reconnect.allows(attempt) {
            warn!(url = %options.url, attempt, "relay reconnect attempts exhausted");
            break;
        }
        publish_state(&state_tx, &events, ConnectionState::Reconnecting { attempt });
        let delay = options.reconnect.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "relay reconnect scheduled");
        tokio::time::sleep(delay).await;

        match connect_async(target.as_str()).await {
            Ok((mut ws, _)) => {
                let rejoin = last_join.lock().await.clone();
                if let Some(join) = rejoin {
                    if let Err(err) = write_frame(&mut ws, &join).await {
                        warn!(%err, "relay rejoin failed");
                        continue;
                    }
                }
                info!(url = %options.url, attempt, "relay reconnected");
                publish_state(&state_tx, &events, ConnectionState::Connected);
                stream = Some(ws);
            }
            Err(err) => {
                warn!(url = %options.url, attempt, %err, "relay reconnect failed");
            }
        }
    }

    publish_state(&state_tx, &events, ConnectionState::Closed);
}

async fn write_frame<S>(sink: &mut S, request: &ClientRequest) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(request)?;
    sink.send(Message::Text(text))
        .await
        .with_context(|| format!("failed to write relay frame '{}'", request.name()))
}

async fn pump(
    ws: WsStream,
    outbound_rx: &mut mpsc::Receiver<ClientRequest>,
    events: &broadcast::Sender<RelayEvent>,
) -> PumpExit {
    let (mut writer, mut reader) = ws.split();
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(request) = outbound else {
                    let _ = writer.close().await;
                    return PumpExit::OutboundClosed;
                };
                // A frame whose write fails is lost: delivery is at-most-once.
                if let Err(err) = write_frame(&mut writer, &request).await {
                    return PumpExit::ConnectionLost(err.to_string());
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        let _ = events.send(RelayEvent::Server(event));
                    }
                    Err(err) => debug!(%err, "ignoring unrecognised relay frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::ConnectionLost("closed by relay".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::ConnectionLost(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
