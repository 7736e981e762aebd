use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Peer, UserId},
    protocol::{ChatMessage, ClientRequest, PushSubscription},
};
use storage::LocalStore;
use tokio::sync::{broadcast, oneshot};

use crate::{
    api::ChatApi,
    identity::Identity,
    session::{SessionContext, SessionOptions},
    transport::{ConnectionState, Delivery, DeliveryError, RelayEvent, RelayTransport},
};

pub fn message(sender: &str, receiver: &str, body: &str) -> ChatMessage {
    ChatMessage {
        message_id: None,
        sender_id: sender.into(),
        receiver_id: receiver.into(),
        body: body.to_string(),
        timestamp: None,
        read: false,
    }
}

/// In-memory relay recording every emitted frame.
pub struct FakeRelay {
    emitted: Mutex<Vec<ClientRequest>>,
    delivery: Mutex<Delivery>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<RelayEvent>,
}

impl FakeRelay {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            emitted: Mutex::new(Vec::new()),
            delivery: Mutex::new(Delivery::Sent),
            state: Mutex::new(ConnectionState::Connected),
            events,
        })
    }

    pub fn emitted(&self) -> Vec<ClientRequest> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn emitted_named(&self, name: &str) -> Vec<ClientRequest> {
        self.emitted()
            .into_iter()
            .filter(|request| request.name() == name)
            .collect()
    }

    pub fn respond_with(&self, delivery: Delivery) {
        *self.delivery.lock().unwrap() = delivery;
    }

    pub fn push(&self, event: RelayEvent) {
        if let RelayEvent::ConnectionChanged(state) = &event {
            *self.state.lock().unwrap() = *state;
        }
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl RelayTransport for FakeRelay {
    async fn emit(&self, request: ClientRequest) -> Delivery {
        let delivery = self.delivery.lock().unwrap().clone();
        if !delivery.is_failed() {
            self.emitted.lock().unwrap().push(request);
        }
        delivery
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn shutdown(&self) {
        self.respond_with(Delivery::Failed(DeliveryError::Closed));
        self.push(RelayEvent::ConnectionChanged(ConnectionState::Closed));
    }
}

/// In-memory backend. History and search responses can be held back with a
/// gate until the test releases them.
#[derive(Default)]
pub struct FakeChatApi {
    users: Mutex<Vec<Peer>>,
    histories: Mutex<HashMap<UserId, Vec<ChatMessage>>>,
    failing_histories: Mutex<Vec<UserId>>,
    history_gates: Mutex<HashMap<UserId, oneshot::Receiver<()>>>,
    search_gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    block_result: Mutex<Option<bool>>,
    calls: Mutex<Vec<String>>,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_users(&self, users: Vec<Peer>) {
        *self.users.lock().unwrap() = users;
    }

    pub fn with_history(&self, peer: &str, messages: Vec<ChatMessage>) {
        self.histories
            .lock()
            .unwrap()
            .insert(UserId::new(peer), messages);
    }

    pub fn fail_history(&self, peer: &str) {
        self.failing_histories.lock().unwrap().push(UserId::new(peer));
    }

    /// Holds the history response for `peer` until the sender fires.
    pub fn gate_history(&self, peer: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.history_gates
            .lock()
            .unwrap()
            .insert(UserId::new(peer), rx);
        tx
    }

    /// Holds the filtered listing for `query` until the sender fires.
    pub fn gate_search(&self, query: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.search_gates
            .lock()
            .unwrap()
            .insert(query.to_string(), rx);
        tx
    }

    pub fn block_returns(&self, success: bool) {
        *self.block_result.lock().unwrap() = Some(success);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_users(&self, username_query: Option<&str>) -> Result<Vec<Peer>> {
        self.record(format!("list_users:{}", username_query.unwrap_or("*")));
        let Some(query) = username_query else {
            return Ok(self.users.lock().unwrap().clone());
        };
        let gate = self.search_gates.lock().unwrap().remove(query);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|peer| peer.username.contains(query))
            .cloned()
            .collect())
    }

    async fn history(&self, self_id: &UserId, peer_id: &UserId) -> Result<Vec<ChatMessage>> {
        self.record(format!("history:{self_id}:{peer_id}"));
        let gate = self.history_gates.lock().unwrap().remove(peer_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failing_histories.lock().unwrap().contains(peer_id) {
            return Err(anyhow!("history backend unavailable"));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn block(&self, self_id: &UserId, peer_id: &UserId) -> Result<bool> {
        self.record(format!("block:{self_id}:{peer_id}"));
        match *self.block_result.lock().unwrap() {
            Some(success) => Ok(success),
            None => Err(anyhow!("block endpoint unavailable")),
        }
    }

    async fn mark_read(&self, sender_id: &UserId, receiver_id: &UserId) -> Result<u64> {
        self.record(format!("mark_read:{sender_id}:{receiver_id}"));
        Ok(1)
    }

    async fn subscribe_push(&self, subscription: &PushSubscription) -> Result<()> {
        self.record(format!(
            "subscribe_push:{}:{}",
            subscription.user_id, subscription.endpoint
        ));
        Ok(())
    }
}

pub struct Harness {
    pub ctx: Arc<SessionContext>,
    pub api: Arc<FakeChatApi>,
    pub relay: Arc<FakeRelay>,
}

pub async fn harness() -> Harness {
    harness_with(SessionOptions::default()).await
}

/// Session context for user `u1` ("alice") backed by fakes and an in-memory
/// store.
pub async fn harness_with(options: SessionOptions) -> Harness {
    let store = LocalStore::new("sqlite::memory:").await.expect("store");
    let api = FakeChatApi::new();
    let relay = FakeRelay::new();
    let ctx = SessionContext::new(
        Identity {
            user_id: UserId::new("u1"),
            username: "alice".to_string(),
        },
        api.clone(),
        relay.clone(),
        store,
        options,
    );
    Harness { ctx, api, relay }
}
