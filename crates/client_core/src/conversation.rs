use std::{collections::HashSet, fmt, sync::Arc};

use anyhow::Result;
use shared::{
    domain::{MessageId, Peer, UserId},
    protocol::{ChatMessage, OutboundMessage},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::ConversationError,
    session::{ClientEvent, CloseReason, SessionContext},
    transport::Delivery,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPhase {
    Idle,
    Joining,
    Loading,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub message: ChatMessage,
    pub is_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    NoMessagesYet,
    HistoryUnavailable,
    Blocked,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMessagesYet => f.write_str("No messages yet."),
            Self::HistoryUnavailable => {
                f.write_str("Error loading messages. Please try again later.")
            }
            Self::Blocked => f.write_str("You have blocked this user."),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEntry {
    Message(RenderedMessage),
    Notice(Notice),
}

/// Point-in-time copy of what the conversation panel shows.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub peer: Option<Peer>,
    pub phase: ConversationPhase,
    pub entries: Vec<ViewEntry>,
    pub peer_typing: bool,
}

impl ConversationView {
    pub fn messages(&self) -> impl Iterator<Item = &RenderedMessage> {
        self.entries.iter().filter_map(|entry| match entry {
            ViewEntry::Message(rendered) => Some(rendered),
            ViewEntry::Notice(_) => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Loaded(usize),
    Failed,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty text or no active peer; nothing was emitted.
    Skipped,
    Emitted { local_id: Uuid, delivery: Delivery },
}

struct ConversationState {
    // Bumped on every peer switch; late history, read and typing work must match it.
    generation: u64,
    peer: Option<Peer>,
    phase: ConversationPhase,
    entries: Vec<ViewEntry>,
    peer_typing: bool,
    typing_generation: u64,
}

impl ConversationState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.peer.is_some()
    }

    fn active_peer_id(&self) -> Option<&UserId> {
        self.peer.as_ref().map(|peer| &peer.user_id)
    }
}

pub struct ConversationController {
    ctx: Arc<SessionContext>,
    state: Mutex<ConversationState>,
}

impl ConversationController {
    pub fn new(ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(ConversationState {
                generation: 0,
                peer: None,
                phase: ConversationPhase::Idle,
                entries: Vec::new(),
                peer_typing: false,
                typing_generation: 0,
            }),
        })
    }

    pub async fn snapshot(&self) -> ConversationView {
        let guard = self.state.lock().await;
        ConversationView {
            peer: guard.peer.clone(),
            phase: guard.phase,
            entries: guard.entries.clone(),
            peer_typing: guard.peer_typing,
        }
    }

    pub async fn active_peer(&self) -> Option<Peer> {
        self.state.lock().await.peer.clone()
    }

    pub async fn select_peer(self: &Arc<Self>, peer: Peer) -> Result<HistoryOutcome> {
        if &peer.user_id == self.ctx.self_id() {
            return Err(ConversationError::SelfConversation.into());
        }
        if self.ctx.is_blocked(&peer.user_id).await {
            return Err(ConversationError::PeerBlocked(peer.user_id).into());
        }

        let generation = {
            let mut guard = self.state.lock().await;
            guard.generation += 1;
            guard.peer = Some(peer.clone());
            guard.phase = ConversationPhase::Joining;
            guard.entries.clear();
            guard.peer_typing = false;
            guard.typing_generation += 1;
            guard.generation
        };
        info!(peer_id = %peer.user_id, generation, "conversation opened");
        self.ctx.emit(ClientEvent::ConversationOpened { peer: peer.clone() });

        let delivery = self
            .ctx
            .transport()
            .join(self.ctx.self_id(), &peer.user_id)
            .await;
        if delivery.is_failed() {
            warn!(peer_id = %peer.user_id, ?delivery, "room join was not delivered");
        }

        Ok(self.load_history(generation, &peer.user_id).await)
    }

    async fn load_history(&self, generation: u64, peer_id: &UserId) -> HistoryOutcome {
        {
            let mut guard = self.state.lock().await;
            if !guard.is_current(generation) {
                return HistoryOutcome::Superseded;
            }
            guard.phase = ConversationPhase::Loading;
        }

        let result = self.ctx.api().history(self.ctx.self_id(), peer_id).await;

        let outcome = {
            let mut guard = self.state.lock().await;
            if !guard.is_current(generation) {
                debug!(%peer_id, generation, "dropping stale history response");
                return HistoryOutcome::Superseded;
            }
            guard.phase = ConversationPhase::Ready;
            match result {
                Ok(messages) => {
                    let count = messages.len();
                    let stored: HashSet<MessageId> = messages
                        .iter()
                        .filter_map(|message| message.message_id.clone())
                        .collect();
                    let mut entries: Vec<ViewEntry> = messages
                        .into_iter()
                        .map(|message| ViewEntry::Message(self.render(message)))
                        .collect();
                    // Live messages that raced ahead of the history stay after it.
                    let live = std::mem::take(&mut guard.entries);
                    entries.extend(live.into_iter().filter(|entry| match entry {
                        ViewEntry::Message(rendered) => rendered
                            .message
                            .message_id
                            .as_ref()
                            .map_or(true, |id| !stored.contains(id)),
                        ViewEntry::Notice(_) => false,
                    }));
                    if entries.is_empty() {
                        entries.push(ViewEntry::Notice(Notice::NoMessagesYet));
                    }
                    guard.entries = entries;
                    HistoryOutcome::Loaded(count)
                }
                Err(err) => {
                    warn!(%peer_id, %err, "failed to load conversation history");
                    guard
                        .entries
                        .insert(0, ViewEntry::Notice(Notice::HistoryUnavailable));
                    self.ctx.emit(ClientEvent::HistoryFailed {
                        peer_id: peer_id.clone(),
                        reason: err.to_string(),
                    });
                    HistoryOutcome::Failed
                }
            }
        };

        if let HistoryOutcome::Loaded(count) = outcome {
            self.ctx.emit(ClientEvent::HistoryLoaded {
                peer_id: peer_id.clone(),
                count,
            });
            self.mark_read(generation, peer_id).await;
        }
        outcome
    }

    async fn mark_read(&self, generation: u64, peer_id: &UserId) {
        let self_id = self.ctx.self_id();
        match self.ctx.api().mark_read(peer_id, self_id).await {
            Ok(updated) => {
                let mut guard = self.state.lock().await;
                if !guard.is_current(generation) {
                    return;
                }
                let mut marked = 0;
                for entry in guard.entries.iter_mut() {
                    if let ViewEntry::Message(rendered) = entry {
                        let message = &mut rendered.message;
                        if &message.sender_id == peer_id && &message.receiver_id == self_id {
                            message.read = true;
                            marked += 1;
                        }
                    }
                }
                drop(guard);
                debug!(%peer_id, updated, marked, "messages marked read");
                self.ctx.emit(ClientEvent::MessagesMarkedRead {
                    peer_id: peer_id.clone(),
                    count: marked,
                });
            }
            Err(err) => warn!(%peer_id, %err, "failed to mark messages read"),
        }
    }

    fn render(&self, message: ChatMessage) -> RenderedMessage {
        let is_self = &message.sender_id == self.ctx.self_id();
        RenderedMessage { message, is_self }
    }

    /// Emits `text` to the active peer without waiting for any
    /// acknowledgement. The caller clears its input on `Emitted`.
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Skipped);
        }
        let Some(peer) = self.active_peer().await else {
            return Ok(SendOutcome::Skipped);
        };

        let local_id = Uuid::new_v4();
        let delivery = self
            .ctx
            .transport()
            .send(OutboundMessage {
                sender: self.ctx.self_id().clone(),
                receiver: peer.user_id.clone(),
                message: text.to_string(),
            })
            .await;
        debug!(%local_id, peer_id = %peer.user_id, ?delivery, "message emitted");

        if delivery.is_failed() {
            self.ctx.emit(ClientEvent::Error(format!(
                "message to {} was not delivered",
                peer.username
            )));
        } else if let Err(err) = self.ctx.store().record_recent_contact(&peer.username).await {
            warn!(username = %peer.username, %err, "failed to record recent contact");
        }

        Ok(SendOutcome::Emitted { local_id, delivery })
    }

    pub async fn notify_typing(&self) -> Option<Delivery> {
        let peer_id = self.state.lock().await.active_peer_id().cloned()?;
        Some(
            self.ctx
                .transport()
                .emit_typing(self.ctx.self_id(), &peer_id)
                .await,
        )
    }

    pub async fn handle_message(&self, message: ChatMessage) -> bool {
        if self.ctx.is_blocked(&message.sender_id).await {
            return false;
        }
        let rendered = {
            let mut guard = self.state.lock().await;
            let Some(peer_id) = guard.active_peer_id() else {
                return false;
            };
            if !message.is_between(self.ctx.self_id(), peer_id) {
                debug!(sender_id = %message.sender_id, "dropping message for inactive conversation");
                return false;
            }
            let rendered = self.render(message);
            if guard.entries == [ViewEntry::Notice(Notice::NoMessagesYet)] {
                guard.entries.clear();
            }
            guard
                .entries
                .push(ViewEntry::Message(rendered.clone()));
            rendered
        };
        self.ctx.emit(ClientEvent::MessageAppended(rendered));
        true
    }

    pub async fn handle_typing(self: &Arc<Self>, sender_id: &UserId) -> bool {
        if sender_id == self.ctx.self_id() {
            return false;
        }
        let (generation, typing_generation, newly_typing) = {
            let mut guard = self.state.lock().await;
            if guard.active_peer_id() != Some(sender_id) {
                return false;
            }
            let newly_typing = !guard.peer_typing;
            guard.peer_typing = true;
            guard.typing_generation += 1;
            (guard.generation, guard.typing_generation, newly_typing)
        };
        if newly_typing {
            self.ctx.emit(ClientEvent::TypingStarted {
                peer_id: sender_id.clone(),
            });
        }

        let controller = Arc::clone(self);
        let idle = self.ctx.options().typing_idle;
        let peer_id = sender_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let cleared = {
                let mut guard = controller.state.lock().await;
                if guard.generation == generation
                    && guard.typing_generation == typing_generation
                    && guard.peer_typing
                {
                    guard.peer_typing = false;
                    true
                } else {
                    false
                }
            };
            if cleared {
                controller
                    .ctx
                    .emit(ClientEvent::TypingStopped { peer_id });
            }
        });
        true
    }

    /// Re-joins and reloads the active conversation, e.g. after the relay
    /// reconnects and live events may have been missed.
    pub async fn resync(self: &Arc<Self>) -> Result<Option<HistoryOutcome>> {
        let Some(peer) = self.active_peer().await else {
            return Ok(None);
        };
        info!(peer_id = %peer.user_id, "resyncing conversation");
        self.select_peer(peer).await.map(Some)
    }

    pub async fn close_peer(&self, peer_id: &UserId, reason: CloseReason) -> bool {
        {
            let mut guard = self.state.lock().await;
            if guard.active_peer_id() != Some(peer_id) {
                return false;
            }
            Self::clear(&mut guard);
            if reason == CloseReason::Blocked {
                guard.entries.push(ViewEntry::Notice(Notice::Blocked));
            }
        }
        self.ctx.emit(ClientEvent::ConversationClosed {
            peer_id: peer_id.clone(),
            reason,
        });
        true
    }

    pub async fn reset(&self, reason: CloseReason) {
        let closed = {
            let mut guard = self.state.lock().await;
            let closed = guard.peer.as_ref().map(|peer| peer.user_id.clone());
            Self::clear(&mut guard);
            closed
        };
        if let Some(peer_id) = closed {
            self.ctx
                .emit(ClientEvent::ConversationClosed { peer_id, reason });
        }
    }

    fn clear(state: &mut ConversationState) {
        state.generation += 1;
        state.peer = None;
        state.phase = ConversationPhase::Idle;
        state.entries.clear();
        state.peer_typing = false;
        state.typing_generation += 1;
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
