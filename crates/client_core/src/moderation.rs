use std::sync::Arc;

use anyhow::Result;
use shared::domain::UserId;
use tracing::{info, warn};

use crate::{
    conversation::ConversationController,
    directory::DirectoryController,
    error::ModerationError,
    session::{ClientEvent, CloseReason, SessionContext},
};

pub struct ModerationController {
    ctx: Arc<SessionContext>,
    conversation: Arc<ConversationController>,
    directory: Arc<DirectoryController>,
}

impl ModerationController {
    pub fn new(
        ctx: Arc<SessionContext>,
        conversation: Arc<ConversationController>,
        directory: Arc<DirectoryController>,
    ) -> Self {
        Self {
            ctx,
            conversation,
            directory,
        }
    }

    /// Blocks `peer_id` for the rest of the session. On success the active
    /// conversation with that peer is torn down and the peer leaves the
    /// directory listing.
    pub async fn block(&self, peer_id: &UserId) -> Result<()> {
        if peer_id == self.ctx.self_id() {
            return Err(ModerationError::SelfBlock.into());
        }

        let accepted = self.ctx.api().block(self.ctx.self_id(), peer_id).await?;
        if !accepted {
            warn!(%peer_id, "block request rejected");
            return Err(ModerationError::Rejected(peer_id.clone()).into());
        }

        self.ctx.mark_blocked(peer_id.clone()).await;
        self.conversation
            .close_peer(peer_id, CloseReason::Blocked)
            .await;
        self.directory.remove(peer_id).await;
        info!(%peer_id, "peer blocked");
        self.ctx.emit(ClientEvent::PeerBlocked {
            peer_id: peer_id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/moderation_tests.rs"]
mod tests;
