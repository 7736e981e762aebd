use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use shared::domain::{Peer, UserId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::session::{ClientEvent, SessionContext};

struct DirectoryState {
    generation: u64,
    peers: Vec<Peer>,
}

pub struct DirectoryController {
    ctx: Arc<SessionContext>,
    state: Mutex<DirectoryState>,
}

impl DirectoryController {
    pub fn new(ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(DirectoryState {
                generation: 0,
                peers: Vec::new(),
            }),
        })
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.state.lock().await.peers.clone()
    }

    pub async fn find_by_username(&self, username: &str) -> Option<Peer> {
        self.state
            .lock()
            .await
            .peers
            .iter()
            .find(|peer| peer.username == username)
            .cloned()
    }

    /// Short queries list recently-contacted peers only. Longer ones list
    /// recent peers first, then the backend's matches. The result replaces the
    /// current listing unless a newer search was issued in the meantime.
    pub async fn search(&self, query: &str) -> Result<Vec<Peer>> {
        let query = query.trim();
        let generation = {
            let mut guard = self.state.lock().await;
            guard.generation += 1;
            guard.generation
        };

        let recent: HashSet<String> = self.ctx.store().recent_contacts().await?.into_iter().collect();
        let everyone = self.ctx.api().list_users(None).await?;
        let blocked = self.ctx.blocked_peers().await;
        let self_id = self.ctx.self_id();
        let listable = |peer: &Peer| &peer.user_id != self_id && !blocked.contains(&peer.user_id);

        let mut listed: Vec<Peer> = everyone
            .into_iter()
            .filter(|peer| recent.contains(&peer.username) && listable(peer))
            .collect();

        if query.chars().count() >= self.ctx.options().search_min_query_len {
            let matches = self.ctx.api().list_users(Some(query)).await?;
            let mut seen: HashSet<UserId> = listed.iter().map(|peer| peer.user_id.clone()).collect();
            for peer in matches {
                if listable(&peer) && seen.insert(peer.user_id.clone()) {
                    listed.push(peer);
                }
            }
        } else {
            let mut seen = HashSet::new();
            listed.retain(|peer| seen.insert(peer.user_id.clone()));
        }

        let mut guard = self.state.lock().await;
        if guard.generation != generation {
            debug!(query, generation, "dropping stale directory results");
            return Ok(listed);
        }
        guard.peers = listed.clone();
        drop(guard);
        debug!(query, count = listed.len(), "directory updated");
        self.ctx.emit(ClientEvent::DirectoryUpdated(listed.clone()));
        Ok(listed)
    }

    pub async fn mark_offline(&self, user_id: &UserId) -> bool {
        let updated = {
            let mut guard = self.state.lock().await;
            match guard.peers.iter_mut().find(|peer| &peer.user_id == user_id) {
                Some(peer) => {
                    peer.online = false;
                    true
                }
                None => false,
            }
        };
        if !updated {
            warn!(%user_id, "offline notice for a peer outside the listing");
        }
        self.ctx.emit(ClientEvent::PeerOffline {
            peer_id: user_id.clone(),
        });
        updated
    }

    pub async fn remove(&self, user_id: &UserId) -> bool {
        let removed = {
            let mut guard = self.state.lock().await;
            let before = guard.peers.len();
            guard.peers.retain(|peer| &peer.user_id != user_id);
            (guard.peers.len() != before).then(|| guard.peers.clone())
        };
        match removed {
            Some(peers) => {
                self.ctx.emit(ClientEvent::DirectoryUpdated(peers));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
