/// Session registry for downstream browser miners
///
/// Pure data store, no I/O. Sessions are keyed by the miner-supplied
/// wallet identity so counters survive WebSocket reconnects; rows are
/// never dropped on disconnect (the leaderboard reads them), only by
/// explicit prune().

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

pub const MAX_IDENTITY_LEN: usize = 30;
pub const DEFAULT_IDENTITY: &str = "Anonymous";

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize)]
pub struct MinerSession {
    pub identity: String,
    pub accepted: u64,
    pub rejected: u64,
    /// Unix seconds of the last inbound message or share outcome.
    pub last_seen: u64,
    pub ready: bool,
    /// Live transport handle, owned by the WebSocket layer. The registry
    /// only sends into it; closing the socket is never done from here.
    #[serde(skip)]
    pub outbound: Option<mpsc::UnboundedSender<String>>,
}

impl MinerSession {
    fn new(identity: String) -> Self {
        Self {
            identity,
            accepted: 0,
            rejected: 0,
            last_seen: now_secs(),
            ready: false,
            outbound: None,
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, MinerSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a raw `?user=` value to a bounded identity.
    pub fn bound_identity(raw: Option<&str>) -> String {
        let id = match raw {
            Some(s) if !s.trim().is_empty() => s.trim(),
            _ => DEFAULT_IDENTITY,
        };
        id.chars().take(MAX_IDENTITY_LEN).collect()
    }

    /// Return the existing session for an identity or create a zeroed one.
    pub async fn get_or_create(&self, identity: &str) -> MinerSession {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(identity) {
                return session.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(identity.to_string())
            .or_insert_with(|| MinerSession::new(identity.to_string()))
            .clone()
    }

    pub async fn attach_transport(&self, identity: &str, tx: mpsc::UnboundedSender<String>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(identity.to_string())
            .or_insert_with(|| MinerSession::new(identity.to_string()));
        session.outbound = Some(tx);
        session.last_seen = now_secs();
    }

    /// Drop the transport handle only; the session row and its counters
    /// stay behind for the leaderboard. The caller passes its own sender:
    /// if the identity reconnected and the slot already holds a newer
    /// transport, that one is left alone.
    pub async fn detach_transport(&self, identity: &str, tx: &mpsc::UnboundedSender<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(identity) {
            let is_own = session
                .outbound
                .as_ref()
                .is_some_and(|current| current.same_channel(tx));
            if is_own {
                session.outbound = None;
                session.ready = false;
            }
        }
    }

    pub async fn record_activity(&self, identity: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(identity) {
            session.last_seen = now_secs();
        }
    }

    pub async fn mark_ready(&self, identity: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(identity) {
            session.ready = true;
        }
    }

    /// Record a share outcome. Counters only ever increase.
    pub async fn record_share(&self, identity: &str, accepted: bool) -> Option<(u64, u64)> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(identity)?;
        if accepted {
            session.accepted += 1;
        } else {
            session.rejected += 1;
        }
        session.last_seen = now_secs();
        Some((session.accepted, session.rejected))
    }

    /// Deliver a payload to one session. Deliveries to a closed or
    /// detached transport are dropped, never retried.
    pub async fn notify(&self, identity: &str, payload: String) {
        let sessions = self.sessions.read().await;
        if let Some(tx) = sessions.get(identity).and_then(|s| s.outbound.as_ref()) {
            let _ = tx.send(payload);
        }
    }

    /// Snapshot of every session that currently has a live transport.
    pub async fn live_transports(&self) -> Vec<(String, mpsc::UnboundedSender<String>)> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter_map(|s| {
                s.outbound
                    .as_ref()
                    .map(|tx| (s.identity.clone(), tx.clone()))
            })
            .collect()
    }

    /// Read-only stats view for the HTTP layer.
    pub async fn snapshot(&self) -> Vec<MinerSession> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Bounded cleanup of throwaway identities. Sessions with a live
    /// transport are never pruned regardless of age.
    pub async fn prune(&self, max_age_secs: u64) -> usize {
        let now = now_secs();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            s.outbound.is_some() || now.saturating_sub(s.last_seen) <= max_age_secs
        });
        before - sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_bounding() {
        assert_eq!(SessionRegistry::bound_identity(None), "Anonymous");
        assert_eq!(SessionRegistry::bound_identity(Some("")), "Anonymous");
        assert_eq!(SessionRegistry::bound_identity(Some("TC1234")), "TC1234");

        let long = "x".repeat(100);
        assert_eq!(
            SessionRegistry::bound_identity(Some(&long)).len(),
            MAX_IDENTITY_LEN
        );
    }

    #[tokio::test]
    async fn test_counters_survive_reattach() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach_transport("TCAB", tx.clone()).await;
        registry.record_share("TCAB", true).await;
        registry.record_share("TCAB", false).await;

        // Simulated reconnect: detach, then get_or_create again.
        registry.detach_transport("TCAB", &tx).await;
        let session = registry.get_or_create("TCAB").await;
        assert_eq!(session.accepted, 1);
        assert_eq!(session.rejected, 1);
        assert!(session.outbound.is_none());
    }

    #[tokio::test]
    async fn test_detach_spares_a_newer_transport() {
        let registry = SessionRegistry::new();

        // Reconnect under the same identity: the new connection replaces
        // the old sender, then the old connection's loop exits and cleans
        // up after itself.
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        registry.attach_transport("m", old_tx.clone()).await;
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        registry.attach_transport("m", new_tx).await;
        registry.detach_transport("m", &old_tx).await;

        // The reconnected session must still be reachable.
        let live = registry.live_transports().await;
        assert_eq!(live.len(), 1);
        registry.notify("m", "payload".to_string()).await;
        assert_eq!(new_rx.try_recv().unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_record_share_unknown_identity_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.record_share("ghost", true).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_live_transports_excludes_detached() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach_transport("a", tx).await;
        registry.get_or_create("b").await;

        let live = registry.live_transports().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, "a");
    }

    #[tokio::test]
    async fn test_prune_keeps_live_sessions() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach_transport("live", tx).await;
        registry.get_or_create("idle").await;

        // Age 0 makes every transport-less session eligible.
        let removed = registry.prune(0).await;
        assert_eq!(removed, 0); // "idle" was seen just now

        // Backdate the idle session, then prune again.
        {
            let mut sessions = registry.sessions.write().await;
            sessions.get_mut("idle").unwrap().last_seen = 0;
        }
        let removed = registry.prune(60).await;
        assert_eq!(removed, 1);
        assert_eq!(registry.len().await, 1);
    }
}
