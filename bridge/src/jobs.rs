/// Job cache and downstream broadcaster
///
/// Remembers the most recent upstream job and difficulty so a session
/// that connects between notification cycles gets work immediately, and
/// fans every new job/difficulty out to all live sessions.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::{self, StratumJob};
use crate::session::SessionRegistry;

#[derive(Default)]
struct JobState {
    job: Option<StratumJob>,
    difficulty: Option<f64>,
}

pub struct JobBroadcaster {
    registry: Arc<SessionRegistry>,
    /// Already-mapped algorithm identifier sent in `initialize`.
    algo: String,
    state: RwLock<JobState>,
}

impl JobBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>, algo: String) -> Self {
        Self {
            registry,
            algo,
            state: RwLock::new(JobState::default()),
        }
    }

    /// Overwrite-latest; the cache always reflects the most recent
    /// upstream notification.
    pub async fn store_job(&self, job: StratumJob) {
        self.state.write().await.job = Some(job);
    }

    pub async fn store_difficulty(&self, difficulty: f64) {
        self.state.write().await.difficulty = Some(difficulty);
    }

    pub async fn cached_job(&self) -> Option<StratumJob> {
        self.state.read().await.job.clone()
    }

    pub async fn cached_difficulty(&self) -> Option<f64> {
        self.state.read().await.difficulty
    }

    /// Greet a newly attached session: initialize, then the cached
    /// difficulty and job if we have them.
    pub async fn on_session_connect(&self, identity: &str) {
        self.registry
            .notify(identity, protocol::initialize_msg(&self.algo).to_string())
            .await;

        let (job, difficulty) = {
            let state = self.state.read().await;
            (state.job.clone(), state.difficulty)
        };
        if let Some(difficulty) = difficulty {
            self.registry
                .notify(identity, protocol::difficulty_msg(difficulty).to_string())
                .await;
        }
        if let Some(job) = job {
            self.registry
                .notify(identity, protocol::task_msg(&job).to_string())
                .await;
        }
    }

    /// Send one serialized payload to every session with a live
    /// transport. Closed transports are skipped, not removed — the
    /// WebSocket layer detaches them on its own close path.
    pub async fn broadcast(&self, payload: Value) -> usize {
        let text = payload.to_string();
        let mut sent = 0;
        for (identity, tx) in self.registry.live_transports().await {
            if tx.send(text.clone()).is_ok() {
                sent += 1;
            } else {
                debug!("skipping closed transport for {}", identity);
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn job(id: &str) -> StratumJob {
        StratumJob {
            job_id: id.to_string(),
            prevhash: "prev".into(),
            coinbase1: "cb1".into(),
            coinbase2: "cb2".into(),
            merkle_branch: vec![],
            version: "20000000".into(),
            nbits: "1d00ffff".into(),
            ntime: "5e9a1c00".into(),
            clean_jobs: true,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_live_session() {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = JobBroadcaster::new(registry.clone(), "cwm_power2B".into());

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.attach_transport("a", tx1).await;
        registry.attach_transport("b", tx2).await;

        // A closed transport is skipped, not an error.
        let (tx3, rx3) = mpsc::unbounded_channel();
        registry.attach_transport("c", tx3).await;
        drop(rx3);

        let sent = jobs.broadcast(json!({"method": "task"})).await;
        assert_eq!(sent, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_new_session_receives_cached_work() {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = JobBroadcaster::new(registry.clone(), "cwm_yespower".into());

        jobs.store_difficulty(16.0).await;
        jobs.store_job(job("j77")).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_transport("late", tx).await;
        jobs.on_session_connect("late").await;

        let init: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(init["method"], "initialize");
        assert_eq!(init["params"][0], "cwm_yespower");

        let diff: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(diff["method"], "difficulty");
        assert_eq!(diff["params"][0], 16.0);

        let task: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(task["method"], "task");
        assert_eq!(task["params"][0]["job_id"], "j77");
    }

    #[tokio::test]
    async fn test_no_cached_work_sends_only_initialize() {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = JobBroadcaster::new(registry.clone(), "cwm_power2B".into());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_transport("fresh", tx).await;
        jobs.on_session_connect("fresh").await;

        assert!(rx.try_recv().is_ok()); // initialize
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_survives_same_identity_reconnect() {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = JobBroadcaster::new(registry.clone(), "cwm_power2B".into());

        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        registry.attach_transport("m", old_tx.clone()).await;
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        registry.attach_transport("m", new_tx).await;
        // The replaced connection's loop exits and detaches itself.
        registry.detach_transport("m", &old_tx).await;

        let sent = jobs.broadcast(json!({"method": "task"})).await;
        assert_eq!(sent, 1);
        assert!(new_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_cache_is_overwrite_latest() {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = JobBroadcaster::new(registry, "cwm_power2B".into());

        jobs.store_job(job("old")).await;
        jobs.store_job(job("new")).await;
        assert_eq!(jobs.cached_job().await.unwrap().job_id, "new");
    }
}
