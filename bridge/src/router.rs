/// Request router: the aggregation multiplexer
///
/// Upstream Stratum has one flat integer request-id namespace and no
/// session concept. The router assigns each downstream submit a unique
/// monotonic id, remembers which session it came from, and on the
/// matching reply routes the outcome back to exactly that session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::jobs::JobBroadcaster;
use crate::metrics::prometheus as metrics;
use crate::protocol::{self, ShareParams, StratumJob, StratumRequest};
use crate::session::SessionRegistry;
use crate::upstream::UpstreamLink;

/// Bound on outstanding submits; a stalled or malicious upstream must
/// not grow the pending table without limit.
pub const PENDING_CAPACITY: usize = 20_000;

/// Submit ids start well clear of the fixed handshake ids (1, 2).
const FIRST_SUBMIT_ID: u64 = 10;

#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("upstream link is not ready")]
    NotReady,
}

struct PendingShare {
    identity: String,
    submitted_at: Instant,
}

struct RouterState {
    /// Process-wide monotonic counter; never reset, never reused while
    /// an id is outstanding.
    next_id: u64,
    pending: HashMap<u64, PendingShare>,
    /// Insertion order for oldest-first eviction. Resolved ids are left
    /// behind and skipped during eviction; submit() compacts the deque
    /// once it holds more stale entries than live ones.
    order: VecDeque<u64>,
}

pub struct ShareRouter {
    registry: Arc<SessionRegistry>,
    jobs: Arc<JobBroadcaster>,
    upstream: Arc<UpstreamLink>,
    /// Pool-account wallet: every submit goes upstream under this one
    /// authorized identity, never the per-session one.
    wallet: String,
    state: Mutex<RouterState>,
    capacity: usize,
}

impl ShareRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        jobs: Arc<JobBroadcaster>,
        upstream: Arc<UpstreamLink>,
        wallet: String,
    ) -> Self {
        Self::with_pending_capacity(registry, jobs, upstream, wallet, PENDING_CAPACITY)
    }

    pub fn with_pending_capacity(
        registry: Arc<SessionRegistry>,
        jobs: Arc<JobBroadcaster>,
        upstream: Arc<UpstreamLink>,
        wallet: String,
        capacity: usize,
    ) -> Self {
        Self {
            registry,
            jobs,
            upstream,
            wallet,
            state: Mutex::new(RouterState {
                next_id: FIRST_SUBMIT_ID,
                pending: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Forward one downstream share upstream. Returns the assigned
    /// request id. Rejected immediately while the link is not Ready.
    ///
    /// The state lock covers id allocation and table mutation together
    /// and is released before the network write.
    pub async fn submit(&self, identity: &str, share: ShareParams) -> Result<u64, SubmitError> {
        if !self.upstream.is_ready().await {
            return Err(SubmitError::NotReady);
        }

        let request = {
            let mut state = self.state.lock().await;
            while state.pending.len() >= self.capacity {
                match state.order.pop_front() {
                    Some(old_id) => {
                        if state.pending.remove(&old_id).is_some() {
                            warn!("pending table full, evicting oldest submit id={}", old_id);
                            metrics::inc_pending_evictions();
                        }
                    }
                    None => break,
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            state.pending.insert(
                id,
                PendingShare {
                    identity: identity.to_string(),
                    submitted_at: Instant::now(),
                },
            );
            state.order.push_back(id);
            if state.order.len() > self.capacity * 2 {
                let RouterState { pending, order, .. } = &mut *state;
                order.retain(|id| pending.contains_key(id));
            }
            metrics::set_pending_requests(state.pending.len());

            StratumRequest::submit(id, &self.wallet, &share)
        };

        metrics::inc_submitted();
        debug!("submit id={} from {} (job {})", request.id, identity, share.job_id);
        self.upstream.send(&request).await;
        Ok(request.id)
    }

    /// Dispatch one decoded upstream line by message shape. Blank and
    /// unparsable lines are dropped, never fatal.
    pub async fn handle_upstream_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping unparsable upstream frame: {}", e);
                metrics::inc_frames_dropped();
                return;
            }
        };

        if let Some(method) = parsed.get("method").and_then(|m| m.as_str()) {
            let params = parsed
                .get("params")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default();
            self.handle_notification(method, &params).await;
            return;
        }

        if let Some(id) = parsed.get("id").and_then(|i| i.as_u64()) {
            self.handle_reply(id, &parsed).await;
        } else {
            debug!("ignoring upstream frame with no method and no numeric id");
        }
    }

    async fn handle_notification(&self, method: &str, params: &[Value]) {
        match method {
            "mining.notify" => {
                let Some(job) = StratumJob::from_notify_params(params) else {
                    warn!("malformed mining.notify ({} params), dropped", params.len());
                    metrics::inc_frames_dropped();
                    return;
                };
                self.jobs.store_job(job.clone()).await;
                let sent = self.jobs.broadcast(protocol::task_msg(&job)).await;
                metrics::inc_job_broadcasts();
                info!(
                    "job {} broadcast to {} miners (clean={})",
                    job.job_id, sent, job.clean_jobs
                );
            }
            "mining.set_difficulty" => {
                let Some(difficulty) = params.first().and_then(|v| v.as_f64()) else {
                    warn!("malformed mining.set_difficulty, dropped");
                    metrics::inc_frames_dropped();
                    return;
                };
                self.jobs.store_difficulty(difficulty).await;
                let sent = self
                    .jobs
                    .broadcast(protocol::difficulty_msg(difficulty))
                    .await;
                metrics::inc_job_broadcasts();
                info!("difficulty {} broadcast to {} miners", difficulty, sent);
            }
            other => {
                debug!("ignoring upstream notification '{}'", other);
            }
        }
    }

    /// Replies match strictly by id; the pool may answer out of order.
    /// An id with no pending entry (stale, evicted, or stray handshake
    /// reply) mutates nothing.
    async fn handle_reply(&self, id: u64, parsed: &Value) {
        let pending = {
            let mut state = self.state.lock().await;
            let entry = state.pending.remove(&id);
            if entry.is_some() {
                metrics::set_pending_requests(state.pending.len());
            }
            entry
        };

        let Some(pending) = pending else {
            debug!("reply for unknown id={}, dropped", id);
            return;
        };

        let error = parsed.get("error").cloned().unwrap_or(Value::Null);
        let result = parsed.get("result").cloned().unwrap_or(Value::Null);
        let accepted = error.is_null();
        let counters = self.registry.record_share(&pending.identity, accepted).await;

        if accepted {
            metrics::inc_accepted();
            if let Some((acc, _)) = counters {
                info!(
                    "share accepted for {} (total {}, {:?} in flight)",
                    pending.identity,
                    acc,
                    pending.submitted_at.elapsed()
                );
            }
            self.registry
                .notify(&pending.identity, protocol::success_msg(error, result).to_string())
                .await;
        } else {
            metrics::inc_rejected();
            warn!("share rejected for {}: {}", pending.identity, error);
            self.registry
                .notify(&pending.identity, protocol::failed_msg(error, result).to_string())
                .await;
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    #[cfg(test)]
    pub(crate) async fn order_len(&self) -> usize {
        self.state.lock().await.order.len()
    }
}
