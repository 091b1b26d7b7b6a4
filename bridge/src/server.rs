/// HTTP and WebSocket surface
///
/// One axum router serves everything: the root endpoint upgrades miner
/// WebSockets (or answers with a banner for plain HTTP probes), plus
/// the stats API, wallet helper, Prometheus metrics and health check.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CoinInfo;
use crate::jobs::JobBroadcaster;
use crate::metrics::prometheus as metrics;
use crate::protocol::{ClientMessage, ShareParams};
use crate::router::ShareRouter;
use crate::session::{now_secs, SessionRegistry};
use crate::upstream::UpstreamLink;

/// A session with no activity for this long shows as offline in the
/// stats API.
const ONLINE_WINDOW_SECS: u64 = 15;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub jobs: Arc<JobBroadcaster>,
    pub router: Arc<ShareRouter>,
    pub upstream: Arc<UpstreamLink>,
    pub coin: CoinInfo,
    pub started_at: DateTime<Utc>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/stats", get(api_stats))
        .route("/api/wallet/create", get(api_wallet_create))
        .route("/metrics", get(metrics_endpoint))
        .route("/health", get(health))
        .with_state(state)
}

/// The root path does double duty: browser miners connect a WebSocket
/// here, everything else gets a short text banner.
async fn root(
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Some(upgrade) => {
            let identity = SessionRegistry::bound_identity(params.get("user").map(String::as_str));
            upgrade.on_upgrade(move |socket| miner_session(socket, identity, state))
        }
        None => format!(
            "{} bridge - connect a WebSocket miner here ({} sessions active)\n",
            state.coin.name,
            state.registry.len().await
        )
        .into_response(),
    }
}

async fn miner_session(mut socket: WebSocket, identity: String, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.registry.get_or_create(&identity).await;
    state.registry.attach_transport(&identity, tx.clone()).await;
    metrics::inc_sessions();
    info!("miner connected: {}", identity);

    state.jobs.on_session_connect(&identity).await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Transport replaced by a newer connection for the
                    // same identity.
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&identity, &text, &state).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.registry.record_activity(&identity).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("websocket error for {}: {}", identity, e);
                        break;
                    }
                }
            }
        }
    }

    state.registry.detach_transport(&identity, &tx).await;
    metrics::dec_sessions();
    info!("miner disconnected: {}", identity);
}

async fn handle_client_message(identity: &str, text: &str, state: &AppState) {
    state.registry.record_activity(identity).await;

    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("unparsable message from {}: {}", identity, e);
            return;
        }
    };

    match msg.kind() {
        Some("ready") => {
            state.registry.mark_ready(identity).await;
            debug!("miner {} is ready for work", identity);
        }
        Some("submit") => {
            let share = msg
                .params
                .get(0)
                .cloned()
                .and_then(|v| serde_json::from_value::<ShareParams>(v).ok());
            let Some(share) = share else {
                warn!("malformed submit from {}", identity);
                state
                    .registry
                    .notify(
                        identity,
                        crate::protocol::failed_msg(json!("malformed submit"), Value::Null)
                            .to_string(),
                    )
                    .await;
                return;
            };
            if let Err(e) = state.router.submit(identity, share).await {
                state
                    .registry
                    .notify(
                        identity,
                        crate::protocol::failed_msg(json!(e.to_string()), Value::Null).to_string(),
                    )
                    .await;
            }
        }
        Some(other) => {
            debug!("ignoring '{}' from {}", other, identity);
        }
        None => {
            debug!("message with no method from {}", identity);
        }
    }
}

/// Leaderboard plus network totals, shaped for the web dashboard.
async fn api_stats(State(state): State<AppState>) -> impl IntoResponse {
    let now = now_secs();
    let mut sessions = state.registry.snapshot().await;
    sessions.sort_by(|a, b| b.accepted.cmp(&a.accepted));

    let mut total_shares: u64 = 0;
    let mut total_rejected: u64 = 0;
    let mut online: u64 = 0;

    let leaderboard: Vec<Value> = sessions
        .iter()
        .enumerate()
        .map(|(i, s)| {
            total_shares += s.accepted;
            total_rejected += s.rejected;
            let is_online =
                s.outbound.is_some() && now.saturating_sub(s.last_seen) < ONLINE_WINDOW_SECS;
            if is_online {
                online += 1;
            }
            json!({
                "rank": i + 1,
                "wallet": s.identity,
                "shares": s.accepted,
                "rejected": s.rejected,
                // Dashboards expect a fixed 4-decimal string here.
                "balance": format!("{:.4}", s.accepted as f64 * state.coin.reward_per_share),
                "lastSeen": s.last_seen,
                "status": if is_online { "online" } else { "offline" },
            })
        })
        .collect();

    let body = json!({
        "network": {
            "name": state.coin.name,
            "symbol": state.coin.symbol,
            "total_shares": total_shares,
            "total_rejected": total_rejected,
            "miners_online": online,
            "pool_connected": state.upstream.is_ready().await,
        },
        "started_at": state.started_at.to_rfc3339(),
        "miners": leaderboard,
    });

    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(body))
}

/// Hand out a fresh throwaway wallet identity and seed its session so
/// it appears on the leaderboard immediately.
async fn api_wallet_create(State(state): State<AppState>) -> impl IntoResponse {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    let wallet = format!("{}{}", state.coin.symbol, suffix);
    state.registry.get_or_create(&wallet).await;
    info!("created wallet identity {}", wallet);

    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(json!({"wallet": wallet, "coin": state.coin.symbol})),
    )
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": "ok",
        "upstream": state.upstream.is_ready().await,
        "sessions": state.registry.len().await,
    });
    (StatusCode::OK, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_state() -> AppState {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = Arc::new(JobBroadcaster::new(registry.clone(), "cwm_power2B".into()));
        let upstream = Arc::new(UpstreamLink::new(
            "127.0.0.1".into(),
            1,
            "W".into(),
            "x".into(),
            "ua".into(),
        ));
        let router = Arc::new(ShareRouter::new(
            registry.clone(),
            jobs.clone(),
            upstream.clone(),
            "W".into(),
        ));
        let cfg = Config::from_json(r#"{"pool": "p:1", "wallet": "W"}"#).unwrap();
        AppState {
            registry,
            jobs,
            router,
            upstream,
            coin: cfg.coin,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ready_message_marks_session() {
        let state = test_state();
        state.registry.get_or_create("m").await;
        handle_client_message("m", r#"{"id":"ready","params":[]}"#, &state).await;
        assert!(state.registry.get_or_create("m").await.ready);
    }

    #[tokio::test]
    async fn test_submit_while_pool_down_reports_failure() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.registry.attach_transport("m", tx).await;

        let submit = r#"{"id":"submit","params":[{
            "job_id":"j1","extranonce2":"0001","ntime":"5e9a1c00","nonce":"cafebabe"
        }]}"#;
        handle_client_message("m", submit, &state).await;

        let reply: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["method"], "failed");
    }

    #[tokio::test]
    async fn test_malformed_submit_reports_failure() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.registry.attach_transport("m", tx).await;

        handle_client_message("m", r#"{"id":"submit","params":["not-an-object"]}"#, &state).await;

        let reply: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["method"], "failed");
    }

    #[tokio::test]
    async fn test_garbage_messages_are_ignored() {
        let state = test_state();
        state.registry.get_or_create("m").await;
        handle_client_message("m", "{not json", &state).await;
        handle_client_message("m", r#"{"params":[]}"#, &state).await;
        handle_client_message("m", r#"{"id":"no-such-method","params":[]}"#, &state).await;
    }

    #[tokio::test]
    async fn test_wallet_identities_have_coin_prefix() {
        let state = test_state();
        let response = api_wallet_create(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        // The session was seeded under a TC-prefixed identity.
        let snapshot = state.registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].identity.starts_with("TC"));
        assert_eq!(snapshot[0].identity.len(), 10);
    }

    #[tokio::test]
    async fn test_stats_sorted_by_accepted() {
        let state = test_state();
        state.registry.get_or_create("low").await;
        state.registry.get_or_create("high").await;
        for _ in 0..3 {
            state.registry.record_share("high", true).await;
        }
        state.registry.record_share("low", true).await;

        let response = api_stats(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["miners"][0]["wallet"], "high");
        assert_eq!(body["miners"][0]["rank"], 1);
        assert_eq!(body["miners"][0]["balance"], "0.3750");
        assert_eq!(body["network"]["total_shares"], 4);
    }
}
