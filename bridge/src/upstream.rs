/// Upstream pool link
///
/// Owns the single TCP connection to the Stratum pool: connect,
/// subscribe/authorize handshake, read loop, and the reconnect cycle.
/// The whole lifetime is one sequential loop, so there is never more
/// than one connection attempt in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::framing::LineFramer;
use crate::metrics::prometheus as metrics;
use crate::protocol::{StratumRequest, AUTHORIZE_ID, SUBSCRIBE_ID};
use crate::router::ShareRouter;

/// Fixed pause between reconnect attempts. No backoff: the pool is the
/// only upstream and we want back on it as soon as it returns.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

pub struct UpstreamLink {
    host: String,
    port: u16,
    wallet: String,
    password: String,
    user_agent: String,
    reconnect_delay: Duration,
    state: RwLock<LinkState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reconnect_attempts: AtomicU64,
}

impl UpstreamLink {
    pub fn new(
        host: String,
        port: u16,
        wallet: String,
        password: String,
        user_agent: String,
    ) -> Self {
        Self::with_reconnect_delay(host, port, wallet, password, user_agent, RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay(
        host: String,
        port: u16,
        wallet: String,
        password: String,
        user_agent: String,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            host,
            port,
            wallet,
            password,
            user_agent,
            reconnect_delay,
            state: RwLock::new(LinkState::Disconnected),
            writer: Mutex::new(None),
            reconnect_attempts: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    pub async fn is_ready(&self) -> bool {
        *self.state.read().await == LinkState::Ready
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) async fn set_state(&self, state: LinkState) {
        *self.state.write().await = state;
    }

    /// Write one request frame to the pool. With no connection the frame
    /// is dropped with a warning; callers gate on is_ready() first.
    pub async fn send(&self, request: &StratumRequest) {
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize {} request: {}", request.method, e);
                return;
            }
        };
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                if let Err(e) = w.write_all(&line).await {
                    warn!("upstream write failed ({}), dropping frame", e);
                }
            }
            None => {
                warn!("no upstream connection, dropping {} frame", request.method);
            }
        }
    }

    /// Connection lifecycle loop. Runs until the process exits; every
    /// failure path ends in a fixed sleep and a fresh attempt.
    pub async fn run(self: Arc<Self>, router: Arc<ShareRouter>) {
        loop {
            *self.state.write().await = LinkState::Connecting;
            info!("connecting to pool {}:{}", self.host, self.port);

            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    *self.state.write().await = LinkState::Authenticating;
                    metrics::set_upstream_up(true);

                    self.send(&StratumRequest::subscribe(&self.user_agent)).await;
                    self.send(&StratumRequest::authorize(&self.wallet, &self.password))
                        .await;

                    self.read_session(read_half, &router).await;
                    info!("pool connection closed");
                }
                Err(e) => {
                    warn!("pool connection failed: {}", e);
                }
            }

            *self.writer.lock().await = None;
            *self.state.write().await = LinkState::Disconnected;
            metrics::set_upstream_up(false);
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            metrics::inc_upstream_reconnects();

            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Pump the read half through the framer until EOF or a read error.
    /// Partial frames left in the buffer on disconnect are discarded
    /// with the framer.
    async fn read_session(&self, mut read_half: OwnedReadHalf, router: &ShareRouter) {
        let mut framer = LineFramer::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        if self.handle_handshake_reply(&line).await {
                            continue;
                        }
                        router.handle_upstream_line(&line).await;
                    }
                }
                Err(e) => {
                    warn!("upstream read error: {}", e);
                    return;
                }
            }
        }
    }

    /// Consume subscribe/authorize replies during the handshake phase.
    /// Returns true if the line was a handshake reply this link owns;
    /// everything else (and everything after Ready) goes to the router.
    async fn handle_handshake_reply(&self, line: &str) -> bool {
        if *self.state.read().await != LinkState::Authenticating {
            return false;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(line) else {
            return false;
        };
        if parsed.get("method").is_some() {
            return false;
        }
        match parsed.get("id").and_then(|i| i.as_u64()) {
            Some(SUBSCRIBE_ID) => {
                debug!("pool acknowledged subscribe");
                true
            }
            Some(AUTHORIZE_ID) => {
                let error = parsed.get("error").cloned().unwrap_or(Value::Null);
                let denied = !error.is_null()
                    || parsed.get("result") == Some(&Value::Bool(false));
                if denied {
                    warn!("pool rejected authorization: {}", error);
                } else {
                    info!("authorized with pool as {}", self.wallet);
                    *self.state.write().await = LinkState::Ready;
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobBroadcaster;
    use crate::session::SessionRegistry;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn test_router(upstream: Arc<UpstreamLink>) -> Arc<ShareRouter> {
        let registry = Arc::new(SessionRegistry::new());
        let jobs = Arc::new(JobBroadcaster::new(registry.clone(), "cwm_power2B".into()));
        Arc::new(ShareRouter::new(registry, jobs, upstream, "W".into()))
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let link = Arc::new(UpstreamLink::new(
            "127.0.0.1".into(),
            1,
            "W".into(),
            "x".into(),
            "ua".into(),
        ));
        link.set_state(LinkState::Authenticating).await;

        assert!(
            link.handle_handshake_reply(r#"{"id":1,"result":[[],"ab",4],"error":null}"#)
                .await
        );
        assert_eq!(link.state().await, LinkState::Authenticating);

        assert!(
            link.handle_handshake_reply(r#"{"id":2,"result":true,"error":null}"#)
                .await
        );
        assert_eq!(link.state().await, LinkState::Ready);
    }

    #[tokio::test]
    async fn test_denied_authorization_stays_unready() {
        let link = Arc::new(UpstreamLink::new(
            "127.0.0.1".into(),
            1,
            "W".into(),
            "x".into(),
            "ua".into(),
        ));
        link.set_state(LinkState::Authenticating).await;

        assert!(
            link.handle_handshake_reply(r#"{"id":2,"result":false,"error":null}"#)
                .await
        );
        assert_eq!(link.state().await, LinkState::Authenticating);
    }

    #[tokio::test]
    async fn test_after_ready_replies_fall_through() {
        let link = Arc::new(UpstreamLink::new(
            "127.0.0.1".into(),
            1,
            "W".into(),
            "x".into(),
            "ua".into(),
        ));
        link.set_state(LinkState::Ready).await;
        // A reply with id 1 after the handshake belongs to the router.
        assert!(
            !link
                .handle_handshake_reply(r#"{"id":1,"result":true,"error":null}"#)
                .await
        );
    }

    #[tokio::test]
    async fn test_send_without_connection_drops_frame() {
        let link = UpstreamLink::new("127.0.0.1".into(), 1, "W".into(), "x".into(), "ua".into());
        // Must not panic or block.
        link.send(&StratumRequest::subscribe("ua")).await;
    }

    #[tokio::test]
    async fn test_reconnects_after_pool_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let link = Arc::new(UpstreamLink::with_reconnect_delay(
            addr.ip().to_string(),
            addr.port(),
            "W".into(),
            "x".into(),
            "ua".into(),
            Duration::from_millis(200),
        ));
        let router = test_router(link.clone());
        tokio::spawn(link.clone().run(router));

        // First connection: take the handshake, then drop the socket.
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
        sock.write_all(b"{\"id\":1,\"result\":[[],\"ab\",4],\"error\":null}\n")
            .await
            .unwrap();
        sock.write_all(b"{\"id\":2,\"result\":true,\"error\":null}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(link.is_ready().await);
        drop(sock);

        // The loop must come back on its own after the fixed delay.
        let (second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no reconnect within 2s")
            .unwrap();
        assert_eq!(link.reconnect_attempts(), 1);
        drop(second);
    }
}
