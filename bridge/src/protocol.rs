/// Wire message types for both sides of the bridge
///
/// Upstream: newline-delimited JSON-RPC (Stratum v1).
/// Downstream: JSON objects `{id, method, params}` sent to browser miners;
/// outbound messages carry the method name in both fields, which is what
/// the web-miner clients dispatch on.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Fixed request id for mining.subscribe (sent once per connection).
pub const SUBSCRIBE_ID: u64 = 1;
/// Fixed request id for mining.authorize (sent once per connection).
pub const AUTHORIZE_ID: u64 = 2;

/// Map a configured algorithm key to the identifier the browser worker
/// loads. Unknown keys fall back to power2b.
pub fn algo_identifier(algo: &str) -> &'static str {
    match algo {
        "power2b" => "cwm_power2B",
        "yespower" => "cwm_yespower",
        "yespowerR16" => "cwm_yespowerR16",
        "yescrypt" => "cwm_yescrypt",
        "yescryptR8" => "cwm_yescryptR8",
        "yescryptR16" => "cwm_yescryptR16",
        "yescryptR32" => "cwm_yescryptR32",
        "minotaurx" => "cwm_minotaurx",
        "ghostrider" => "cwm_ghostrider",
        "yespowerTIDE" => "cwm_yespowerTIDE",
        "yespowerADVC" => "cwm_yespowerADVC",
        _ => "cwm_power2B",
    }
}

// ── Upstream (pool-facing) ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl StratumRequest {
    pub fn subscribe(user_agent: &str) -> Self {
        Self {
            id: SUBSCRIBE_ID,
            method: "mining.subscribe".to_string(),
            params: json!([user_agent]),
        }
    }

    pub fn authorize(wallet: &str, password: &str) -> Self {
        Self {
            id: AUTHORIZE_ID,
            method: "mining.authorize".to_string(),
            params: json!([wallet, password]),
        }
    }

    /// mining.submit under the pool account's credentials. All downstream
    /// sessions share the one upstream-authorized identity.
    pub fn submit(id: u64, wallet: &str, share: &ShareParams) -> Self {
        Self {
            id,
            method: "mining.submit".to_string(),
            params: json!([
                wallet,
                share.job_id,
                share.extranonce2,
                share.ntime,
                share.nonce,
            ]),
        }
    }

    /// Serialize as one newline-terminated frame.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Share fields a downstream miner supplies in `submit` params[0].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareParams {
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// The nine opaque fields of a mining.notify, kept verbatim for replay
/// to late-joining sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumJob {
    pub job_id: String,
    pub prevhash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

impl StratumJob {
    /// Parse the params array of a mining.notify. Returns None on a
    /// malformed notification (wrong arity or non-string fields).
    pub fn from_notify_params(params: &[Value]) -> Option<Self> {
        if params.len() < 9 {
            return None;
        }
        let text = |v: &Value| v.as_str().map(str::to_string);
        Some(Self {
            job_id: text(&params[0])?,
            prevhash: text(&params[1])?,
            coinbase1: text(&params[2])?,
            coinbase2: text(&params[3])?,
            merkle_branch: params[4]
                .as_array()?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            version: text(&params[5])?,
            nbits: text(&params[6])?,
            ntime: text(&params[7])?,
            clean_jobs: params[8].as_bool().unwrap_or(false),
        })
    }
}

// ── Downstream (browser-facing) ─────────────────────────────────────

/// Inbound message from a browser miner. Older web clients put the
/// method name in `id`; newer ones send a proper `method` field.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl ClientMessage {
    pub fn kind(&self) -> Option<&str> {
        self.method
            .as_deref()
            .or_else(|| self.id.as_ref().and_then(|v| v.as_str()))
    }
}

pub fn initialize_msg(algo: &str) -> Value {
    json!({"id": "initialize", "method": "initialize", "params": [algo]})
}

pub fn task_msg(job: &StratumJob) -> Value {
    json!({"id": "task", "method": "task", "params": [job]})
}

pub fn difficulty_msg(difficulty: f64) -> Value {
    json!({"id": "difficulty", "method": "difficulty", "params": [difficulty]})
}

pub fn success_msg(error: Value, result: Value) -> Value {
    json!({"id": "success", "method": "success", "params": [error, result]})
}

pub fn failed_msg(error: Value, result: Value) -> Value {
    json!({"id": "failed", "method": "failed", "params": [error, result]})
}
