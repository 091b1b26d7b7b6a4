use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct CoinInfo {
    #[serde(default = "default_coin_name")]
    pub name: String,
    #[serde(default = "default_coin_symbol")]
    pub symbol: String,
    /// Display-only credit per accepted share, used by the leaderboard API.
    #[serde(default = "default_reward_per_share")]
    pub reward_per_share: f64,
}

impl Default for CoinInfo {
    fn default() -> Self {
        Self {
            name: default_coin_name(),
            symbol: default_coin_symbol(),
            reward_per_share: default_reward_per_share(),
        }
    }
}

fn default_coin_name() -> String { "T Coin".to_string() }
fn default_coin_symbol() -> String { "TC".to_string() }
fn default_reward_per_share() -> f64 { 0.125 }

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// One socket serves the WebSocket bridge, the stats API and /metrics.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upstream Stratum endpoint, "host:port".
    pub pool: String,
    /// Pool-account wallet. Used for mining.authorize AND every
    /// mining.submit — all downstream sessions share this identity.
    pub wallet: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_algo")]
    pub algo: String,
    #[serde(default)]
    pub coin: CoinInfo,
}

fn default_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_password() -> String { "x".to_string() }
fn default_user_agent() -> String { "tidepool-bridge/0.3".to_string() }
fn default_algo() -> String { "power2b".to_string() }

impl Config {
    /// Load from bridge_config.json (path overridable via BRIDGE_CONFIG),
    /// then apply env overrides. Any failure here is fatal: the process
    /// must refuse to start on a missing or unparsable config.
    pub fn load() -> Result<Self> {
        let path = std::env::var("BRIDGE_CONFIG")
            .unwrap_or_else(|_| "bridge_config.json".to_string());
        let txt = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file '{}'", path))?;
        let mut cfg = Self::from_json(&txt)
            .with_context(|| format!("failed to parse config file '{}'", path))?;

        if let Ok(port) = std::env::var("PORT") {
            cfg.listen = format!("0.0.0.0:{}", port);
        }
        if let Ok(listen) = std::env::var("BRIDGE_LISTEN") {
            cfg.listen = listen;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self> {
        Ok(serde_json::from_str(txt)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wallet.is_empty() {
            bail!("config: 'wallet' must not be empty");
        }
        self.pool_host_port()?;
        Ok(())
    }

    /// Split the pool endpoint into host and port, tolerating a
    /// stratum+tcp:// scheme prefix.
    pub fn pool_host_port(&self) -> Result<(String, u16)> {
        let clean = self
            .pool
            .trim_start_matches("stratum+tcp://")
            .trim_start_matches("stratum://");
        let (host, port) = clean
            .rsplit_once(':')
            .with_context(|| format!("config: pool '{}' is not host:port", self.pool))?;
        if host.is_empty() {
            bail!("config: pool '{}' has an empty host", self.pool);
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("config: pool '{}' has an invalid port", self.pool))?;
        Ok((host.to_string(), port))
    }
}
