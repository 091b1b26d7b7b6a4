/// Tidepool bridge: multiplexes browser WebSocket miners onto one
/// upstream Stratum pool connection.

pub mod config;
pub mod framing;
pub mod jobs;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod upstream;
