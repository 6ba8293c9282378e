//! Server configuration.

use std::time::Duration;

use crate::proxy::ProxySettings;
use crate::transaction::TimerSettings;

/// Everything the server reads at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Realm used in challenges and matched against user records.
    pub realm: String,
    /// Authority inserted into Via on forwarding.
    pub server_host: String,
    pub server_port: u16,
    /// Identifier stamped into originated responses.
    pub server_name: String,
    /// Lifetime of an issued nonce.
    pub nonce_ttl: Duration,
    /// Cadence of the nonce store cleaner.
    pub nonce_sweep_interval: Duration,
    /// Idle lifetime of a forking proxy context.
    pub proxy_context_ttl: Duration,
    /// Injected when a request arrives without Max-Forwards.
    pub max_forwards_default: i32,
    /// RFC3261 base timers.
    pub timers: TimerSettings,
    /// Datagram size above which UDP is promoted to TCP.
    pub udp_tcp_switchover_bytes: usize,
    /// Answer 421 to INVITEs without Session-Expires.
    pub require_session_timer: bool,
}

impl ServerConfig {
    /// The slice of the configuration the proxy engine consumes.
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            host: self.server_host.clone(),
            port: self.server_port,
            max_forwards_default: self.max_forwards_default,
            context_ttl: self.proxy_context_ttl,
            sweep_interval: Duration::from_secs(60),
            switchover_bytes: self.udp_tcp_switchover_bytes,
            require_session_timer: self.require_session_timer,
            server_name: self.server_name.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            realm: "example.com".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 5060,
            server_name: concat!("sipward/", env!("CARGO_PKG_VERSION")).to_string(),
            nonce_ttl: Duration::from_secs(300),
            nonce_sweep_interval: Duration::from_secs(60),
            proxy_context_ttl: Duration::from_secs(300),
            max_forwards_default: 70,
            timers: TimerSettings::default(),
            udp_tcp_switchover_bytes: 1300,
            require_session_timer: false,
        }
    }
}
