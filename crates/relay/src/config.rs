// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Log filter directive (e.g. `info`, `quillsync_relay=debug`).
    pub log_filter: String,
    /// Liveness monitor sweep interval, seconds.
    pub sweep_interval_secs: u64,
    /// Idle time before a participant is evicted from its rooms, seconds.
    pub participant_timeout_secs: u64,
}

const DEV_JWT_SECRET: &str = "quillsync_local_development_jwt_secret_32_chars";

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `QUILLSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `QUILLSYNC_RELAY_PORT` | `8080` |
    /// | `QUILLSYNC_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `QUILLSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `QUILLSYNC_RELAY_SWEEP_INTERVAL_SECS` | `60` |
    /// | `QUILLSYNC_RELAY_PARTICIPANT_TIMEOUT_SECS` | `300` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("QUILLSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("QUILLSYNC_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("QUILLSYNC_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let log_filter = env("QUILLSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let sweep_interval_secs = env("QUILLSYNC_RELAY_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let participant_timeout_secs = env("QUILLSYNC_RELAY_PARTICIPANT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Self {
            listen_addr,
            jwt_secret,
            log_filter,
            sweep_interval_secs,
            participant_timeout_secs,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn participant_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.participant_timeout_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.sweep_interval_secs, 60);
        assert_eq!(cfg.participant_timeout_secs, 300);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("QUILLSYNC_RELAY_HOST", "127.0.0.1");
        m.insert("QUILLSYNC_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("QUILLSYNC_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("QUILLSYNC_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn liveness_knobs_from_env() {
        let mut m = HashMap::new();
        m.insert("QUILLSYNC_RELAY_SWEEP_INTERVAL_SECS", "5");
        m.insert("QUILLSYNC_RELAY_PARTICIPANT_TIMEOUT_SECS", "30");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.sweep_interval(), std::time::Duration::from_secs(5));
        assert_eq!(cfg.participant_timeout(), chrono::Duration::seconds(30));
    }
}
