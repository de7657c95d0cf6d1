//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Process-level configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Bind address for the conversion intake HTTP server.
    pub intake_bind: String,
    /// Salt for correlation-id derivation. Must stay stable across restarts
    /// or every user's correlation id changes and pending conversions orphan.
    pub correlation_salt: SecretString,
    /// Public base URL of the intake server, shown to tenant owners when
    /// they set up postbacks.
    pub public_url: Option<String>,
    /// Bot token for the onboarding (parent) bot. Without it tenants can
    /// only be created by hand in the database.
    pub parent_token: Option<String>,
    /// User id allowed to manage every tenant through the parent bot.
    pub superadmin_id: Option<i64>,
    /// Runtime tunables.
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("FUNNELBOT_DB_PATH")
            .unwrap_or_else(|_| "./data/funnelbot.db".to_string());

        let intake_bind =
            std::env::var("FUNNELBOT_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let correlation_salt = std::env::var("FUNNELBOT_CORRELATION_SALT").map_err(|_| {
            ConfigError::MissingRequired {
                key: "FUNNELBOT_CORRELATION_SALT".to_string(),
                hint: "export FUNNELBOT_CORRELATION_SALT=<random string>; changing it \
                       invalidates every issued correlation id"
                    .to_string(),
            }
        })?;

        let mut runtime = RuntimeConfig::default();
        if let Ok(raw) = std::env::var("FUNNELBOT_RECONCILE_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "FUNNELBOT_RECONCILE_SECS".to_string(),
                message: format!("not an integer: {raw}"),
            })?;
            runtime.reconcile_interval = Duration::from_secs(secs);
        }

        let public_url = std::env::var("FUNNELBOT_PUBLIC_URL")
            .ok()
            .map(|u| u.trim_end_matches('/').to_string());

        let parent_token = std::env::var("FUNNELBOT_PARENT_TOKEN").ok().filter(|t| !t.is_empty());

        let superadmin_id = match std::env::var("FUNNELBOT_SUPERADMIN_ID") {
            Err(_) => None,
            Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "FUNNELBOT_SUPERADMIN_ID".to_string(),
                message: format!("not a user id: {raw}"),
            })?),
        };

        Ok(Self {
            db_path,
            intake_bind,
            correlation_salt: SecretString::from(correlation_salt),
            public_url,
            parent_token,
            superadmin_id,
            runtime,
        })
    }
}

/// Runtime tunables with sensible defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Supervisor reconciliation interval.
    pub reconcile_interval: Duration,
    /// Long-poll timeout passed to getUpdates, in seconds.
    pub poll_timeout_secs: u64,
    /// Total render attempts before a delivery failure is given up on.
    pub render_attempts: u32,
    /// Backoff between render attempts.
    pub render_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            poll_timeout_secs: 30,
            render_attempts: 2,
            render_backoff: Duration::from_millis(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_defaults() {
        let rt = RuntimeConfig::default();
        assert_eq!(rt.render_attempts, 2);
        assert!(rt.reconcile_interval >= Duration::from_secs(1));
    }
}
