//! Session layer configuration
//!
//! Timer bases, the advertised method list and defaults applied to every
//! session on a socket. Values can be built in code with the `with_*`
//! methods or loaded from YAML.
//!
//! ```rust
//! use rvoip_sipsess::config::SessionConfig;
//! use rvoip_sipsess::Rel100Mode;
//!
//! let config = SessionConfig::default()
//!     .with_local_domain("pbx.example.com")
//!     .with_rel100(Rel100Mode::Supported)
//!     .with_user_agent("rvoip-sipsess");
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SessionError, SessionResult};
use crate::rel100::Rel100Mode;

/// Configuration shared by all sessions of a socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// RFC 3261 T1 (RTT estimate) in milliseconds
    pub t1_ms: u64,
    /// RFC 3261 T2 (retransmit cap) in milliseconds
    pub t2_ms: u64,
    /// Transaction lifetime as a multiple of T1
    pub timeout_multiplier: u32,
    /// Server/User-Agent header value
    pub user_agent: Option<String>,
    /// Host used to complete Contact users given without a URI
    pub local_domain: String,
    /// 100rel policy for sessions that do not set their own
    pub rel100: Rel100Mode,
    /// Methods advertised in Allow
    pub allow: Vec<String>,
    /// Glare retry window for the dialog owner (RFC 3261 §14.1)
    pub glare_owner_min_ms: u64,
    pub glare_owner_max_ms: u64,
    /// Glare retry window for the non-owner
    pub glare_peer_max_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            timeout_multiplier: 64,
            user_agent: None,
            local_domain: "localhost".to_string(),
            rel100: Rel100Mode::Disabled,
            allow: ["INVITE", "ACK", "BYE", "CANCEL", "PRACK", "UPDATE", "INFO", "REFER"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            glare_owner_min_ms: 2100,
            glare_owner_max_ms: 4000,
            glare_peer_max_ms: 2000,
        }
    }
}

impl SessionConfig {
    /// Load and validate a configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> SessionResult<Self> {
        let config: SessionConfig =
            serde_yaml::from_str(yaml).map_err(|e| SessionError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_timers(mut self, t1: Duration, t2: Duration) -> Self {
        self.t1_ms = t1.as_millis() as u64;
        self.t2_ms = t2.as_millis() as u64;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_local_domain(mut self, domain: impl Into<String>) -> Self {
        self.local_domain = domain.into();
        self
    }

    pub fn with_rel100(mut self, mode: Rel100Mode) -> Self {
        self.rel100 = mode;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> SessionResult<()> {
        if self.t1_ms == 0 {
            return Err(SessionError::config("t1_ms must be positive"));
        }
        if self.t2_ms < self.t1_ms {
            return Err(SessionError::config("t2_ms must not be below t1_ms"));
        }
        if self.timeout_multiplier == 0 {
            return Err(SessionError::config("timeout_multiplier must be positive"));
        }
        if self.local_domain.is_empty() {
            return Err(SessionError::config("local_domain must not be empty"));
        }
        if self.glare_owner_min_ms > self.glare_owner_max_ms {
            return Err(SessionError::config("glare owner window is inverted"));
        }
        Ok(())
    }

    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    /// Lifetime of a transaction (64×T1 by default)
    pub fn transaction_timeout(&self) -> Duration {
        self.t1() * self.timeout_multiplier
    }

    /// Allow header value
    pub fn allow_header(&self) -> String {
        self.allow.join(", ")
    }

    /// Random glare back-off for the owner or non-owner of the dialog
    pub fn glare_delay(&self, owner: bool) -> Duration {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let ms = if owner {
            rng.gen_range(self.glare_owner_min_ms..=self.glare_owner_max_ms)
        } else {
            rng.gen_range(0..=self.glare_peer_max_ms)
        };
        Duration::from_millis(ms)
    }

    /// Contact header value for a local user or URI
    pub fn contact_for(&self, local_user: &str) -> String {
        if local_user.starts_with('<') {
            local_user.to_string()
        } else if local_user.contains(':') {
            format!("<{}>", local_user)
        } else {
            format!("<sip:{}@{}>", local_user, self.local_domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transaction_timeout(), Duration::from_secs(32));
        assert!(config.allow_header().contains("PRACK"));
    }

    #[test]
    fn test_yaml_loading() {
        let config = SessionConfig::from_yaml_str(
            "t1_ms: 100\nt2_ms: 800\nrel100: required\nlocal_domain: pbx.example.com\n",
        )
        .unwrap();
        assert_eq!(config.t1(), Duration::from_millis(100));
        assert_eq!(config.rel100, Rel100Mode::Required);
        // Unspecified fields keep their defaults
        assert_eq!(config.timeout_multiplier, 64);

        assert!(SessionConfig::from_yaml_str("t1_ms: 0\n").is_err());
        assert!(SessionConfig::from_yaml_str("t1_ms: [nonsense\n").is_err());
    }

    #[test]
    fn test_glare_windows() {
        let config = SessionConfig::default();
        for _ in 0..20 {
            let owner = config.glare_delay(true);
            assert!(owner >= Duration::from_millis(2100) && owner <= Duration::from_millis(4000));
            assert!(config.glare_delay(false) <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_contact_forms() {
        let config = SessionConfig::default().with_local_domain("example.com");
        assert_eq!(config.contact_for("bob"), "<sip:bob@example.com>");
        assert_eq!(config.contact_for("sip:bob@10.0.0.1"), "<sip:bob@10.0.0.1>");
        assert_eq!(config.contact_for("<sip:bob@h>"), "<sip:bob@h>");
    }
}
