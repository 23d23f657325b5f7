//! Client configuration, loaded from RON.
//!
//! ```ron
//! (
//!     toggle_guard_ms: 300,
//!     mutation_guard_ms: 10000,
//!     resubscribe_delay_ms: 500,
//! )
//! ```
//!
//! Every field is optional; missing fields take the defaults from
//! [`constants`](crate::constants).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{MUTATION_GUARD_TTL, RESUBSCRIBE_DELAY, TOGGLE_GUARD_TTL};

/// Tunables for the reconciliation engine and change-feed manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Lifetime of the echo guard armed by `toggle_done`.
    pub toggle_guard_ms: u64,
    /// Fallback expiry for guards released on confirmation.
    pub mutation_guard_ms: u64,
    /// Delay before resubscribing after a feed transport drop.
    pub resubscribe_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            toggle_guard_ms: TOGGLE_GUARD_TTL.as_millis() as u64,
            mutation_guard_ms: MUTATION_GUARD_TTL.as_millis() as u64,
            resubscribe_delay_ms: RESUBSCRIBE_DELAY.as_millis() as u64,
        }
    }
}

/// Errors that can occur when loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ClientConfig {
    /// Parse a RON document.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.toggle_guard_ms == 0 {
            return Err(ConfigError::Invalid("toggle_guard_ms must be positive".into()));
        }
        if self.mutation_guard_ms < self.toggle_guard_ms {
            return Err(ConfigError::Invalid(format!(
                "mutation_guard_ms ({}) must not be shorter than toggle_guard_ms ({})",
                self.mutation_guard_ms, self.toggle_guard_ms
            )));
        }
        Ok(())
    }

    pub fn toggle_guard_ttl(&self) -> Duration {
        Duration::from_millis(self.toggle_guard_ms)
    }

    pub fn mutation_guard_ttl(&self) -> Duration {
        Duration::from_millis(self.mutation_guard_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.toggle_guard_ttl(), TOGGLE_GUARD_TTL);
        assert_eq!(config.mutation_guard_ttl(), MUTATION_GUARD_TTL);
        assert_eq!(config.resubscribe_delay(), RESUBSCRIBE_DELAY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = ClientConfig::from_ron_str("(toggle_guard_ms: 250)").unwrap();
        assert_eq!(config.toggle_guard_ms, 250);
        assert_eq!(config.mutation_guard_ttl(), MUTATION_GUARD_TTL);
    }

    #[test]
    fn test_rejects_zero_toggle_guard() {
        let err = ClientConfig::from_ron_str("(toggle_guard_ms: 0)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_inverted_guards() {
        let err =
            ClientConfig::from_ron_str("(toggle_guard_ms: 900, mutation_guard_ms: 100)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_syntax() {
        let err = ClientConfig::from_ron_str("(toggle_guard_ms: ").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(resubscribe_delay_ms: 42)").unwrap();
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.resubscribe_delay(), Duration::from_millis(42));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ClientConfig::load("/definitely/not/here.ron").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
