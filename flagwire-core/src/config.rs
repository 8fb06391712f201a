//! Registry configuration.
//!
//! Bounds on provider lifecycle operations and the evaluation timeout used
//! when an invocation sets none.
//!
//! ## Example
//!
//! ```rust
//! use flagwire_core::RegistryConfig;
//!
//! let config = RegistryConfig::new()
//!     .default_timeout_ms(250)        // every evaluation races a 250ms timer
//!     .initialization_timeout(10)     // give providers 10 seconds to initialize
//!     .close_timeout_ms(500);
//! ```

use crate::error::{FlagwireError, Result};
use std::time::Duration;

/// Evaluation timeout variable, in milliseconds.
pub const ENV_EVALUATION_TIMEOUT_MS: &str = "FLAGWIRE_EVALUATION_TIMEOUT_MS";
/// Provider initialization timeout variable, in milliseconds.
pub const ENV_INIT_TIMEOUT_MS: &str = "FLAGWIRE_INIT_TIMEOUT_MS";
/// Provider shutdown timeout variable, in milliseconds.
pub const ENV_CLOSE_TIMEOUT_MS: &str = "FLAGWIRE_CLOSE_TIMEOUT_MS";

/// Configuration for a [`FlagRegistry`](crate::FlagRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Applied to evaluations whose options set no timeout.
    pub default_timeout: Option<Duration>,
    /// Upper bound on a provider's `initialize`.
    pub initialization_timeout: Option<Duration>,
    /// Upper bound on each provider's `on_close`.
    pub close_timeout: Duration,
    /// Evaluations against a `FATAL` provider fail without calling it.
    pub fatal_short_circuit: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            initialization_timeout: None,
            close_timeout: Duration::from_secs(5),
            fatal_short_circuit: true,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `FLAGWIRE_*_TIMEOUT_MS` variables.
    ///
    /// A variable that is set but not a number of milliseconds is an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = read_ms(ENV_EVALUATION_TIMEOUT_MS)? {
            config.default_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = read_ms(ENV_INIT_TIMEOUT_MS)? {
            config.initialization_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = read_ms(ENV_CLOSE_TIMEOUT_MS)? {
            config.close_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    /// Sets the default evaluation timeout in milliseconds.
    pub fn default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout = Some(Duration::from_millis(ms));
        self
    }

    /// Sets the default evaluation timeout from a Duration.
    pub fn default_timeout_duration(mut self, duration: Duration) -> Self {
        self.default_timeout = Some(duration);
        self
    }

    /// Sets the initialization timeout in seconds.
    pub fn initialization_timeout(mut self, seconds: u64) -> Self {
        self.initialization_timeout = Some(Duration::from_secs(seconds));
        self
    }

    /// Sets the initialization timeout in milliseconds.
    pub fn initialization_timeout_ms(mut self, ms: u64) -> Self {
        self.initialization_timeout = Some(Duration::from_millis(ms));
        self
    }

    /// Sets the shutdown timeout in milliseconds.
    pub fn close_timeout_ms(mut self, ms: u64) -> Self {
        self.close_timeout = Duration::from_millis(ms);
        self
    }

    pub fn fatal_short_circuit(mut self, enabled: bool) -> Self {
        self.fatal_short_circuit = enabled;
        self
    }
}

fn read_ms(var: &str) -> Result<Option<u64>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| FlagwireError::Config(format!("{} must be milliseconds, got '{}'", var, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.default_timeout, None);
        assert_eq!(config.initialization_timeout, None);
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert!(config.fatal_short_circuit);
    }

    #[test]
    fn test_builder() {
        let config = RegistryConfig::new()
            .default_timeout_ms(50)
            .initialization_timeout(2)
            .close_timeout_ms(100)
            .fatal_short_circuit(false);

        assert_eq!(config.default_timeout, Some(Duration::from_millis(50)));
        assert_eq!(config.initialization_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.close_timeout, Duration::from_millis(100));
        assert!(!config.fatal_short_circuit);
    }

    #[test]
    fn test_from_env() {
        // SAFETY: no other test reads or writes these variables.
        unsafe {
            std::env::set_var(ENV_EVALUATION_TIMEOUT_MS, "75");
            std::env::set_var(ENV_CLOSE_TIMEOUT_MS, "soon");
        }

        let err = RegistryConfig::from_env().unwrap_err();
        assert!(matches!(err, FlagwireError::Config(_)));

        unsafe {
            std::env::remove_var(ENV_CLOSE_TIMEOUT_MS);
        }
        let config = RegistryConfig::from_env().unwrap();
        assert_eq!(config.default_timeout, Some(Duration::from_millis(75)));

        unsafe {
            std::env::remove_var(ENV_EVALUATION_TIMEOUT_MS);
        }
    }
}
