//! Collector configuration.
//!
//! All knobs are fixed at startup: call [`configure`] once before the
//! collector thread is spawned. Defaults suit an interactive interpreter.

use std::sync::OnceLock;
use std::time::Duration;

/// Tunables for the collector and its safepoint protocol.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Bytecode dispatches between safepoint polls in the interpreter.
    ///
    /// Lower values bound collector phase latency more tightly at a small
    /// dispatch-loop cost.
    ///
    /// Default: 128
    pub safepoint_interval: usize,

    /// How long the collector rests after a cycle that reclaimed
    /// nothing, instead of spinning on an idle heap.
    ///
    /// Default: 1ms
    pub idle_pause: Duration,

    /// Print a statistics summary when the collector observes the
    /// process winding down (currently: on demand via
    /// [`crate::stats::GcStats::print_summary`]).
    ///
    /// Default: false
    pub log_stats: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            safepoint_interval: 128,
            idle_pause: Duration::from_millis(1),
            log_stats: false,
        }
    }
}

impl GcConfig {
    /// Configuration biased toward prompt reclamation, for tests and
    /// memory-constrained embeddings.
    pub fn eager() -> Self {
        Self {
            safepoint_interval: 16,
            idle_pause: Duration::from_micros(100),
            ..Default::default()
        }
    }

    /// Configuration biased toward mutator throughput.
    pub fn throughput() -> Self {
        Self {
            safepoint_interval: 1024,
            idle_pause: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safepoint_interval == 0 {
            return Err(ConfigError::ZeroSafepointInterval);
        }
        if self.safepoint_interval > 1 << 20 {
            return Err(ConfigError::SafepointIntervalTooLarge);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The safepoint interval must be at least 1.
    ZeroSafepointInterval,
    /// Safepoint intervals beyond 2^20 dispatches starve the collector.
    SafepointIntervalTooLarge,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroSafepointInterval => {
                write!(f, "safepoint interval must be at least 1")
            }
            ConfigError::SafepointIntervalTooLarge => {
                write!(f, "safepoint interval must be at most 2^20")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

static CONFIG: OnceLock<GcConfig> = OnceLock::new();

/// Install the collector configuration.
///
/// Must be called before the collector thread is spawned or any mutator
/// enters; later calls are ignored (the first configuration wins).
pub fn configure(config: GcConfig) {
    config.validate().expect("invalid gc configuration");
    let _ = CONFIG.set(config);
}

/// The installed configuration, or the default.
pub fn config() -> &'static GcConfig {
    CONFIG.get_or_init(GcConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(GcConfig::eager().validate().is_ok());
        assert!(GcConfig::throughput().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = GcConfig {
            safepoint_interval: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroSafepointInterval));
    }

    #[test]
    fn test_huge_interval_rejected() {
        let config = GcConfig {
            safepoint_interval: 1 << 21,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SafepointIntervalTooLarge)
        );
    }
}
