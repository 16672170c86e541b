//! Tracer configuration.
//!
//! Two knobs govern every trace: the record budget (how many records one
//! trace instance may retain) and the default minimum trace duration (traces
//! shorter than this are discarded). Both live in a [`TracerSettings`] block
//! of atomics; builders read it when a trace begins, so changes apply to
//! traces begun afterwards and never to a trace already in flight.
//!
//! # Configuration Precedence
//!
//! Each layer overwrites the values the previous one set, so later layers win:
//!
//! 1. **Defaults**: [`TracerConfig::default()`]
//! 2. **Config file**: a TOML file (requires the `config-file` feature)
//! 3. **Environment variables**: `CALLTRACE_*` variables, applied by
//!    [`TracerConfig::from_env`] and [`TracerConfig::load`]
//! 4. **Programmatic**: `with_*` calls made on the resulting config
//!
//! The `with_*` setters only win when called after the environment has been
//! applied; [`TracerConfig::apply_env_overrides`] overwrites whatever they set
//! before it.
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `CALLTRACE_MAX_TRACE_RECORDS` | `usize` | `max_trace_records` |
//! | `CALLTRACE_MIN_TRACE_TIME_MS` | `u64` | `min_trace_time` |

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Default record budget per trace instance.
pub const DEFAULT_MAX_TRACE_RECORDS: usize = 4096;
/// Default minimum trace duration.
pub const DEFAULT_MIN_TRACE_TIME: Duration = Duration::from_millis(50);

/// Environment variable name for the per-trace record budget.
pub const ENV_MAX_TRACE_RECORDS: &str = "CALLTRACE_MAX_TRACE_RECORDS";
/// Environment variable name for the minimum trace duration in milliseconds.
pub const ENV_MIN_TRACE_TIME_MS: &str = "CALLTRACE_MIN_TRACE_TIME_MS";

/// Errors raised while building a [`TracerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting was present but could not be used.
    #[error("invalid value for {key}: {reason}, got {value:?}")]
    InvalidValue {
        /// Variable or TOML key that carried the value.
        key: String,
        /// The offending raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse TOML config: {0}")]
    Parse(String),
}

/// Plain-data tracer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerConfig {
    /// Maximum records retained per trace instance, root included.
    pub max_trace_records: usize,
    /// Traces shorter than this are discarded; children shorter than this
    /// are folded into their parent.
    pub min_trace_time: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_trace_records: DEFAULT_MAX_TRACE_RECORDS,
            min_trace_time: DEFAULT_MIN_TRACE_TIME,
        }
    }
}

impl TracerConfig {
    /// Sets the per-trace record budget.
    #[must_use]
    pub const fn with_max_trace_records(mut self, records: usize) -> Self {
        self.max_trace_records = records;
        self
    }

    /// Sets the default minimum trace duration.
    #[must_use]
    pub const fn with_min_trace_time(mut self, time: Duration) -> Self {
        self.min_trace_time = time;
        self
    }

    /// Checks the configuration for values the builder cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_trace_records == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_trace_records".to_string(),
                value: "0".to_string(),
                reason: "a trace must be able to retain at least its root".to_string(),
            });
        }
        Ok(())
    }

    /// Builds a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `CALLTRACE_*` environment variables that are set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`, which maps a variable name to
    /// its value when set.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_MAX_TRACE_RECORDS) {
            self.max_trace_records = parse_usize(ENV_MAX_TRACE_RECORDS, &val)?;
        }
        if let Some(val) = lookup(ENV_MIN_TRACE_TIME_MS) {
            self.min_trace_time = Duration::from_millis(parse_u64(ENV_MIN_TRACE_TIME_MS, &val)?);
        }
        self.validate()
    }
}

fn parse_usize(key: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|e| invalid(key, val, format!("expected unsigned integer ({e})")))
}

fn parse_u64(key: &str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|e| invalid(key, val, format!("expected milliseconds ({e})")))
}

fn invalid(key: &str, val: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: val.to_string(),
        reason,
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable tracer configuration.
///
/// ```toml
/// [tracer]
/// max_trace_records = 4096
/// min_trace_time_ms = 50
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct TracerTomlConfig {
    /// Tracer settings.
    #[serde(default)]
    pub tracer: TracerToml,
}

/// Tracer section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct TracerToml {
    /// Record budget per trace instance.
    pub max_trace_records: Option<usize>,
    /// Minimum trace duration in milliseconds.
    pub min_trace_time_ms: Option<u64>,
}

#[cfg(feature = "config-file")]
impl TracerConfig {
    /// Applies the fields present in a parsed TOML config.
    pub fn apply_toml(&mut self, toml: &TracerTomlConfig) -> Result<(), ConfigError> {
        if let Some(v) = toml.tracer.max_trace_records {
            self.max_trace_records = v;
        }
        if let Some(v) = toml.tracer.min_trace_time_ms {
            self.min_trace_time = Duration::from_millis(v);
        }
        self.validate()
    }

    /// Parses a TOML string on top of the defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let parsed: TracerTomlConfig =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();
        config.apply_toml(&parsed)?;
        Ok(config)
    }

    /// Reads a TOML file, then applies environment overrides on top.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }
}

// =========================================================================
// Live settings
// =========================================================================

const fn duration_nanos(duration: Duration) -> u64 {
    let nanos = duration.as_nanos();
    if nanos > u64::MAX as u128 {
        u64::MAX
    } else {
        nanos as u64
    }
}

static GLOBAL_SETTINGS: TracerSettings = TracerSettings::new(TracerConfig {
    max_trace_records: DEFAULT_MAX_TRACE_RECORDS,
    min_trace_time: DEFAULT_MIN_TRACE_TIME,
});

/// Live, shareable tracer settings.
///
/// The process-wide instance is [`TracerSettings::global`]; builders that
/// need isolation (tests, embedded tracers) can own a private instance.
#[derive(Debug)]
pub struct TracerSettings {
    max_trace_records: AtomicUsize,
    min_trace_time_nanos: AtomicU64,
}

impl TracerSettings {
    /// Creates a settings block from a configuration.
    #[must_use]
    pub const fn new(config: TracerConfig) -> Self {
        let records = if config.max_trace_records == 0 {
            1
        } else {
            config.max_trace_records
        };
        Self {
            max_trace_records: AtomicUsize::new(records),
            min_trace_time_nanos: AtomicU64::new(duration_nanos(config.min_trace_time)),
        }
    }

    /// Returns the process-wide settings.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_SETTINGS
    }

    /// Returns the record budget applied to traces begun from now on.
    #[must_use]
    pub fn max_trace_records(&self) -> usize {
        self.max_trace_records.load(Ordering::Relaxed)
    }

    /// Sets the record budget. A budget of zero is raised to one (the root).
    pub fn set_max_trace_records(&self, records: usize) {
        self.max_trace_records
            .store(records.max(1), Ordering::Relaxed);
    }

    /// Returns the default minimum trace duration.
    #[must_use]
    pub fn min_trace_time(&self) -> Duration {
        Duration::from_nanos(self.min_trace_time_nanos.load(Ordering::Relaxed))
    }

    /// Sets the default minimum trace duration.
    pub fn set_min_trace_time(&self, time: Duration) {
        self.min_trace_time_nanos
            .store(duration_nanos(time), Ordering::Relaxed);
    }

    /// Replaces both settings.
    pub fn apply(&self, config: &TracerConfig) {
        self.set_max_trace_records(config.max_trace_records);
        self.set_min_trace_time(config.min_trace_time);
    }

    /// Returns the current settings as plain data.
    #[must_use]
    pub fn snapshot(&self) -> TracerConfig {
        TracerConfig {
            max_trace_records: self.max_trace_records(),
            min_trace_time: self.min_trace_time(),
        }
    }
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self::new(TracerConfig::default())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = TracerConfig::default();
        assert_eq!(config.max_trace_records, DEFAULT_MAX_TRACE_RECORDS);
        assert_eq!(config.min_trace_time, DEFAULT_MIN_TRACE_TIME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_apply_when_set() {
        let mut config = TracerConfig::default();
        config
            .apply_overrides_from(lookup_from(&[
                (ENV_MAX_TRACE_RECORDS, " 128 "),
                (ENV_MIN_TRACE_TIME_MS, "5"),
            ]))
            .unwrap();
        assert_eq!(config.max_trace_records, 128);
        assert_eq!(config.min_trace_time, Duration::from_millis(5));
    }

    #[test]
    fn unset_overrides_leave_config_alone() {
        let mut config = TracerConfig::default().with_max_trace_records(7);
        config.apply_overrides_from(lookup_from(&[])).unwrap();
        assert_eq!(config.max_trace_records, 7);
    }

    #[test]
    fn layers_apply_in_order() {
        let vars = [(ENV_MAX_TRACE_RECORDS, "64"), (ENV_MIN_TRACE_TIME_MS, "8")];
        let env = lookup_from(&vars);

        let mut config = TracerConfig::default().with_max_trace_records(7);
        config.apply_overrides_from(&env).unwrap();
        assert_eq!(config.max_trace_records, 64);

        let config = config.with_max_trace_records(7);
        assert_eq!(config.max_trace_records, 7);
        assert_eq!(config.min_trace_time, Duration::from_millis(8));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn environment_overrides_file_values() {
        let mut config =
            TracerConfig::from_toml_str("[tracer]\nmax_trace_records = 16\nmin_trace_time_ms = 2\n")
                .unwrap();
        config
            .apply_overrides_from(lookup_from(&[(ENV_MIN_TRACE_TIME_MS, "9")]))
            .unwrap();
        assert_eq!(config.max_trace_records, 16);
        assert_eq!(config.min_trace_time, Duration::from_millis(9));
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut config = TracerConfig::default();
        let err = config
            .apply_overrides_from(lookup_from(&[(ENV_MAX_TRACE_RECORDS, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains(ENV_MAX_TRACE_RECORDS));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut config = TracerConfig::default();
        assert!(
            config
                .apply_overrides_from(lookup_from(&[(ENV_MIN_TRACE_TIME_MS, "-1")]))
                .is_err()
        );
    }

    #[test]
    fn zero_budget_is_rejected() {
        let config = TracerConfig::default().with_max_trace_records(0);
        assert!(config.validate().is_err());

        let mut config = TracerConfig::default();
        assert!(
            config
                .apply_overrides_from(lookup_from(&[(ENV_MAX_TRACE_RECORDS, "0")]))
                .is_err()
        );
    }

    #[test]
    fn settings_round_trip_config() {
        let settings = TracerSettings::default();
        let config = TracerConfig::default()
            .with_max_trace_records(3)
            .with_min_trace_time(Duration::ZERO);
        settings.apply(&config);
        assert_eq!(settings.snapshot(), config);
    }

    #[test]
    fn settings_clamp_zero_budget() {
        let settings = TracerSettings::new(TracerConfig::default().with_max_trace_records(0));
        assert_eq!(settings.max_trace_records(), 1);
        settings.set_max_trace_records(0);
        assert_eq!(settings.max_trace_records(), 1);
    }

    #[test]
    fn global_settings_start_at_defaults() {
        let global = TracerSettings::global().snapshot();
        assert!(global.max_trace_records >= 1);
        assert!(std::ptr::eq(TracerSettings::global(), TracerSettings::global()));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_overrides_defaults() {
        let config = TracerConfig::from_toml_str(
            r"
            [tracer]
            max_trace_records = 16
            min_trace_time_ms = 2
            ",
        )
        .unwrap();
        assert_eq!(config.max_trace_records, 16);
        assert_eq!(config.min_trace_time, Duration::from_millis(2));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_partial_and_empty() {
        let config = TracerConfig::from_toml_str("").unwrap();
        assert_eq!(config, TracerConfig::default());

        let config = TracerConfig::from_toml_str("[tracer]\nmax_trace_records = 9\n").unwrap();
        assert_eq!(config.max_trace_records, 9);
        assert_eq!(config.min_trace_time, DEFAULT_MIN_TRACE_TIME);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_garbage_is_a_parse_error() {
        let err = TracerConfig::from_toml_str("[tracer\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
