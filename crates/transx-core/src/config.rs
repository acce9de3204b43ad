//! Pool configuration, loadable from TOML.
//!
//! ```toml
//! min_size = 2
//! max_size = 20
//! blocking_timeout = "500ms"
//! idle_timeout = "15m"
//! partition = "by-subject"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}': expected e.g. \"500ms\", \"30s\", \"15m\" or \"1h\"")]
    InvalidDuration(String),

    #[error("invalid pool configuration: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How idle connections are grouped for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// One match-all pool.
    #[default]
    None,
    BySubject,
    ByRequestInfo,
    BySubjectAndRequestInfo,
}

/// Sizing, timeout and maintenance settings for one connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Maximum wait for a free slot when every connection is checked out.
    #[serde(with = "duration_str")]
    pub blocking_timeout: Duration,
    /// Idle connections unused for longer than this are evicted.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    pub background_validation: bool,
    #[serde(with = "duration_str")]
    pub validating_period: Duration,
    pub validate_on_match: bool,
    /// Bounded wait on a managed connection's exclusion lock; `None` waits forever.
    #[serde(with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub lock_timeout: Option<Duration>,
    pub partition: PartitionStrategy,
    /// Delay before a scheduled fill-to-minimum task runs.
    #[serde(with = "duration_str")]
    pub fill_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            blocking_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15 * 60),
            background_validation: false,
            validating_period: Duration::from_secs(10 * 60),
            validate_on_match: false,
            lock_timeout: None,
            partition: PartitionStrategy::None,
            fill_delay: Duration::from_millis(10),
        }
    }
}

impl PoolConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pool config {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("parsing pool config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("max_size must be greater than zero".into()));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::Invalid(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle_timeout must be non-zero".into()));
        }
        if self.validating_period.is_zero() {
            return Err(ConfigError::Invalid("validating_period must be non-zero".into()));
        }
        Ok(())
    }

    // Builder-style setters, handy in tests and embedders.

    pub fn with_sizes(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_partition(mut self, partition: PartitionStrategy) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_validate_on_match(mut self, enabled: bool) -> Self {
        self.validate_on_match = enabled;
        self
    }

    pub fn with_background_validation(mut self, period: Duration) -> Self {
        self.background_validation = true;
        self.validating_period = period;
        self
    }
}

/// Parse a duration such as `"500ms"`, `"30s"`, `"15m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let (digits, unit_ms): (&str, u64) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        return Err(invalid());
    };
    let n = digits.trim().parse::<u64>().map_err(|_| invalid())?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms != 0 && ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms != 0 && ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| super::parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}
