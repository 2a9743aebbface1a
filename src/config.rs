use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::model::{DAY_MS, HOUR_MS, MINUTE_MS, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    OutOfRange { var: &'static str, reason: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::OutOfRange { var, reason } => write!(f, "{var}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Cadences and windows of the background sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub timeout_every: Duration,
    pub reminder_every: Duration,
    pub reminder_lookahead_ms: Ms,
    pub complete_every: Duration,
    pub completion_grace_ms: Ms,
    pub retention_every: Duration,
    pub retention_ms: Ms,
    /// Delete archived records from the store. Off: archive only.
    pub purge_archived: bool,
    pub stats_every: Duration,
    pub compact_every: Duration,
    pub compact_threshold: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            timeout_every: Duration::from_secs(60),
            reminder_every: Duration::from_secs(5 * 60),
            reminder_lookahead_ms: 24 * HOUR_MS,
            complete_every: Duration::from_secs(60 * 60),
            completion_grace_ms: 2 * HOUR_MS,
            retention_every: Duration::from_secs(24 * 60 * 60),
            retention_ms: 90 * DAY_MS,
            purge_archived: false,
            stats_every: Duration::from_secs(24 * 60 * 60),
            compact_every: Duration::from_secs(30),
            compact_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: Ms,
    pub anonymous: u32,
    pub authenticated: u32,
    pub public: u32,
    pub sensitive: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: MINUTE_MS,
            anonymous: 60,
            authenticated: 120,
            public: 30,
            sensitive: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub engine: EngineSettings,
    pub reconciler: ReconcilerConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            engine: EngineSettings::default(),
            reconciler: ReconcilerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Read `SLOTKEEPER_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source. Unset variables keep their
    /// defaults; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);
        let defaults = Config::default();
        let rd = ReconcilerConfig::default();
        let rl = RateLimitConfig::default();

        let config = Config {
            data_dir: vars
                .raw("SLOTKEEPER_DATA_DIR")
                .map_or(defaults.data_dir, PathBuf::from),
            metrics_port: vars.parse_opt("SLOTKEEPER_METRICS_PORT")?,
            engine: EngineSettings {
                reserve_max_attempts: vars.parse_or(
                    "SLOTKEEPER_RESERVE_ATTEMPTS",
                    defaults.engine.reserve_max_attempts,
                )?,
            },
            reconciler: ReconcilerConfig {
                timeout_every: vars.secs_or("SLOTKEEPER_TIMEOUT_SWEEP_SECS", rd.timeout_every)?,
                reminder_every: vars.secs_or("SLOTKEEPER_REMINDER_SWEEP_SECS", rd.reminder_every)?,
                reminder_lookahead_ms: vars.scaled_or("SLOTKEEPER_REMINDER_LOOKAHEAD_MINS", MINUTE_MS, rd.reminder_lookahead_ms)?,
                complete_every: vars.secs_or("SLOTKEEPER_COMPLETE_SWEEP_SECS", rd.complete_every)?,
                completion_grace_ms: vars.scaled_or("SLOTKEEPER_COMPLETION_GRACE_MINS", MINUTE_MS, rd.completion_grace_ms)?,
                retention_every: vars.secs_or("SLOTKEEPER_RETENTION_SWEEP_SECS", rd.retention_every)?,
                retention_ms: vars.scaled_or("SLOTKEEPER_RETENTION_DAYS", DAY_MS, rd.retention_ms)?,
                purge_archived: vars.parse_or("SLOTKEEPER_PURGE_ARCHIVED", rd.purge_archived)?,
                stats_every: vars.secs_or("SLOTKEEPER_STATS_SWEEP_SECS", rd.stats_every)?,
                compact_every: vars.secs_or("SLOTKEEPER_COMPACT_SWEEP_SECS", rd.compact_every)?,
                compact_threshold: vars.parse_or("SLOTKEEPER_COMPACT_THRESHOLD", rd.compact_threshold)?,
            },
            rate_limit: RateLimitConfig {
                enabled: vars.parse_or("SLOTKEEPER_RATE_LIMIT_ENABLED", rl.enabled)?,
                window_ms: vars.scaled_or("SLOTKEEPER_RATE_LIMIT_WINDOW_SECS", 1000, rl.window_ms)?,
                anonymous: vars.parse_or("SLOTKEEPER_RATE_LIMIT_ANONYMOUS", rl.anonymous)?,
                authenticated: vars.parse_or("SLOTKEEPER_RATE_LIMIT_AUTHENTICATED", rl.authenticated)?,
                public: vars.parse_or("SLOTKEEPER_RATE_LIMIT_PUBLIC", rl.public)?,
                sensitive: vars.parse_or("SLOTKEEPER_RATE_LIMIT_SENSITIVE", rl.sensitive)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reconciler;
        if self.engine.reserve_max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                var: "SLOTKEEPER_RESERVE_ATTEMPTS",
                reason: "at least one attempt is required",
            });
        }
        let cadences = [
            ("SLOTKEEPER_TIMEOUT_SWEEP_SECS", r.timeout_every),
            ("SLOTKEEPER_REMINDER_SWEEP_SECS", r.reminder_every),
            ("SLOTKEEPER_COMPLETE_SWEEP_SECS", r.complete_every),
            ("SLOTKEEPER_RETENTION_SWEEP_SECS", r.retention_every),
            ("SLOTKEEPER_STATS_SWEEP_SECS", r.stats_every),
            ("SLOTKEEPER_COMPACT_SWEEP_SECS", r.compact_every),
        ];
        for (var, every) in cadences {
            if every.is_zero() {
                return Err(ConfigError::OutOfRange {
                    var,
                    reason: "sweep interval must be positive",
                });
            }
        }
        if self.rate_limit.window_ms <= 0 {
            return Err(ConfigError::OutOfRange {
                var: "SLOTKEEPER_RATE_LIMIT_WINDOW_SECS",
                reason: "window must be positive",
            });
        }
        if r.reminder_lookahead_ms < 0 || r.completion_grace_ms < 0 || r.retention_ms < 0 {
            return Err(ConfigError::OutOfRange {
                var: "SLOTKEEPER_*",
                reason: "windows must not be negative",
            });
        }
        Ok(())
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse_opt<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match self.raw(var) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { var, value }),
        }
    }

    fn parse_or<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_opt(var)?.unwrap_or(default))
    }

    /// A count of `unit`-sized steps, converted to milliseconds.
    fn scaled_or(&self, var: &'static str, unit: Ms, default: Ms) -> Result<Ms, ConfigError> {
        match self.parse_opt::<Ms>(var)? {
            None => Ok(default),
            Some(n) => n.checked_mul(unit).ok_or(ConfigError::OutOfRange {
                var,
                reason: "value overflows a millisecond timestamp",
            }),
        }
    }

    fn secs_or(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(var)?
            .map_or(default, Duration::from_secs))
    }
}
