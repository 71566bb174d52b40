//! Configuration
//!
//! Everything is optional in the JSON form; missing fields take their
//! defaults, so `{}` is a valid config.

use crate::kernel::clock::TimeControl;
use crate::kernel::trace::TraceCategory;
use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The text is not valid config JSON
    Parse(String),
    /// A value is out of range
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid { field, reason } => write!(f, "invalid {}: {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Task slots, the main task included
    pub capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { capacity: 16 }
    }
}

/// Per-session engine behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ponder on the expected reply while the user thinks
    pub permanent_brain: bool,
    /// Start thinking as soon as the user has moved
    pub auto_reply: bool,
    /// Resign when the engine's score drops to minus this many centipawns
    /// (0 never resigns)
    pub resign_threshold: i32,
    /// Accept a draw offer when the score is at or below this
    pub draw_threshold: i32,
    pub time_control: TimeControl,
    /// On a fallen flag, reset the clock instead of ending the game
    pub timeout_continue: bool,
    /// Transposition table size per engine
    pub hash_mb: usize,
    /// Memory available for all transposition tables together
    pub hash_budget_mb: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            permanent_brain: true,
            auto_reply: true,
            resign_threshold: 900,
            draw_threshold: 0,
            time_control: TimeControl::default(),
            timeout_continue: false,
            hash_mb: 16,
            hash_budget_mb: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineMatchConfig {
    pub games: u32,
    /// Swap colours after every game
    pub alternate_colors: bool,
}

impl Default for EngineMatchConfig {
    fn default() -> Self {
        Self {
            games: 10,
            alternate_colors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Only record these categories (all when absent)
    pub categories: Option<Vec<TraceCategory>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub engine_match: EngineMatchConfig,
    pub trace: TraceConfig,
}

impl Config {
    /// Parse and validate a JSON config
    pub fn from_json(text: &str) -> ConfigResult<Config> {
        let config: Config = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        // The main task plus at least one search driver
        if self.scheduler.capacity < 2 {
            return Err(ConfigError::Invalid {
                field: "scheduler.capacity",
                reason: format!("{} is below the minimum of 2", self.scheduler.capacity),
            });
        }
        if !self.session.time_control.is_valid() {
            return Err(ConfigError::Invalid {
                field: "session.time_control",
                reason: "durations must be positive".to_string(),
            });
        }
        if self.session.resign_threshold < 0 {
            return Err(ConfigError::Invalid {
                field: "session.resign_threshold",
                reason: "must not be negative".to_string(),
            });
        }
        if self.session.hash_mb > self.session.hash_budget_mb {
            return Err(ConfigError::Invalid {
                field: "session.hash_mb",
                reason: format!(
                    "{} MB does not fit the {} MB budget",
                    self.session.hash_mb, self.session.hash_budget_mb
                ),
            });
        }
        if self.engine_match.games == 0 {
            return Err(ConfigError::Invalid {
                field: "engine_match.games",
                reason: "a match needs at least one game".to_string(),
            });
        }
        Ok(())
    }

    /// Apply the trace section to the thread's tracer
    pub fn apply_trace(&self) {
        crate::kernel::trace::with_tracer(|tracer| {
            if self.trace.enabled {
                tracer.enable();
            } else {
                tracer.disable();
            }
            tracer.set_filter(self.trace.categories.clone());
        });
    }
}
