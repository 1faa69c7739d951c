//! Agent configuration.
//!
//! Loaded from TOML with every field defaulted, and adjustable at runtime
//! through the `get` / `set` commands.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, CogentResult};

/// How several numeric-indifferent preferences for one candidate combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericIndifferentMode {
    #[default]
    Avg,
    Sum,
}

impl std::fmt::Display for NumericIndifferentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumericIndifferentMode::Avg => write!(f, "avg"),
            NumericIndifferentMode::Sum => write!(f, "sum"),
        }
    }
}

/// How one candidate is chosen from a set of mutually indifferent ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplorationPolicy {
    /// Boltzmann selection over numeric values (uniform when none are given).
    #[default]
    Softmax,
    /// Always the first candidate in proposal order.
    First,
}

impl std::fmt::Display for ExplorationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExplorationPolicy::Softmax => write!(f, "softmax"),
            ExplorationPolicy::First => write!(f, "first"),
        }
    }
}

/// Configuration for one [`Agent`](crate::agent::Agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Elaboration waves allowed per phase before moving on.
    #[serde(default = "default_max_elaborations")]
    pub max_elaborations: u32,
    /// Whether popped subgoals are compiled into chunks.
    #[serde(default)]
    pub learning: bool,
    #[serde(default)]
    pub numeric_indifferent_mode: NumericIndifferentMode,
    /// Seed for the selection RNG.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub exploration: ExplorationPolicy,
    /// Softmax temperature. Must be positive.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Background query threads. Zero runs queries inline.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Deepest allowed goal stack; reaching it halts the agent.
    #[serde(default = "default_max_goal_depth")]
    pub max_goal_depth: usize,
}

fn default_max_elaborations() -> u32 {
    100
}
fn default_temperature() -> f64 {
    1.0
}
fn default_worker_threads() -> usize {
    2
}
fn default_max_goal_depth() -> usize {
    100
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_elaborations: default_max_elaborations(),
            learning: false,
            numeric_indifferent_mode: NumericIndifferentMode::default(),
            seed: 0,
            exploration: ExplorationPolicy::default(),
            temperature: default_temperature(),
            worker_threads: default_worker_threads(),
            max_goal_depth: default_max_goal_depth(),
        }
    }
}

/// Names accepted by [`AgentConfig::get`] and [`AgentConfig::set`].
pub const SETTINGS: &[&str] = &[
    "max-elaborations",
    "learning",
    "numeric-indifferent-mode",
    "seed",
    "max-goal-depth",
    "exploration",
    "temperature",
];

impl AgentConfig {
    /// Check field ranges.
    pub fn validate(&self) -> CogentResult<()> {
        if self.max_elaborations == 0 {
            return Err(invalid("max_elaborations must be at least 1"));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(invalid("temperature must be a positive finite number"));
        }
        if self.max_goal_depth < 2 {
            return Err(invalid("max_goal_depth must be at least 2 (top state plus one subgoal)"));
        }
        if self.worker_threads > 64 {
            return Err(invalid("worker_threads must be at most 64"));
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> CogentResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: AgentConfig = toml::from_str(&content).map_err(|e| AgentError::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> CogentResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| AgentError::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| AgentError::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Current value of a runtime setting, rendered as text.
    pub fn get(&self, name: &str) -> CogentResult<String> {
        let value = match name {
            "max-elaborations" => self.max_elaborations.to_string(),
            "learning" => on_off(self.learning).to_string(),
            "numeric-indifferent-mode" => self.numeric_indifferent_mode.to_string(),
            "seed" => self.seed.to_string(),
            "max-goal-depth" => self.max_goal_depth.to_string(),
            "exploration" => self.exploration.to_string(),
            "temperature" => self.temperature.to_string(),
            _ => {
                return Err(AgentError::UnknownSetting {
                    name: name.to_string(),
                }
                .into());
            }
        };
        Ok(value)
    }

    /// Change a runtime setting. The config is unchanged on error.
    pub fn set(&mut self, name: &str, value: &str) -> CogentResult<()> {
        let bad = || AgentError::InvalidSetting {
            name: name.to_string(),
            value: value.to_string(),
        };
        let mut next = self.clone();
        match name {
            "max-elaborations" => next.max_elaborations = value.parse().map_err(|_| bad())?,
            "learning" => {
                next.learning = match value {
                    "on" | "true" | "1" => true,
                    "off" | "false" | "0" => false,
                    _ => return Err(bad().into()),
                }
            }
            "numeric-indifferent-mode" => {
                next.numeric_indifferent_mode = match value {
                    "avg" => NumericIndifferentMode::Avg,
                    "sum" => NumericIndifferentMode::Sum,
                    _ => return Err(bad().into()),
                }
            }
            "seed" => next.seed = value.parse().map_err(|_| bad())?,
            "max-goal-depth" => next.max_goal_depth = value.parse().map_err(|_| bad())?,
            "exploration" => {
                next.exploration = match value {
                    "softmax" => ExplorationPolicy::Softmax,
                    "first" => ExplorationPolicy::First,
                    _ => return Err(bad().into()),
                }
            }
            "temperature" => next.temperature = value.parse().map_err(|_| bad())?,
            _ => {
                return Err(AgentError::UnknownSetting {
                    name: name.to_string(),
                }
                .into());
            }
        }
        next.validate().map_err(|_| bad())?;
        *self = next;
        Ok(())
    }
}

fn on_off(b: bool) -> &'static str {
    if b { "on" } else { "off" }
}

fn invalid(message: &str) -> crate::error::CogentError {
    AgentError::InvalidConfig {
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_elaborations, 100);
        assert!(!cfg.learning);
        assert_eq!(cfg.numeric_indifferent_mode, NumericIndifferentMode::Avg);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AgentConfig = toml::from_str("learning = true\nexploration = \"first\"").unwrap();
        assert!(cfg.learning);
        assert_eq!(cfg.exploration, ExplorationPolicy::First);
        assert_eq!(cfg.max_goal_depth, 100);
    }

    #[test]
    fn load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        let mut cfg = AgentConfig::default();
        cfg.seed = 42;
        cfg.numeric_indifferent_mode = NumericIndifferentMode::Sum;
        cfg.save(&path).unwrap();
        assert_eq!(AgentConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "temperature = -1.0").unwrap();
        assert!(AgentConfig::load(&path).is_err());
        assert!(AgentConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn settings_get_and_set() {
        let mut cfg = AgentConfig::default();
        for name in SETTINGS {
            assert!(cfg.get(name).is_ok(), "{name}");
        }
        cfg.set("learning", "on").unwrap();
        assert_eq!(cfg.get("learning").unwrap(), "on");
        cfg.set("numeric-indifferent-mode", "sum").unwrap();
        assert_eq!(cfg.get("numeric-indifferent-mode").unwrap(), "sum");
        assert!(cfg.set("max-elaborations", "0").is_err());
        assert_eq!(cfg.max_elaborations, 100);
        assert!(cfg.set("bogus", "1").is_err());
        assert!(cfg.get("bogus").is_err());
    }
}
