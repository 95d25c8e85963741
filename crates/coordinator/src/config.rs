use std::path::Path;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::{CoordinatorError, Result};

/// Hard limit on seats per game; the shared layout is sized for it.
pub const MAX_PLAYERS: usize = 5;
/// Smallest table a game can be configured for.
pub const MIN_PLAYERS: usize = 3;

/// Game rules shared by every process attached to a game region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Seats handed out before `join` starts rejecting players.
    pub max_players: usize,
    /// Connected players needed before the game starts.
    pub min_players: usize,
    /// Round at which the richest player wins.
    pub lap_cap: u32,
    pub starting_money: i64,
    /// Advance the turn automatically at this interval. Off by default.
    pub proactive_tick_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            min_players: MIN_PLAYERS,
            lap_cap: 50,
            starting_money: 500,
            proactive_tick_ms: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let malformed = CoordinatorError::invalid_argument("malformed configuration");
        let config: Self = serde_yaml::from_str(yaml).change_context(malformed)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let unreadable = CoordinatorError::invalid_argument("unreadable configuration");
        let yaml = std::fs::read_to_string(path)
            .change_context(unreadable)
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;
        Self::from_yaml_str(&yaml)
            .attach_printable_lazy(|| format!("path: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Report::new(CoordinatorError::invalid_argument(reason)));
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&self.max_players) {
            return invalid(format!(
                "max_players must be within {MIN_PLAYERS}..={MAX_PLAYERS}, got {}",
                self.max_players
            ));
        }
        if self.min_players < MIN_PLAYERS || self.min_players > self.max_players {
            return invalid(format!(
                "min_players must be within {MIN_PLAYERS}..={}, got {}",
                self.max_players, self.min_players
            ));
        }
        if self.lap_cap == 0 {
            return invalid("lap_cap must be at least 1".to_string());
        }
        if self.starting_money <= 0 {
            return invalid(format!(
                "starting_money must be positive, got {}",
                self.starting_money
            ));
        }
        if self.proactive_tick_ms == Some(0) {
            return invalid("proactive_tick_ms must be positive".to_string());
        }
        Ok(())
    }

    pub fn proactive_tick(&self) -> Option<Duration> {
        self.proactive_tick_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_players, 5);
        assert_eq!(config.lap_cap, 50);
        assert_eq!(config.proactive_tick(), None);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config =
            CoordinatorConfig::from_yaml_str("max_players: 4\nproactive_tick_ms: 100\n").unwrap();
        assert_eq!(config.max_players, 4);
        assert_eq!(config.min_players, 3);
        assert_eq!(config.starting_money, 500);
        assert_eq!(config.proactive_tick(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn out_of_range_players_rejected() {
        for yaml in [
            "max_players: 6",
            "max_players: 2",
            "min_players: 2",
            "max_players: 3\nmin_players: 4",
        ] {
            let err = CoordinatorConfig::from_yaml_str(yaml).unwrap_err();
            assert!(
                matches!(
                    err.current_context(),
                    CoordinatorError::InvalidArgument { .. }
                ),
                "{yaml}"
            );
        }
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(CoordinatorConfig::from_yaml_str("max_player: 4").is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.yaml");
        std::fs::write(&path, "lap_cap: 10\nstarting_money: 1500\n").unwrap();

        let config = CoordinatorConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.lap_cap, 10);
        assert_eq!(config.starting_money, 1500);
    }
}
