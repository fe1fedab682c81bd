//! Configuration system.
//!
//! Loads game configuration from JSON strings (file IO left to the app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WorldError, WorldResult};
use crate::id::GameId;

/// Per-game configuration. Every game in a cluster must agree on `games`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// This game's ID.
    pub game_id: GameId,
    /// All game IDs of the cluster, used to pick location authorities.
    pub games: Vec<GameId>,
    /// Interest radius for new spaces.
    #[serde(default = "default_aoi_radius")]
    pub default_aoi_radius: f32,
    /// How long a source waits for a migration acknowledgement.
    #[serde(default = "default_migrate_timeout_ms")]
    pub migrate_timeout_ms: u64,
    /// How long a departed entity keeps forwarding calls to its new owner.
    #[serde(default = "default_redirect_ttl_ms")]
    pub redirect_ttl_ms: u64,
    /// Periodic save of persistent entities. 0 disables it.
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
    /// Interval of load reports used by the placement policy.
    #[serde(default = "default_load_report_interval_ms")]
    pub load_report_interval_ms: u64,
    /// Bound on a single storage or KVDB round-trip.
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,
    /// Frames forwarded more often than this are dropped.
    #[serde(default = "default_max_forward_hops")]
    pub max_forward_hops: u8,
    /// Publish interest, migration, load and destroy events on the game's
    /// event bus. Whoever turns this on must drain the bus.
    #[serde(default)]
    pub publish_events: bool,
}

fn default_aoi_radius() -> f32 {
    100.0
}

fn default_migrate_timeout_ms() -> u64 {
    5_000
}

fn default_redirect_ttl_ms() -> u64 {
    30_000
}

fn default_save_interval_ms() -> u64 {
    300_000
}

fn default_load_report_interval_ms() -> u64 {
    1_000
}

fn default_storage_timeout_ms() -> u64 {
    10_000
}

fn default_max_forward_hops() -> u8 {
    4
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            game_id: GameId(1),
            games: vec![GameId(1)],
            default_aoi_radius: default_aoi_radius(),
            migrate_timeout_ms: default_migrate_timeout_ms(),
            redirect_ttl_ms: default_redirect_ttl_ms(),
            save_interval_ms: default_save_interval_ms(),
            load_report_interval_ms: default_load_report_interval_ms(),
            storage_timeout_ms: default_storage_timeout_ms(),
            max_forward_hops: default_max_forward_hops(),
            publish_events: false,
        }
    }
}

impl GameConfig {
    /// Config for `game_id` in a cluster of `games`, other fields defaulted.
    pub fn for_cluster(game_id: GameId, games: Vec<GameId>) -> Self {
        Self {
            game_id,
            games,
            ..Default::default()
        }
    }

    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Checks cluster-level consistency.
    pub fn validate(&self) -> WorldResult<()> {
        if self.game_id.0 == 0 {
            return Err(WorldError::FatalMisconfiguration(
                "game id 0 is reserved".into(),
            ));
        }
        if !self.games.contains(&self.game_id) {
            return Err(WorldError::FatalMisconfiguration(format!(
                "{} is not listed in games",
                self.game_id
            )));
        }
        if !(self.default_aoi_radius > 0.0 && self.default_aoi_radius.is_finite()) {
            return Err(WorldError::FatalMisconfiguration(format!(
                "default_aoi_radius must be positive, got {}",
                self.default_aoi_radius
            )));
        }
        Ok(())
    }

    pub fn migrate_timeout(&self) -> Duration {
        Duration::from_millis(self.migrate_timeout_ms)
    }

    pub fn redirect_ttl(&self) -> Duration {
        Duration::from_millis(self.redirect_ttl_ms)
    }

    pub fn save_interval(&self) -> Option<Duration> {
        (self.save_interval_ms > 0).then(|| Duration::from_millis(self.save_interval_ms))
    }

    pub fn load_report_interval(&self) -> Duration {
        Duration::from_millis(self.load_report_interval_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_defaults() {
        let cfg = GameConfig::from_json_str(r#"{"game_id": 2, "games": [1, 2]}"#).unwrap();
        assert_eq!(cfg.game_id, GameId(2));
        assert_eq!(cfg.migrate_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.max_forward_hops, 4);
        assert!(!cfg.publish_events);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn game_must_be_member() {
        let cfg = GameConfig::for_cluster(GameId(3), vec![GameId(1)]);
        assert!(matches!(
            cfg.validate(),
            Err(WorldError::FatalMisconfiguration(_))
        ));
    }
}
