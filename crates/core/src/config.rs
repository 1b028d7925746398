use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Construction-time constants for a tiered scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub classes: ClassConfig,
    #[serde(default)]
    pub dimensions: DimensionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `FLEET_PROFILE`. When set (e.g. `BENCH`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("FLEET_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            classes: ClassConfig::from_env_profiled(p),
            dimensions: DimensionConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
        }
    }

    /// Parse config from a TOML string. Missing sections take defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, FleetError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Check every constant the scheduler relies on.
    pub fn validate(&self) -> Result<(), FleetError> {
        self.classes.validate()?;
        self.dimensions.validate()?;
        self.queue.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  classes:     width={}, tiers={}",
            self.classes.width,
            self.classes.tiers_label()
        );
        tracing::info!(
            "  dimensions:  regions={}, energy_levels={}",
            self.dimensions.regions,
            self.dimensions.energy_levels
        );
        tracing::info!(
            "  queue:       kind={}, ring_capacity={}, chunk_capacity={}",
            self.queue.kind,
            self.queue.ring_capacity,
            self.queue.chunk_capacity
        );
    }

    /// JSON view for reports.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "classes": { "width": self.classes.width, "tiers": self.classes.tiers },
            "dimensions": {
                "regions": self.dimensions.regions,
                "energy_levels": self.dimensions.energy_levels,
            },
            "queue": {
                "kind": self.queue.kind,
                "ring_capacity": self.queue.ring_capacity,
                "chunk_capacity": self.queue.chunk_capacity,
            },
        })
    }
}

// ── Size classes ──────────────────────────────────────────────

/// One capacity band: covers everything above the previous tier's limit up
/// to `limit`, quantized in `step`-wide classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub limit: u64,
    pub step: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Classes per tier (bits per mask word).
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

fn default_width() -> u32 { 64 }

fn default_tiers() -> Vec<TierConfig> {
    vec![
        // 4GB in 64MB steps
        TierConfig { limit: 4096, step: 64 },
        // 4GB..16GB in 192MB steps
        TierConfig { limit: 16384, step: 192 },
    ]
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            tiers: default_tiers(),
        }
    }
}

impl ClassConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            width: profiled_env_parse(p, "FLEET_CLASS_WIDTH", default_width()),
            tiers: profiled_env_opt(p, "FLEET_TIERS")
                .and_then(|v| parse_tiers(&v))
                .unwrap_or_else(default_tiers),
        }
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.width == 0 || self.width > 64 {
            return Err(FleetError::Config(format!(
                "class width must be within 1..=64, got {}",
                self.width
            )));
        }
        if self.tiers.is_empty() {
            return Err(FleetError::Config("at least one tier is required".into()));
        }
        let mut previous = 0u64;
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.step == 0 {
                return Err(FleetError::Config(format!("tier {} has a zero step", i)));
            }
            if tier.limit <= previous {
                return Err(FleetError::Config(format!(
                    "tier {} limit {} must exceed the previous limit {}",
                    i, tier.limit, previous
                )));
            }
            previous = tier.limit;
        }
        Ok(())
    }

    fn tiers_label(&self) -> String {
        self.tiers
            .iter()
            .map(|t| format!("{}:{}", t.limit, t.step))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse `"4096:64,16384:192"` into tiers. Any malformed entry discards the whole value.
fn parse_tiers(raw: &str) -> Option<Vec<TierConfig>> {
    raw.split(',')
        .map(|entry| {
            let (limit, step) = entry.trim().split_once(':')?;
            Some(TierConfig {
                limit: limit.trim().parse().ok()?,
                step: step.trim().parse().ok()?,
            })
        })
        .collect()
}

// ── Dimensions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionConfig {
    /// Region slots, including the aggregate region 0.
    #[serde(default = "default_regions")]
    pub regions: usize,
    /// Ordered energy levels `0..energy_levels`.
    #[serde(default = "default_energy_levels")]
    pub energy_levels: u8,
}

fn default_regions() -> usize { 4 }
fn default_energy_levels() -> u8 { 3 }

impl Default for DimensionConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            energy_levels: default_energy_levels(),
        }
    }
}

impl DimensionConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            regions: profiled_env_parse(p, "FLEET_REGIONS", default_regions()),
            energy_levels: profiled_env_parse(p, "FLEET_ENERGY_LEVELS", default_energy_levels()),
        }
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.regions == 0 {
            return Err(FleetError::Config("at least one region is required".into()));
        }
        if self.energy_levels == 0 {
            return Err(FleetError::Config("at least one energy level is required".into()));
        }
        Ok(())
    }

    pub fn check_region(&self, region: usize) -> Result<(), FleetError> {
        if region >= self.regions {
            return Err(FleetError::RegionOutOfRange {
                region,
                regions: self.regions,
            });
        }
        Ok(())
    }

    pub fn check_energy(&self, level: u8) -> Result<(), FleetError> {
        if level >= self.energy_levels {
            return Err(FleetError::EnergyOutOfRange {
                level,
                levels: self.energy_levels,
            });
        }
        Ok(())
    }
}

// ── Class queues ──────────────────────────────────────────────

/// Which per-class queue backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Fixed-capacity ring; `register` can overflow.
    Bounded,
    /// Growable chunk chain; always accepts.
    Unbounded,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Bounded => write!(f, "bounded"),
            QueueKind::Unbounded => write!(f, "unbounded"),
        }
    }
}

impl std::str::FromStr for QueueKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bounded" | "ring" => Ok(QueueKind::Bounded),
            "unbounded" | "chunked" => Ok(QueueKind::Unbounded),
            other => Err(FleetError::Config(format!("unknown queue kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_kind")]
    pub kind: QueueKind,
    /// Slots per bounded class queue. Power of two.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Slots per chunk of an unbounded class queue.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: usize,
}

fn default_queue_kind() -> QueueKind { QueueKind::Unbounded }
fn default_ring_capacity() -> usize { 1024 }
fn default_chunk_capacity() -> usize { 1024 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: default_queue_kind(),
            ring_capacity: default_ring_capacity(),
            chunk_capacity: default_chunk_capacity(),
        }
    }
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            kind: profiled_env_parse(p, "FLEET_QUEUE_KIND", default_queue_kind()),
            ring_capacity: profiled_env_parse(p, "FLEET_RING_CAPACITY", default_ring_capacity()),
            chunk_capacity: profiled_env_parse(p, "FLEET_CHUNK_CAPACITY", default_chunk_capacity()),
        }
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(FleetError::Config(format!(
                "ring capacity must be a power of two >= 2, got {}",
                self.ring_capacity
            )));
        }
        if self.chunk_capacity == 0 {
            return Err(FleetError::Config("chunk capacity must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.classes.width, 64);
        assert_eq!(config.classes.tiers.len(), 2);
        assert_eq!(config.dimensions.regions, 4);
        assert_eq!(config.dimensions.energy_levels, 3);
        assert_eq!(config.queue.kind, QueueKind::Unbounded);
        assert_eq!(config.profile_label(), "default");
    }

    #[test]
    fn from_toml_fills_missing_sections() {
        let config = Config::from_toml(
            r#"
            [queue]
            kind = "bounded"
            ring_capacity = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.kind, QueueKind::Bounded);
        assert_eq!(config.queue.ring_capacity, 8);
        assert_eq!(config.queue.chunk_capacity, 1024);
        assert_eq!(config.classes, ClassConfig::default());
    }

    #[test]
    fn from_toml_custom_tiers() {
        let config = Config::from_toml(
            r#"
            [classes]
            width = 16
            tiers = [{ limit = 1000, step = 100 }]

            [dimensions]
            regions = 2
            energy_levels = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.classes.width, 16);
        assert_eq!(config.classes.tiers, vec![TierConfig { limit: 1000, step: 100 }]);
        assert_eq!(config.dimensions.energy_levels, 5);
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let err = Config::from_toml("[queue]\nring_capacity = 1000\n").unwrap_err();
        assert!(matches!(err, FleetError::Config(_)), "got {err}");
    }

    #[test]
    fn rejects_width_above_64() {
        let mut config = Config::default();
        config.classes.width = 65;
        assert!(config.validate().is_err());
        config.classes.width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_increasing_tiers() {
        let mut config = Config::default();
        config.classes.tiers = vec![
            TierConfig { limit: 4096, step: 64 },
            TierConfig { limit: 4096, step: 192 },
        ];
        assert!(config.validate().is_err());

        config.classes.tiers = vec![TierConfig { limit: 4096, step: 0 }];
        assert!(config.validate().is_err());

        config.classes.tiers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_dimensions() {
        let mut config = Config::default();
        config.dimensions.regions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dimensions.energy_levels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::from_toml("[queue\nkind = ").unwrap_err();
        assert!(matches!(err, FleetError::ConfigParse(_)));
    }

    #[test]
    fn parse_tiers_accepts_spaces() {
        let tiers = parse_tiers("4096:64, 16384 : 192").unwrap();
        assert_eq!(tiers[1], TierConfig { limit: 16384, step: 192 });
        assert!(parse_tiers("4096").is_none());
        assert!(parse_tiers("4096:x").is_none());
    }

    #[test]
    fn queue_kind_parses_aliases() {
        assert_eq!("ring".parse::<QueueKind>().unwrap(), QueueKind::Bounded);
        assert_eq!("Unbounded".parse::<QueueKind>().unwrap(), QueueKind::Unbounded);
        assert!("stack".parse::<QueueKind>().is_err());
    }

    #[test]
    fn profiled_env_lookup() {
        // Unique keys so parallel tests never observe each other's env.
        env::set_var("FLEETTEST_FLEET_REGIONS", "9");
        let config = Config::for_profile("fleettest");
        assert_eq!(config.profile, "FLEETTEST");
        assert_eq!(config.dimensions.regions, 9);
        env::remove_var("FLEETTEST_FLEET_REGIONS");
    }

    #[test]
    fn dimension_checks() {
        let dims = DimensionConfig::default();
        assert!(dims.check_region(3).is_ok());
        assert!(matches!(
            dims.check_region(4),
            Err(FleetError::RegionOutOfRange { region: 4, regions: 4 })
        ));
        assert!(dims.check_energy(2).is_ok());
        assert!(matches!(
            dims.check_energy(3),
            Err(FleetError::EnergyOutOfRange { level: 3, levels: 3 })
        ));
    }

    #[test]
    fn summary_has_queue_kind() {
        let summary = Config::default().summary();
        assert_eq!(summary["queue"]["kind"], "unbounded");
        assert_eq!(summary["profile"], "default");
    }
}
