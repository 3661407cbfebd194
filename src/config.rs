//! Engine configuration, loaded from the environment.
//!
//! Follows the same "one env var per field, fall back to a sane default"
//! style as the rest of this codebase's configuration loaders.

use std::path::PathBuf;
use std::time::Duration;

use crate::ids::MarketCode;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Power-of-two shard count, fixed at boot (§5, §6).
    pub shard_count: usize,
    pub snapshot_dir: PathBuf,
    pub snapshot_every_events: u64,
    pub snapshot_every_seconds: u64,

    pub dedup_window: usize,
    pub reorder_window: usize,
    pub reorder_max_skew: Duration,

    /// Reference-data source priority, highest first.
    pub reference_priority: Vec<String>,
    pub reference_staleness_window: Duration,

    pub validation_deadline: Duration,
    pub locate_deadline: Duration,

    pub locate_auto_approval_max_quantity: rust_decimal::Decimal,
    pub locate_auto_approval_min_inventory_ratio: f64,
    pub locate_expiry_hours: i64,
    pub locate_manual_review_timeout: Duration,

    pub shortsell_batch_size: usize,
    pub shortsell_bulkhead: usize,

    pub market_rules_path: Option<PathBuf>,

    pub shard_queue_capacity: usize,
    pub publisher_batch_size: usize,
    pub publisher_flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            snapshot_dir: PathBuf::from("./snapshots"),
            snapshot_every_events: 50_000,
            snapshot_every_seconds: 60,
            dedup_window: 1_000_000,
            reorder_window: 256,
            reorder_max_skew: Duration::from_secs(2),
            reference_priority: vec![
                "REUTERS".to_string(),
                "BLOOMBERG".to_string(),
                "MARKIT".to_string(),
                "ULTUMUS".to_string(),
                "RIMES".to_string(),
            ],
            reference_staleness_window: Duration::from_secs(24 * 3600),
            validation_deadline: Duration::from_millis(150),
            locate_deadline: Duration::from_secs(1),
            locate_auto_approval_max_quantity: rust_decimal::Decimal::new(20_000, 0),
            locate_auto_approval_min_inventory_ratio: 2.0,
            locate_expiry_hours: 24,
            locate_manual_review_timeout: Duration::from_secs(60 * 60),
            shortsell_batch_size: 32,
            shortsell_bulkhead: 256,
            market_rules_path: None,
            shard_queue_capacity: 65_536,
            publisher_batch_size: 32,
            publisher_flush_interval: Duration::from_millis(5),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SHARD_COUNT") {
            let n: usize = v.parse()?;
            anyhow::ensure!(n.is_power_of_two(), "shard_count must be a power of two");
            cfg.shard_count = n;
        }
        if let Ok(v) = std::env::var("SNAPSHOT_DIR") {
            cfg.snapshot_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPSHOT_EVERY_EVENTS") {
            cfg.snapshot_every_events = v.parse()?;
        }
        if let Ok(v) = std::env::var("SNAPSHOT_EVERY_SECONDS") {
            cfg.snapshot_every_seconds = v.parse()?;
        }
        if let Ok(v) = std::env::var("DEDUP_WINDOW") {
            cfg.dedup_window = v.parse()?;
        }
        if let Ok(v) = std::env::var("REORDER_WINDOW") {
            cfg.reorder_window = v.parse()?;
        }
        if let Ok(v) = std::env::var("REORDER_MAX_SKEW_MS") {
            cfg.reorder_max_skew = Duration::from_millis(v.parse()?);
        }
        if let Ok(v) = std::env::var("REFERENCE_PRIORITY") {
            cfg.reference_priority = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("VALIDATION_DEADLINE_MS") {
            cfg.validation_deadline = Duration::from_millis(v.parse()?);
        }
        if let Ok(v) = std::env::var("LOCATE_DEADLINE_MS") {
            cfg.locate_deadline = Duration::from_millis(v.parse()?);
        }
        if let Ok(v) = std::env::var("LOCATE_AUTO_APPROVAL_MAX_QUANTITY") {
            cfg.locate_auto_approval_max_quantity = v.parse()?;
        }
        if let Ok(v) = std::env::var("LOCATE_AUTO_APPROVAL_MIN_INVENTORY_RATIO") {
            cfg.locate_auto_approval_min_inventory_ratio = v.parse()?;
        }
        if let Ok(v) = std::env::var("LOCATE_EXPIRY_HOURS") {
            cfg.locate_expiry_hours = v.parse()?;
        }
        if let Ok(v) = std::env::var("SHORTSELL_BATCH_SIZE") {
            cfg.shortsell_batch_size = v.parse()?;
        }
        if let Ok(v) = std::env::var("SHORTSELL_BULKHEAD") {
            cfg.shortsell_bulkhead = v.parse()?;
        }
        if let Ok(v) = std::env::var("MARKET_RULES_PATH") {
            cfg.market_rules_path = Some(PathBuf::from(v));
        }

        Ok(cfg)
    }

    pub fn reference_rank(&self, source: &str) -> usize {
        self.reference_priority
            .iter()
            .position(|s| s.eq_ignore_ascii_case(source))
            .unwrap_or(self.reference_priority.len())
    }
}

/// Markets with a registered rule plugin chain, used only for config
/// validation/logging at startup.
pub fn known_markets() -> Vec<MarketCode> {
    vec![MarketCode::new("TW"), MarketCode::new("JP")]
}
