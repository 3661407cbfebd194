//! Snapshot persistence (§4.4 recovery, §6 "Persisted state layout").
//!
//! The event log is the source of truth; this module is strictly an
//! opaque, forward-compatible projection sink a shard uses to bound replay
//! time — exactly the "database is a projection sink, not the source of
//! truth" stance §9 calls out for the position/ladder data specifically,
//! generalized here to every book a shard owns. Each snapshot is a
//! self-describing payload file (`snapshot_<seq>.bin`) plus a small JSON
//! manifest sidecar carrying the schema version, so a forward-incompatible
//! reader can at least recognize and skip a snapshot it can't parse instead
//! of misinterpreting it (§6: "forward-compatible").
//!
//! Grounded on the same "immutable once written, full state as one blob"
//! shape as the teacher's `backtest_v2::artifact_store` (the schema-version
//! constant, the persisted-at timestamp), adapted from a SQLite table to
//! plain files because §6 names the on-disk layout explicitly
//! (`snapshot_<seq>.bin + manifest`) rather than a database.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;

use crate::ids::{AggregationUnitId, BusinessDate, ClientId, SecurityId};
use crate::inventory::{InventoryAvailability, InventoryKey};
use crate::limits::Limit;
use crate::locate::LocateReservation;
use crate::position::Position;

/// Schema version for the snapshot payload format. Bump when the shape of
/// `ShardSnapshot` changes in a way old readers can't tolerate.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub shard_id: usize,
    pub sequence: u64,
    pub event_count: u64,
    pub created_at: DateTime<Utc>,
    /// Hash of the canonicalized position state at this sequence, used by
    /// the replay-determinism property (§8): replaying the log up to the
    /// same sequence must reproduce this hash exactly.
    pub state_hash: u64,
}

/// Full state a shard needs to resume from without replaying its entire
/// log prefix (§4.4 "Recovery"). Limit/locate reservation state is
/// included too since those live in the same shard-owned actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub positions: Vec<Position>,
    pub inventory: Vec<(InventoryKey, InventoryAvailability)>,
    pub client_limits: Vec<((ClientId, SecurityId, BusinessDate), Limit)>,
    pub au_limits: Vec<((AggregationUnitId, SecurityId, BusinessDate), Limit)>,
    pub locate_reservations: Vec<LocateReservation>,
}

/// Deterministic hash over a canonicalized position set: sorted by key so
/// that hash equality reflects only state, never insertion order (§8
/// replay-determinism property).
pub fn hash_positions(positions: &[Position]) -> u64 {
    let mut sorted: Vec<&Position> = positions.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    let mut hasher = DefaultHasher::new();
    for p in sorted {
        // `Position` itself isn't `Hash` (it holds `Decimal`, which is),
        // but its canonical JSON form is stable and cheap enough for a
        // snapshot-time hash that only runs every `snapshot_every_events`.
        let canonical = serde_json::to_string(p).unwrap_or_default();
        canonical.hash(&mut hasher);
    }
    hasher.finish()
}

pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn shard_dir(&self, shard_id: usize) -> PathBuf {
        self.root.join(format!("shard_{shard_id}"))
    }

    fn payload_path(&self, shard_id: usize, sequence: u64) -> PathBuf {
        self.shard_dir(shard_id).join(format!("snapshot_{sequence}.bin"))
    }

    fn manifest_path(&self, shard_id: usize, sequence: u64) -> PathBuf {
        self.shard_dir(shard_id).join(format!("snapshot_{sequence}.manifest.json"))
    }

    /// Writes a snapshot under a shard-local lock held only for the
    /// duration of this call (§5: "a consistent copy is taken first, then
    /// written outside the lock" — the caller is expected to have already
    /// cloned `snapshot` from the live book before calling this, so the
    /// write itself never blocks the shard's event loop).
    pub fn write(
        &self,
        shard_id: usize,
        sequence: u64,
        event_count: u64,
        snapshot: &ShardSnapshot,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.shard_dir(shard_id);
        fs::create_dir_all(&dir)?;

        let payload_path = self.payload_path(shard_id, sequence);
        let payload_bytes = serde_json::to_vec(snapshot)?;
        fs::write(&payload_path, &payload_bytes)?;

        let manifest = SnapshotManifest {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            shard_id,
            sequence,
            event_count,
            created_at: Utc::now(),
            state_hash: hash_positions(&snapshot.positions),
        };
        let manifest_path = self.manifest_path(shard_id, sequence);
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

        Ok(payload_path)
    }

    /// Finds the highest-sequence manifest for a shard, skipping any whose
    /// `schema_version` this reader doesn't recognize rather than failing
    /// the whole directory scan (§6 "forward-compatible").
    pub fn latest_manifest(&self, shard_id: usize) -> anyhow::Result<Option<SnapshotManifest>> {
        let dir = self.shard_dir(shard_id);
        if !dir.exists() {
            return Ok(None);
        }
        let mut best: Option<SnapshotManifest> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else { continue };
            let Ok(manifest) = serde_json::from_slice::<SnapshotManifest>(&bytes) else {
                continue;
            };
            if manifest.schema_version > SNAPSHOT_SCHEMA_VERSION {
                continue;
            }
            if best.as_ref().map(|b| manifest.sequence > b.sequence).unwrap_or(true) {
                best = Some(manifest);
            }
        }
        Ok(best)
    }

    pub fn load(&self, shard_id: usize, sequence: u64) -> anyhow::Result<ShardSnapshot> {
        let path = self.payload_path(shard_id, sequence);
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BookId, SecurityId};
    use crate::position::PositionKey;
    use tempfile::tempdir;

    fn sample_position() -> Position {
        Position::new(PositionKey {
            book_id: BookId::from("B1"),
            security_id: SecurityId::from("S1"),
            business_date: chrono::NaiveDate::from_ymd_opt(2023, 6, 15).unwrap(),
        })
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let snapshot = ShardSnapshot {
            positions: vec![sample_position()],
            inventory: Vec::new(),
            client_limits: Vec::new(),
            au_limits: Vec::new(),
            locate_reservations: Vec::new(),
        };
        store.write(0, 100, 100, &snapshot).unwrap();

        let manifest = store.latest_manifest(0).unwrap().expect("manifest present");
        assert_eq!(manifest.sequence, 100);
        assert_eq!(manifest.schema_version, SNAPSHOT_SCHEMA_VERSION);

        let loaded = store.load(0, manifest.sequence).unwrap();
        assert_eq!(loaded.positions.len(), 1);
    }

    #[test]
    fn latest_manifest_picks_highest_sequence() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let snapshot = ShardSnapshot {
            positions: vec![],
            inventory: Vec::new(),
            client_limits: Vec::new(),
            au_limits: Vec::new(),
            locate_reservations: Vec::new(),
        };
        store.write(1, 10, 10, &snapshot).unwrap();
        store.write(1, 50, 50, &snapshot).unwrap();
        let manifest = store.latest_manifest(1).unwrap().unwrap();
        assert_eq!(manifest.sequence, 50);
    }

    #[test]
    fn hash_is_order_independent() {
        let mut a = vec![sample_position()];
        let mut b = sample_position();
        b.key.security_id = SecurityId::from("S2");
        a.push(b.clone());
        let forward = hash_positions(&a);
        let reversed = vec![b, sample_position()];
        assert_eq!(forward, hash_positions(&reversed));
    }
}
