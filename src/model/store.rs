//! Durable model store behind a narrow contract.
//!
//! Snapshots are opaque versioned artifacts to the rest of the pipeline:
//! `store`, `load`, `latest_version`, `prune`. The filesystem
//! implementation writes one JSON artifact per version into a models
//! directory; the in-memory implementation backs tests.

use crate::model::ModelSnapshot;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Narrow read/write contract for the external model store.
pub trait ModelStore: Send + Sync {
    fn store(&self, snapshot: &ModelSnapshot) -> Result<()>;

    fn load(&self, version: u64) -> Result<ModelSnapshot>;

    fn latest_version(&self) -> Result<Option<u64>>;

    /// Keep only the newest `keep` snapshots; returns how many were
    /// removed.
    fn prune(&self, keep: usize) -> Result<usize>;
}

/// Filesystem store: one `model_v{version}.json` per snapshot.
pub struct FsModelStore {
    dir: PathBuf,
}

impl FsModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create models directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn artifact_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("model_v{version}.json"))
    }

    fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read models directory {}", self.dir.display()))?
        {
            let name = entry?.file_name();
            if let Some(version) = parse_artifact_name(&name.to_string_lossy()) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

fn parse_artifact_name(name: &str) -> Option<u64> {
    name.strip_prefix("model_v")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl ModelStore for FsModelStore {
    fn store(&self, snapshot: &ModelSnapshot) -> Result<()> {
        let path = self.artifact_path(snapshot.version);
        let json = serde_json::to_vec(snapshot).context("failed to serialize model snapshot")?;

        // Write-then-rename so a crash never leaves a torn artifact behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write model artifact {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to publish model artifact {}", path.display()))?;

        info!(
            version = snapshot.version,
            path = %path.display(),
            "Stored model snapshot"
        );
        Ok(())
    }

    fn load(&self, version: u64) -> Result<ModelSnapshot> {
        let path = self.artifact_path(version);
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read model artifact {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to decode model artifact {}", path.display()))
    }

    fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.versions()?.last().copied())
    }

    fn prune(&self, keep: usize) -> Result<usize> {
        let versions = self.versions()?;
        if versions.len() <= keep {
            return Ok(0);
        }

        let drop_count = versions.len() - keep;
        for version in &versions[..drop_count] {
            let path = self.artifact_path(*version);
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove model artifact {}", path.display()))?;
            info!(version, "Pruned model snapshot");
        }
        Ok(drop_count)
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryModelStore {
    snapshots: Mutex<BTreeMap<u64, ModelSnapshot>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for InMemoryModelStore {
    fn store(&self, snapshot: &ModelSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    fn load(&self, version: u64) -> Result<ModelSnapshot> {
        self.snapshots
            .lock()
            .get(&version)
            .cloned()
            .with_context(|| format!("model version {version} not found"))
    }

    fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.snapshots.lock().keys().next_back().copied())
    }

    fn prune(&self, keep: usize) -> Result<usize> {
        let mut snapshots = self.snapshots.lock();
        let mut removed = 0;
        while snapshots.len() > keep {
            let oldest = *snapshots.keys().next().expect("non-empty map");
            snapshots.remove(&oldest);
            removed += 1;
        }
        Ok(removed)
    }
}

/// Load the newest stored snapshot, if any. Used at startup to recover the
/// active model before the first retraining cycle.
pub fn load_latest(store: &dyn ModelStore) -> Result<Option<ModelSnapshot>> {
    match store.latest_version()? {
        Some(version) => Ok(Some(store.load(version)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{train_snapshot, TrainingParams};
    use crate::types::FeatureVector;
    use chrono::{TimeZone, Utc};

    fn snapshot(version: u64) -> ModelSnapshot {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let features: Vec<FeatureVector> = (0..60)
            .map(|i| {
                let v = 10_000.0 + (i % 20) as f64 * 500.0;
                FeatureVector::new(
                    format!("tx{i}"),
                    vec![v, 300.0, 2.0, 2.0, 0.03, (i % 4) as f64, v, v],
                    ts,
                )
            })
            .collect();
        train_snapshot(&features, &TrainingParams::default(), version, (ts, ts)).unwrap()
    }

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::new(dir.path()).unwrap();

        store.store(&snapshot(1)).unwrap();
        store.store(&snapshot(2)).unwrap();

        assert_eq!(store.latest_version().unwrap(), Some(2));
        let loaded = store.load(1).unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_fs_store_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::new(dir.path()).unwrap();

        for v in 1..=5 {
            store.store(&snapshot(v)).unwrap();
        }

        let removed = store.prune(2).unwrap();
        assert_eq!(removed, 3);
        assert!(store.load(3).is_err());
        assert!(store.load(4).is_ok());
        assert!(store.load(5).is_ok());
    }

    #[test]
    fn test_load_latest_on_empty_store() {
        let store = InMemoryModelStore::new();
        assert!(load_latest(&store).unwrap().is_none());
    }

    #[test]
    fn test_in_memory_store_prune() {
        let store = InMemoryModelStore::new();
        for v in 1..=4 {
            store.store(&snapshot(v)).unwrap();
        }
        assert_eq!(store.prune(1).unwrap(), 3);
        assert_eq!(store.latest_version().unwrap(), Some(4));
    }
}
