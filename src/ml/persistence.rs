//! Model persistence - save and load trained model sets
//!
//! Every save writes a complete generation into its own directory and then
//! switches `current.bin` to it, so a reader only ever sees one generation:
//! - `current.bin`: number of the active generation
//! - `generation-{n}/metadata.bin`: versioned blob with scalers, lookback and metrics
//! - `generation-{n}/monthly_series.bin`: the dense monthly series of both kinds
//! - `generation-{n}/{kind}_category_{id}.bin`: one network per trained category

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::CategoryKind;

use super::model::{KindModels, ModelMetrics, ModelSet, TrainedCategoryModel};
use super::network::BiLstmNetwork;
use super::scaler::FeatureScalers;
use super::series::MonthlySeries;

const POINTER_FILE: &str = "current.bin";
const GENERATION_PREFIX: &str = "generation-";
pub const METADATA_FILE: &str = "metadata.bin";
pub const SERIES_FILE: &str = "monthly_series.bin";

/// Everything about a trained category except its network weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryArtifact {
    pub scalers: FeatureScalers,
    pub lookback: usize,
    pub metrics: ModelMetrics,
    pub training_samples: usize,
    pub epochs_run: usize,
    /// Network file name relative to the generation directory
    pub file_name: String,
}

/// Serializable metadata of a model set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMetadata {
    /// Version for backward compatibility
    pub version: u32,
    /// When the model set was trained
    pub created_at: DateTime<Utc>,
    pub categories: BTreeMap<CategoryKind, BTreeMap<u32, CategoryArtifact>>,
}

impl PersistedMetadata {
    /// Current version number
    pub const CURRENT_VERSION: u32 = 2;

    pub fn from_set(set: &ModelSet) -> Self {
        let categories = set
            .kinds
            .iter()
            .map(|(kind, kind_models)| {
                let artifacts = kind_models
                    .models
                    .iter()
                    .map(|(id, model)| {
                        let artifact = CategoryArtifact {
                            scalers: model.scalers.clone(),
                            lookback: model.lookback,
                            metrics: model.metrics,
                            training_samples: model.training_samples,
                            epochs_run: model.epochs_run,
                            file_name: model_file_name(*kind, *id),
                        };
                        (*id, artifact)
                    })
                    .collect();
                (*kind, artifacts)
            })
            .collect();

        Self {
            version: Self::CURRENT_VERSION,
            created_at: set.created_at,
            categories,
        }
    }

    pub fn model_count(&self) -> usize {
        self.categories.values().map(BTreeMap::len).sum()
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Model set v{}: {} categories, created {}",
            self.version,
            self.model_count(),
            self.created_at.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

/// File name of a category's network.
pub fn model_file_name(kind: CategoryKind, category_id: u32) -> String {
    format!("{}_category_{}.bin", kind.slug(), category_id)
}

fn generation_number(name: &str) -> Option<u64> {
    name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

fn io_error(e: std::io::Error) -> PersistenceError {
    PersistenceError::Io(e.to_string())
}

/// Serialize `value` to `path` with bincode, creating parent directories.
///
/// Writes to a sibling temp file and renames it into place.
pub fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let bytes =
        bincode::serialize(value).map_err(|e| PersistenceError::Serialize(e.to_string()))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)?;

    Ok(())
}

/// Deserialize a bincode file written by [`write_bincode`].
pub fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    if !path.exists() {
        return Err(PersistenceError::FileNotFound(
            path.to_string_lossy().to_string(),
        ));
    }

    let bytes = fs::read(path).map_err(io_error)?;

    bincode::deserialize(&bytes).map_err(|e| PersistenceError::Deserialize(e.to_string()))
}

fn read_metadata(dir: &Path) -> Result<PersistedMetadata, PersistenceError> {
    let metadata: PersistedMetadata = read_bincode(&dir.join(METADATA_FILE))?;

    // Version check
    if metadata.version != PersistedMetadata::CURRENT_VERSION {
        return Err(PersistenceError::VersionMismatch {
            expected: PersistedMetadata::CURRENT_VERSION,
            found: metadata.version,
        });
    }

    Ok(metadata)
}

/// Directory holding the generations of a model set.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_FILE)
    }

    fn generation_dir(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("{}{}", GENERATION_PREFIX, generation))
    }

    fn current_generation(&self) -> Result<u64, PersistenceError> {
        read_bincode(&self.pointer_path())
    }

    /// Directory of the generation `load` reads from.
    pub fn current_dir(&self) -> Result<PathBuf, PersistenceError> {
        Ok(self.generation_dir(self.current_generation()?))
    }

    /// Replace whatever is on disk with `set`.
    ///
    /// The new generation is written in full before `current.bin` points to
    /// it. On error the previous generation stays active.
    pub fn save(&self, set: &ModelSet) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(io_error)?;

        // Never reuse a number, including those of interrupted saves
        let generation = self
            .generations()
            .into_iter()
            .chain(self.current_generation().ok())
            .max()
            .map_or(1, |g| g + 1);
        let staging = self.generation_dir(generation);

        for (kind, kind_models) in &set.kinds {
            for (id, model) in &kind_models.models {
                write_bincode(&staging.join(model_file_name(*kind, *id)), &model.network)?;
            }
        }

        let series: Vec<&MonthlySeries> = set.kinds.values().map(|k| &k.series).collect();
        write_bincode(&staging.join(SERIES_FILE), &series)?;

        let metadata = PersistedMetadata::from_set(set);
        write_bincode(&staging.join(METADATA_FILE), &metadata)?;

        write_bincode(&self.pointer_path(), &generation)?;
        self.remove_other_generations(generation);

        tracing::info!("Saved {} to {}", metadata.summary(), staging.display());
        Ok(())
    }

    fn generations(&self) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| generation_number(&entry.file_name().to_string_lossy()))
            .collect()
    }

    fn remove_other_generations(&self, keep: u64) {
        for generation in self.generations() {
            if generation == keep {
                continue;
            }
            let path = self.generation_dir(generation);
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    pub fn load_metadata(&self) -> Result<PersistedMetadata, PersistenceError> {
        read_metadata(&self.current_dir()?)
    }

    /// Load a usable model set. Categories whose network file is missing
    /// or corrupt are skipped with a warning.
    pub fn load(&self) -> Result<ModelSet, PersistenceError> {
        let dir = self.current_dir()?;
        let metadata = read_metadata(&dir)?;
        let referenced = metadata.model_count();
        let series: Vec<MonthlySeries> = read_bincode(&dir.join(SERIES_FILE))?;

        let mut set = ModelSet::new(metadata.created_at);
        for s in series {
            set.kinds.insert(
                s.kind,
                KindModels {
                    series: s,
                    models: BTreeMap::new(),
                },
            );
        }

        for (kind, artifacts) in metadata.categories {
            let kind_models = set
                .kinds
                .entry(kind)
                .or_insert_with(|| KindModels::empty(kind));

            for (id, artifact) in artifacts {
                let path = dir.join(&artifact.file_name);
                let network: BiLstmNetwork = match read_bincode(&path) {
                    Ok(network) => network,
                    Err(e) => {
                        tracing::warn!("Skipping {} category {}: {}", kind, id, e);
                        continue;
                    }
                };

                kind_models.models.insert(
                    id,
                    TrainedCategoryModel {
                        network,
                        scalers: artifact.scalers,
                        lookback: artifact.lookback,
                        metrics: artifact.metrics,
                        training_samples: artifact.training_samples,
                        epochs_run: artifact.epochs_run,
                    },
                );
            }
        }

        tracing::info!(
            "Loaded {} of {} category models from {}",
            set.model_count(),
            referenced,
            dir.display()
        );
        Ok(set)
    }
}

/// Errors that can occur during artifact persistence
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistenceError {
    #[error("artifact file not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("artifact version mismatch: expected v{expected}, found v{found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::IncidentRecord;
    use crate::ml::TrainingConfig;
    use crate::ml::training::train_all;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::tempdir;

    fn records(scale: u32) -> Vec<IncidentRecord> {
        let mut records = Vec::new();
        let kinds = [
            (CategoryKind::Complaints, 1),
            (CategoryKind::Complaints, 2),
            (CategoryKind::Emergencies, 5),
        ];
        for year in [2021, 2022] {
            for month in 1..=12 {
                for (kind, id) in kinds {
                    let at = NaiveDate::from_ymd_opt(year, month, 3)
                        .unwrap()
                        .and_hms_opt(9, 0, 0)
                        .unwrap();
                    for _ in 0..(month % 3 + id) * scale {
                        records.push(IncidentRecord::new(at, kind, id));
                    }
                }
            }
        }
        records
    }

    fn trained_set_from(records: &[IncidentRecord], created_day: u32) -> ModelSet {
        let config = TrainingConfig {
            epochs: 2,
            hidden_units: 3,
            dense_units: 3,
            ..TrainingConfig::default()
        };
        let created_at = Utc.with_ymd_and_hms(2024, 1, created_day, 0, 0, 0).unwrap();
        train_all(records, &config, created_at)
    }

    fn trained_set() -> ModelSet {
        trained_set_from(&records(1), 1)
    }

    fn count_center(set: &ModelSet) -> f64 {
        set.kinds[&CategoryKind::Complaints].models[&2]
            .scalers
            .count()
            .center
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("models"));
        let set = trained_set();

        store.save(&set).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.model_count(), 3);
        assert_eq!(loaded.created_at, set.created_at);
        let original = &set.kinds[&CategoryKind::Complaints].models[&2];
        let restored = &loaded.kinds[&CategoryKind::Complaints].models[&2];
        assert_eq!(original.network, restored.network);
        assert_eq!(original.scalers, restored.scalers);
        assert_eq!(
            loaded.kinds[&CategoryKind::Emergencies].series,
            set.kinds[&CategoryKind::Emergencies].series
        );
    }

    #[test]
    fn test_load_nonexistent() {
        let store = ArtifactStore::new("/nonexistent/path/models");
        let result = store.load();

        assert!(matches!(result, Err(PersistenceError::FileNotFound(_))));
    }

    #[test]
    fn test_missing_model_file_is_skipped() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save(&trained_set()).unwrap();
        let current = store.current_dir().unwrap();

        fs::remove_file(current.join(model_file_name(CategoryKind::Complaints, 1))).unwrap();
        fs::write(
            current.join(model_file_name(CategoryKind::Emergencies, 5)),
            b"garbage",
        )
        .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.model_count(), 1);
        assert!(loaded.kinds[&CategoryKind::Complaints].models.contains_key(&2));
    }

    #[test]
    fn test_save_replaces_previous_generation() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        store.save(&trained_set()).unwrap();
        let first = store.current_dir().unwrap();
        store.save(&trained_set_from(&records(3), 2)).unwrap();
        let second = store.current_dir().unwrap();

        assert_ne!(first, second);
        assert!(!first.exists());
        assert!(second.join(model_file_name(CategoryKind::Emergencies, 5)).exists());
    }

    #[test]
    fn test_failed_save_keeps_previous_generation_whole() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let old = trained_set();
        let new = trained_set_from(&records(7), 2);
        assert_ne!(count_center(&old), count_center(&new));

        store.save(&old).unwrap();
        // A directory where the pointer's temp file goes makes the final switch fail
        fs::create_dir(dir.path().join("current.tmp")).unwrap();

        assert!(matches!(store.save(&new), Err(PersistenceError::Io(_))));

        let loaded = store.load().unwrap();
        let network = &loaded.kinds[&CategoryKind::Complaints].models[&2].network;
        assert_eq!(loaded.created_at, old.created_at);
        assert_eq!(count_center(&loaded), count_center(&old));
        assert_eq!(network, &old.kinds[&CategoryKind::Complaints].models[&2].network);
    }

    #[test]
    fn test_partial_generation_is_ignored_and_replaced() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let old = trained_set();
        store.save(&old).unwrap();

        // Networks of an interrupted save, without series or metadata
        let partial = dir.path().join("generation-2");
        fs::create_dir(&partial).unwrap();
        fs::write(partial.join(model_file_name(CategoryKind::Complaints, 2)), b"new").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(count_center(&loaded), count_center(&old));
        assert_eq!(loaded.model_count(), 3);

        store.save(&trained_set_from(&records(2), 3)).unwrap();
        assert_eq!(store.current_dir().unwrap(), dir.path().join("generation-3"));
        assert!(!partial.exists());
        assert_eq!(store.load().unwrap().model_count(), 3);
    }

    #[test]
    fn test_other_version_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save(&trained_set()).unwrap();

        let mut metadata = store.load_metadata().unwrap();
        metadata.version = PersistedMetadata::CURRENT_VERSION + 1;
        let path = store.current_dir().unwrap().join(METADATA_FILE);
        write_bincode(&path, &metadata).unwrap();

        assert!(matches!(
            store.load(),
            Err(PersistenceError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_metadata_summary() {
        let metadata = PersistedMetadata::from_set(&trained_set());

        assert!(metadata.summary().contains("3 categories"));
        assert!(metadata.summary().contains("2024-01-01 00:00 UTC"));
    }

    #[test]
    fn test_write_bincode_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dirs").join("value.bin");

        write_bincode(&path, &vec![1u32, 2, 3]).unwrap();
        let value: Vec<u32> = read_bincode(&path).unwrap();

        assert_eq!(value, vec![1, 2, 3]);
    }
}
