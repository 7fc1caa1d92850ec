use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::ml::TrainingConfig;
use crate::spatial::SpatialConfig;
use crate::spatial::criticality::CriticalityThresholds;

const APP_DIR: &str = "incident-forecast";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub spatial: SpatialConfig,
    #[serde(default)]
    pub criticality: CriticalityThresholds,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding model artifacts and the monthly series
    pub model_dir: PathBuf,
    pub cache_path: PathBuf,
    pub spatial_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            cache_path: data_dir.join("prediction_cache.bin"),
            spatial_path: data_dir.join("spatial_model.bin"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// Incident feed read by `train` and `spatial-train`
    pub csv_path: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("incidents.csv"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load the layered configuration, with `extra` (when given) taking
    /// precedence over the config files but not over the environment.
    pub fn load_with(extra: Option<&Path>) -> Result<Self> {
        // Missing .env is fine, plain environment variables still apply
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        let storage = StorageConfig::default();
        let dataset = DatasetConfig::default();
        let training = TrainingConfig::default();
        let spatial = SpatialConfig::default();
        let criticality = CriticalityThresholds::default();

        let mut builder = Config::builder()
            // 1. Defaults
            // Storage
            .set_default("storage.model_dir", path_value(&storage.model_dir))?
            .set_default("storage.cache_path", path_value(&storage.cache_path))?
            .set_default("storage.spatial_path", path_value(&storage.spatial_path))?
            // Dataset
            .set_default("dataset.csv_path", path_value(&dataset.csv_path))?
            // Training
            .set_default("training.lookback", training.lookback as u64)?
            .set_default("training.min_extra_months", training.min_extra_months as u64)?
            .set_default("training.epochs", training.epochs as u64)?
            .set_default("training.batch_size", training.batch_size as u64)?
            .set_default("training.learning_rate", training.learning_rate)?
            .set_default("training.validation_split", training.validation_split)?
            .set_default("training.seed", training.seed)?
            .set_default("training.max_model_age_hours", training.max_model_age_hours)?
            // Spatial
            .set_default("spatial.grid_rows", spatial.grid_rows as u64)?
            .set_default("spatial.grid_cols", spatial.grid_cols as u64)?
            .set_default("spatial.bounds_margin", spatial.bounds_margin)?
            // Criticality
            .set_default("criticality.very_high", criticality.very_high)?
            .set_default("criticality.high", criticality.high)?
            .set_default("criticality.medium", criticality.medium)?
            .set_default("criticality.low", criticality.low)?
            // 2. Local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))
            // 3. User config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false));

        if let Some(path) = extra {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        // 4. Environment variables (INCIDENT__TRAINING__EPOCHS=50)
        let builder = builder.add_source(Environment::with_prefix("INCIDENT").separator("__"));

        let settings = builder.build().context("Failed to read configuration sources")?;
        let config: AppConfig = settings
            .try_deserialize()
            .context("Invalid configuration values")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.training.lookback == 0 {
            anyhow::bail!("training.lookback must be at least 1");
        }
        if !(0.0..1.0).contains(&self.training.validation_split) {
            anyhow::bail!("training.validation_split must be in [0, 1)");
        }
        if self.spatial.grid_rows == 0 || self.spatial.grid_cols == 0 {
            anyhow::bail!("spatial grid dimensions must be at least 1");
        }
        let c = &self.criticality;
        if !(c.low <= c.medium && c.medium <= c.high && c.high <= c.very_high) {
            anyhow::bail!("criticality thresholds must be ascending");
        }
        Ok(())
    }
}
