//! Machine Learning module for incident forecasting
//!
//! One bidirectional LSTM per incident category predicts next-month counts
//! from a window of prior months. Forecasts further ahead are produced
//! iteratively and every intermediate month is cached.

pub mod cache;
pub mod forecast;
pub mod model;
pub mod network;
pub mod persistence;
pub mod quality;
pub mod scaler;
pub mod series;
pub mod training;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::{CategoryKind, IncidentRecord};
use crate::error::ForecastError;
use crate::traits::{Clock, SequenceRegressor};

use cache::{CacheStats, PredictionCache};
use forecast::CategoryForecaster;
use persistence::{ArtifactStore, PersistenceError};

pub use model::{ModelMetrics, ModelSet, TrainedCategoryModel, TrainingError};
pub use network::BiLstmNetwork;
pub use quality::ModelReport;
pub use series::{MonthlySeries, MonthlySeriesPoint, YearMonth};

/// Longest horizon accepted by [`IncidentForecaster::predict_range`].
pub const MAX_RANGE_MONTHS: usize = 24;

/// Configuration for model training and staleness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Months of context fed to the network
    pub lookback: usize,
    /// Months required on top of the lookback before a category is trained
    pub min_extra_months: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Chronological tail fraction held out for validation
    pub validation_split: f64,
    pub early_stopping_patience: usize,
    pub early_stopping_min_delta: f64,
    /// Epochs without improvement before the learning rate is reduced
    pub lr_patience: usize,
    pub lr_factor: f64,
    pub min_learning_rate: f64,
    pub hidden_units: usize,
    pub dense_units: usize,
    pub dropout: f64,
    pub l2: f64,
    pub huber_delta: f64,
    pub seed: u64,
    /// Loaded models older than this are reported stale
    pub max_model_age_hours: i64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lookback: 6,
            min_extra_months: 12,
            epochs: 300,
            batch_size: 4,
            learning_rate: 0.001,
            validation_split: 0.2,
            early_stopping_patience: 30,
            early_stopping_min_delta: 0.001,
            lr_patience: 10,
            lr_factor: 0.5,
            min_learning_rate: 1e-6,
            hidden_units: 32,
            dense_units: 16,
            dropout: 0.3,
            l2: 0.001,
            huber_delta: 1.0,
            seed: 42,
            max_model_age_hours: 24 * 30,
        }
    }
}

/// Predicted counts of every trained category for one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub year: i32,
    pub month: u32,
    pub predictions: BTreeMap<CategoryKind, BTreeMap<u32, u32>>,
}

impl ForecastResult {
    pub fn period(&self) -> YearMonth {
        YearMonth {
            year: self.year,
            month: self.month,
        }
    }

    pub fn kind_total(&self, kind: CategoryKind) -> u64 {
        self.predictions
            .get(&kind)
            .map(|m| m.values().map(|&v| v as u64).sum())
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        CategoryKind::ALL.iter().map(|k| self.kind_total(*k)).sum()
    }
}

/// Outcome of a retrain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainSummary {
    pub trained: BTreeMap<CategoryKind, usize>,
    pub skipped: BTreeMap<CategoryKind, usize>,
    pub created_at: DateTime<Utc>,
}

/// Explicit lifecycle of the loaded model set.
#[derive(Debug, Clone)]
pub enum ModelState<R = BiLstmNetwork> {
    Untrained,
    Ready(ModelSet<R>),
    /// Older than the configured maximum age; still serves forecasts
    Stale(ModelSet<R>),
}

impl<R> ModelState<R> {
    fn classify(set: ModelSet<R>, now: DateTime<Utc>, max_age_hours: i64) -> Self {
        if set.is_empty() {
            ModelState::Untrained
        } else if set.is_stale(now, max_age_hours) {
            ModelState::Stale(set)
        } else {
            ModelState::Ready(set)
        }
    }

    pub fn models(&self) -> Option<&ModelSet<R>> {
        match self {
            ModelState::Untrained => None,
            ModelState::Ready(set) | ModelState::Stale(set) => Some(set),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelState::Untrained => "untrained",
            ModelState::Ready(_) => "ready",
            ModelState::Stale(_) => "stale",
        }
    }
}

/// Forecasting service: owns the model set and the prediction cache.
pub struct IncidentForecaster<R = BiLstmNetwork> {
    state: ModelState<R>,
    cache: PredictionCache,
    cache_path: Option<PathBuf>,
    store: Option<ArtifactStore>,
    config: TrainingConfig,
    clock: Arc<dyn Clock>,
}

impl<R: SequenceRegressor> IncidentForecaster<R> {
    /// Service over an already built model set, without durable storage.
    pub fn with_models(set: ModelSet<R>, config: TrainingConfig, clock: Arc<dyn Clock>) -> Self {
        let state = ModelState::classify(set, clock.now_utc(), config.max_model_age_hours);
        Self {
            state,
            cache: PredictionCache::new(),
            cache_path: None,
            store: None,
            config,
            clock,
        }
    }

    /// Persist the cache to `path` after every forecast, loading what is there.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Result<Self, ForecastError> {
        let path = path.into();
        self.cache = PredictionCache::load(&path)?;
        self.cache_path = Some(path);
        Ok(self)
    }

    pub fn state(&self) -> &ModelState<R> {
        &self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    /// True when untrained or when the model set has outlived its max age.
    pub fn needs_retraining(&self) -> bool {
        match self.state.models() {
            None => true,
            Some(set) => set.is_stale(self.clock.now_utc(), self.config.max_model_age_hours),
        }
    }

    fn refresh_state(&mut self) {
        if !matches!(self.state, ModelState::Ready(_)) {
            return;
        }
        let now = self.clock.now_utc();
        let max_age = self.config.max_model_age_hours;
        self.state = match std::mem::replace(&mut self.state, ModelState::Untrained) {
            ModelState::Ready(set) if set.is_stale(now, max_age) => {
                tracing::warn!(
                    "Models trained at {} are older than {}h; retraining recommended",
                    set.created_at.format("%Y-%m-%d %H:%M UTC"),
                    max_age
                );
                ModelState::Stale(set)
            }
            other => other,
        };
    }

    fn persist_cache(&self) -> Result<(), ForecastError> {
        if let Some(path) = &self.cache_path {
            self.cache.save(path)?;
        }
        Ok(())
    }

    /// Forecast every trained category for `year`-`month`.
    pub fn predict_month(
        &mut self,
        year: i32,
        month: u32,
    ) -> Result<ForecastResult, ForecastError> {
        let target = YearMonth::new(year, month).ok_or(ForecastError::InvalidMonth(month))?;
        self.refresh_state();

        let set = self.state.models().ok_or(ForecastError::ModelNotTrained)?;
        let last = set.last_period().ok_or(ForecastError::ModelNotTrained)?;
        if target <= last {
            return Err(ForecastError::InvalidTargetPeriod {
                year,
                month,
                last_year: last.year,
                last_month: last.month,
            });
        }

        let mut stats = CacheStats::default();
        let mut predictions = BTreeMap::new();

        for kind in CategoryKind::ALL {
            let mut per_category = BTreeMap::new();
            if let Some(kind_models) = set.kinds.get(&kind) {
                let category_count = kind_models.series.category_count();
                for (&category_id, model) in &kind_models.models {
                    let history = kind_models.series.category_points(category_id);
                    let forecaster = CategoryForecaster {
                        kind,
                        category_id,
                        model,
                        history: &history,
                        category_count,
                    };
                    match forecaster.forecast(target, &mut self.cache, &mut stats) {
                        Some(value) => {
                            per_category.insert(category_id, value);
                        }
                        None => tracing::warn!(
                            "No forecast for {} category {}: history shorter than lookback",
                            kind,
                            category_id
                        ),
                    }
                }
            }
            predictions.insert(kind, per_category);
        }

        tracing::debug!(
            target = %target,
            hits = stats.hits,
            misses = stats.misses,
            "Forecast complete"
        );
        self.persist_cache()?;

        Ok(ForecastResult {
            year,
            month,
            predictions,
        })
    }

    /// Forecast `months` consecutive months starting at `start_year`-`start_month`.
    pub fn predict_range(
        &mut self,
        start_year: i32,
        start_month: u32,
        months: usize,
    ) -> Result<Vec<ForecastResult>, ForecastError> {
        if months == 0 || months > MAX_RANGE_MONTHS {
            return Err(ForecastError::InvalidParameter(format!(
                "months must be between 1 and {}, got {}",
                MAX_RANGE_MONTHS, months
            )));
        }
        let mut period =
            YearMonth::new(start_year, start_month)
                .ok_or(ForecastError::InvalidMonth(start_month))?;

        let mut results = Vec::with_capacity(months);
        for _ in 0..months {
            results.push(self.predict_month(period.year, period.month)?);
            period = period.next();
        }
        Ok(results)
    }

    /// Held-out metrics per kind and category.
    pub fn metrics(
        &self,
    ) -> Result<BTreeMap<CategoryKind, BTreeMap<u32, ModelMetrics>>, ForecastError> {
        self.state
            .models()
            .map(ModelSet::metrics)
            .ok_or(ForecastError::ModelNotTrained)
    }

    pub fn model_report(&self) -> Result<ModelReport, ForecastError> {
        let set = self.state.models().ok_or(ForecastError::ModelNotTrained)?;
        Ok(quality::build_report(set, self.clock.now_utc()))
    }

    pub fn clear_cache(&mut self) -> Result<(), ForecastError> {
        let cleared = self.cache.len();
        self.cache.clear();
        self.persist_cache()?;
        tracing::info!("Cleared {} cached predictions", cleared);
        Ok(())
    }
}

impl IncidentForecaster<BiLstmNetwork> {
    /// Untrained in-memory service.
    pub fn new(config: TrainingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: ModelState::Untrained,
            cache: PredictionCache::new(),
            cache_path: None,
            store: None,
            config,
            clock,
        }
    }

    /// Load models from `model_dir` and the cache from `cache_path`.
    ///
    /// Missing or unreadable artifacts leave the service untrained.
    pub fn open(
        model_dir: &Path,
        cache_path: &Path,
        config: TrainingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = ArtifactStore::new(model_dir);

        let state = match store.load() {
            Ok(set) => {
                let state = ModelState::classify(set, clock.now_utc(), config.max_model_age_hours);
                if let ModelState::Stale(set) = &state {
                    tracing::warn!(
                        "Loaded models from {} are stale (trained {})",
                        model_dir.display(),
                        set.created_at.format("%Y-%m-%d %H:%M UTC")
                    );
                }
                state
            }
            Err(PersistenceError::FileNotFound(_)) => {
                tracing::info!("No trained models found in {}", model_dir.display());
                ModelState::Untrained
            }
            Err(e) => {
                tracing::warn!("Failed to load models from {}: {}", model_dir.display(), e);
                ModelState::Untrained
            }
        };

        let cache = PredictionCache::load(cache_path).unwrap_or_else(|e| {
            tracing::warn!("Discarding unreadable prediction cache: {}", e);
            PredictionCache::new()
        });

        Self {
            state,
            cache,
            cache_path: Some(cache_path.to_path_buf()),
            store: Some(store),
            config,
            clock,
        }
    }

    /// Train every category from `records`, replacing the model set and
    /// clearing the cache.
    pub fn retrain(&mut self, records: &[IncidentRecord]) -> Result<RetrainSummary, ForecastError> {
        let created_at = self.clock.now_utc();
        let set = training::train_all(records, &self.config, created_at);

        let trained = set.kinds.iter().map(|(k, m)| (*k, m.models.len())).collect();
        let skipped = set
            .kinds
            .iter()
            .map(|(k, m)| (*k, m.series.category_count() - m.models.len()))
            .collect();

        if let Some(store) = &self.store {
            store.save(&set)?;
        }

        self.cache.clear();
        self.persist_cache()?;

        if set.is_empty() {
            tracing::warn!("Retraining produced no models; every category lacked history");
        }
        self.state = ModelState::classify(set, created_at, self.config.max_model_age_hours);

        Ok(RetrainSummary {
            trained,
            skipped,
            created_at,
        })
    }
}
