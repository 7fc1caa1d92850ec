//! Training pipeline for the per-category models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::Array2;

use crate::dataset::{CategoryKind, IncidentRecord};
use crate::traits::SequenceRegressor;

use super::TrainingConfig;
use super::model::{
    KindModels, ModelBuilder, ModelMetrics, ModelSet, TrainedCategoryModel, TrainingError,
};
use super::scaler::FeatureScalers;
use super::series::{COUNT_COLUMN, FEATURE_COUNT, MonthlySeries, MonthlySeriesPoint};

/// Supervised windows built from one category's series.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub scalers: FeatureScalers,
    /// Scaled `lookback x FEATURE_COUNT` windows
    pub windows: Vec<Array2<f64>>,
    /// Scaled count following each window
    pub targets: Vec<f64>,
    /// Raw count following each window
    pub raw_targets: Vec<f64>,
}

/// Turns a dense category series into scaled sliding windows.
pub struct TrainingDataPreparer {
    lookback: usize,
    min_extra_months: usize,
}

impl TrainingDataPreparer {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            lookback: config.lookback.max(1),
            min_extra_months: config.min_extra_months,
        }
    }

    /// Minimum number of monthly points a category needs.
    pub fn required_points(&self) -> usize {
        self.lookback + self.min_extra_months
    }

    pub fn prepare(&self, points: &[&MonthlySeriesPoint]) -> Result<PreparedData, TrainingError> {
        let needed = self.required_points().max(self.lookback + 1);
        if points.len() < needed {
            return Err(TrainingError::InsufficientData {
                needed,
                got: points.len(),
            });
        }

        let rows: Vec<[f64; FEATURE_COUNT]> = points.iter().map(|p| p.features()).collect();
        let scalers = FeatureScalers::fit(&rows);
        let scaled: Vec<[f64; FEATURE_COUNT]> =
            rows.iter().map(|r| scalers.transform_row(r)).collect();

        let samples = rows.len() - self.lookback;
        let mut windows = Vec::with_capacity(samples);
        let mut targets = Vec::with_capacity(samples);
        let mut raw_targets = Vec::with_capacity(samples);

        for start in 0..samples {
            let end = start + self.lookback;
            let window = Array2::from_shape_fn((self.lookback, FEATURE_COUNT), |(t, f)| {
                scaled[start + t][f]
            });
            windows.push(window);
            targets.push(scaled[end][COUNT_COLUMN]);
            raw_targets.push(rows[end][COUNT_COLUMN]);
        }

        Ok(PreparedData {
            scalers,
            windows,
            targets,
            raw_targets,
        })
    }
}

/// Chronological split index for `samples` windows.
fn split_index(samples: usize, validation_split: f64) -> usize {
    let train = ((1.0 - validation_split.clamp(0.0, 1.0)) * samples as f64) as usize;
    train.clamp(1, samples.saturating_sub(1).max(1))
}

/// Train one category on its dense monthly series.
pub fn train_category(
    points: &[&MonthlySeriesPoint],
    config: &TrainingConfig,
) -> Result<TrainedCategoryModel, TrainingError> {
    let preparer = TrainingDataPreparer::new(config);
    let data = preparer.prepare(points)?;

    let split = split_index(data.windows.len(), config.validation_split);
    let builder = ModelBuilder::new(config.clone());
    let (network, report) = builder.train_with_validation(
        &data.windows[..split],
        &data.targets[..split],
        &data.windows[split..],
        &data.targets[split..],
    )?;

    let count_scaler = data.scalers.count();
    let predictions: Vec<f64> = data.windows[split..]
        .iter()
        .map(|w| count_scaler.inverse_transform(network.predict(w.view())))
        .collect();
    let metrics = ModelMetrics::from_predictions(&predictions, &data.raw_targets[split..]);

    Ok(TrainedCategoryModel {
        network,
        scalers: data.scalers,
        lookback: preparer.lookback,
        metrics,
        training_samples: split,
        epochs_run: report.epochs_run,
    })
}

/// Train every category of one kind. Untrainable categories are logged and skipped.
pub fn train_kind(
    kind: CategoryKind,
    records: &[IncidentRecord],
    config: &TrainingConfig,
) -> KindModels {
    let series = MonthlySeries::build(kind, records);
    let mut models = BTreeMap::new();

    for &category_id in series.categories() {
        let points = series.category_points(category_id);
        match train_category(&points, config) {
            Ok(model) => {
                tracing::info!(
                    "Trained {} category {}: MAE={:.2}, RMSE={:.2} ({} epochs)",
                    kind,
                    category_id,
                    model.metrics.mae,
                    model.metrics.rmse,
                    model.epochs_run
                );
                models.insert(category_id, model);
            }
            Err(TrainingError::InsufficientData { needed, got }) => {
                tracing::warn!(
                    "Skipping {} category {}: {} monthly points, {} required",
                    kind,
                    category_id,
                    got,
                    needed
                );
            }
            Err(e) => {
                tracing::warn!("Skipping {} category {}: {}", kind, category_id, e);
            }
        }
    }

    KindModels { series, models }
}

/// Train models for both kinds.
pub fn train_all(
    records: &[IncidentRecord],
    config: &TrainingConfig,
    created_at: DateTime<Utc>,
) -> ModelSet {
    let mut set = ModelSet::new(created_at);
    for kind in CategoryKind::ALL {
        let kind_models = train_kind(kind, records, config);
        tracing::info!(
            "{}: {} of {} categories trained",
            kind,
            kind_models.models.len(),
            kind_models.series.category_count()
        );
        set.kinds.insert(kind, kind_models);
    }
    set
}
