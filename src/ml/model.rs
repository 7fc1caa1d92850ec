//! Per-category sequence model and its training loop

use std::collections::BTreeMap;
use std::sync::Mutex;

use burn::backend::ndarray::NdArrayDevice;
use burn::module::AutodiffModule;
use burn::nn::loss::{HuberLossConfig, Reduction};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::CategoryKind;
use crate::traits::SequenceRegressor;

use super::TrainingConfig;
use super::network::{
    BiLstmNetwork, NetworkShape, SequenceNet, TrainingBackend, evaluate, scalar, target_tensor,
    window_tensor,
};
use super::scaler::FeatureScalers;
use super::series::{FEATURE_COUNT, MonthlySeries, YearMonth};

/// Held-out error in raw-count units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mae: f64,
    pub rmse: f64,
}

impl ModelMetrics {
    /// Compute MAE and RMSE. Predictions are clamped to zero first.
    pub fn from_predictions(predictions: &[f64], targets: &[f64]) -> Self {
        if predictions.is_empty() || predictions.len() != targets.len() {
            return Self {
                mae: f64::NAN,
                rmse: f64::NAN,
            };
        }

        let n = predictions.len() as f64;
        let (abs_sum, sq_sum) = predictions
            .iter()
            .zip(targets)
            .fold((0.0, 0.0), |(abs_sum, sq_sum), (p, t)| {
                let err = p.max(0.0) - t;
                (abs_sum + err.abs(), sq_sum + err * err)
            });

        Self {
            mae: abs_sum / n,
            rmse: (sq_sum / n).sqrt(),
        }
    }
}

/// A fitted model for one incident category.
#[derive(Debug, Clone)]
pub struct TrainedCategoryModel<R = BiLstmNetwork> {
    pub network: R,
    pub scalers: FeatureScalers,
    pub lookback: usize,
    pub metrics: ModelMetrics,
    /// Number of supervised windows used for fitting
    pub training_samples: usize,
    pub epochs_run: usize,
}

impl<R: SequenceRegressor> TrainedCategoryModel<R> {
    /// Predict the raw count following the last `lookback` feature rows.
    ///
    /// Returns `None` when fewer rows than the lookback are supplied. The
    /// result is inverse-transformed but not clamped.
    pub fn predict_next<'a, I>(&self, rows: I) -> Option<f64>
    where
        I: IntoIterator<Item = &'a [f64; FEATURE_COUNT]>,
        I::IntoIter: ExactSizeIterator,
    {
        let rows = rows.into_iter();
        let available = rows.len();
        if available < self.lookback {
            return None;
        }

        let mut window = Array2::zeros((self.lookback, FEATURE_COUNT));
        for (i, row) in rows.skip(available - self.lookback).enumerate() {
            let scaled = self.scalers.transform_row(row);
            for (j, value) in scaled.iter().enumerate() {
                window[[i, j]] = *value;
            }
        }

        let scaled_output = self.network.predict(window.view());
        Some(self.scalers.count().inverse_transform(scaled_output))
    }
}

/// Models and their source series for one category kind.
#[derive(Debug, Clone)]
pub struct KindModels<R = BiLstmNetwork> {
    pub series: MonthlySeries,
    pub models: BTreeMap<u32, TrainedCategoryModel<R>>,
}

impl<R> KindModels<R> {
    pub fn empty(kind: CategoryKind) -> Self {
        Self {
            series: MonthlySeries::build(kind, &[]),
            models: BTreeMap::new(),
        }
    }
}

/// Every trained model, replaced wholesale on retrain.
#[derive(Debug, Clone)]
pub struct ModelSet<R = BiLstmNetwork> {
    pub kinds: BTreeMap<CategoryKind, KindModels<R>>,
    pub created_at: DateTime<Utc>,
}

impl<R> ModelSet<R> {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            kinds: BTreeMap::new(),
            created_at,
        }
    }

    pub fn model_count(&self) -> usize {
        self.kinds.values().map(|k| k.models.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.model_count() == 0
    }

    /// The later of the kinds' last historical months.
    pub fn last_period(&self) -> Option<YearMonth> {
        self.kinds
            .values()
            .filter_map(|k| k.series.last_period())
            .max()
    }

    pub fn metrics(&self) -> BTreeMap<CategoryKind, BTreeMap<u32, ModelMetrics>> {
        CategoryKind::ALL
            .iter()
            .map(|kind| {
                let per_category = self
                    .kinds
                    .get(kind)
                    .map(|k| k.models.iter().map(|(id, m)| (*id, m.metrics)).collect())
                    .unwrap_or_default();
                (*kind, per_category)
            })
            .collect()
    }

    /// Whether the set is older than `max_age_hours` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_hours: i64) -> bool {
        (now - self.created_at).num_hours() > max_age_hours
    }
}

/// Outcome of one fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub epochs_run: usize,
    pub best_validation_loss: f64,
    pub final_learning_rate: f64,
    pub stopped_early: bool,
}

// The backend RNG is process-wide; a fit holds this lock so its seed alone
// determines initialization and dropout.
static BACKEND_RNG: Mutex<()> = Mutex::new(());

/// Fits a [`BiLstmNetwork`] on scaled windows.
pub struct ModelBuilder {
    config: TrainingConfig,
}

impl ModelBuilder {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    fn shape(&self) -> NetworkShape {
        NetworkShape {
            input_size: FEATURE_COUNT,
            hidden_size: self.config.hidden_units,
            dense_size: self.config.dense_units,
        }
    }

    fn optimizer_config(&self) -> AdamConfig {
        let weight_decay =
            (self.config.l2 > 0.0).then(|| WeightDecayConfig::new(self.config.l2 as f32));
        AdamConfig::new()
            .with_epsilon(1e-7)
            .with_weight_decay(weight_decay)
    }

    /// Train with early stopping on the validation windows.
    ///
    /// The network with the lowest validation loss is returned.
    pub fn train_with_validation(
        &self,
        train_windows: &[Array2<f64>],
        train_targets: &[f64],
        val_windows: &[Array2<f64>],
        val_targets: &[f64],
    ) -> Result<(BiLstmNetwork, FitReport), TrainingError> {
        if train_windows.len() != train_targets.len() {
            return Err(TrainingError::MismatchedLengths {
                features: train_windows.len(),
                targets: train_targets.len(),
            });
        }
        if val_windows.len() != val_targets.len() {
            return Err(TrainingError::MismatchedLengths {
                features: val_windows.len(),
                targets: val_targets.len(),
            });
        }
        if train_windows.is_empty() {
            return Err(TrainingError::InsufficientData { needed: 1, got: 0 });
        }
        if val_windows.is_empty() {
            return Err(TrainingError::EmptyValidation);
        }

        let _rng_guard = BACKEND_RNG.lock().unwrap_or_else(|e| e.into_inner());

        let cfg = &self.config;
        let shape = self.shape();
        let device = NdArrayDevice::default();
        TrainingBackend::seed(cfg.seed);
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let mut module = SequenceNet::<TrainingBackend>::new(&shape, cfg.dropout, &device);
        let mut optimizer = self
            .optimizer_config()
            .init::<TrainingBackend, SequenceNet<TrainingBackend>>();
        let huber = HuberLossConfig::new(cfg.huber_delta as f32).init();
        let mut learning_rate = cfg.learning_rate;

        let mut best = module.valid();
        let mut best_loss = f64::INFINITY;
        let mut stall = 0;
        let mut plateau_best = f64::INFINITY;
        let mut plateau_stall = 0;
        let mut stopped_early = false;
        let mut epochs_run = 0;

        let mut order: Vec<usize> = (0..train_windows.len()).collect();
        let batch_size = cfg.batch_size.max(1);

        for epoch in 0..cfg.epochs {
            epochs_run = epoch + 1;
            order.shuffle(&mut rng);

            for batch in order.chunks(batch_size) {
                let windows: Vec<ArrayView2<f64>> =
                    batch.iter().map(|&i| train_windows[i].view()).collect();
                let targets: Vec<f64> = batch.iter().map(|&i| train_targets[i]).collect();

                let predictions = module.forward(window_tensor(&windows, &device));
                let loss = huber.forward(
                    predictions,
                    target_tensor(&targets, &device),
                    Reduction::Mean,
                );
                if !scalar(loss.clone()).is_finite() {
                    return Err(TrainingError::NonFiniteLoss { epoch });
                }

                let grads = GradientsParams::from_grads(loss.backward(), &module);
                module = optimizer.step(learning_rate, module, grads);
            }

            let snapshot = module.valid();
            let val_loss = evaluate(&snapshot, val_windows, val_targets, &huber);
            if !val_loss.is_finite() {
                return Err(TrainingError::NonFiniteLoss { epoch });
            }

            if val_loss < best_loss - cfg.early_stopping_min_delta {
                best_loss = val_loss;
                best = snapshot;
                stall = 0;
            } else {
                stall += 1;
                if stall >= cfg.early_stopping_patience {
                    tracing::debug!(
                        "Early stopping at epoch {} (best val loss {:.4})",
                        epoch + 1,
                        best_loss
                    );
                    stopped_early = true;
                    break;
                }
            }

            if val_loss < plateau_best {
                plateau_best = val_loss;
                plateau_stall = 0;
            } else {
                plateau_stall += 1;
                if plateau_stall >= cfg.lr_patience && learning_rate > cfg.min_learning_rate {
                    learning_rate = (learning_rate * cfg.lr_factor).max(cfg.min_learning_rate);
                    plateau_stall = 0;
                    tracing::debug!("Reducing learning rate to {:.2e}", learning_rate);
                }
            }
        }

        let network = BiLstmNetwork::from_module(shape, best)
            .map_err(|e| TrainingError::Weights(e.to_string()))?;

        Ok((
            network,
            FitReport {
                epochs_run,
                best_validation_loss: best_loss,
                final_learning_rate: learning_rate,
                stopped_early,
            },
        ))
    }
}

/// Errors that can occur during model training
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("insufficient data for training: need {needed} points, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("feature and target lengths mismatch: {features} vs {targets}")]
    MismatchedLengths { features: usize, targets: usize },

    #[error("training diverged: non-finite loss at epoch {epoch}")]
    NonFiniteLoss { epoch: usize },

    #[error("chronological split left no validation samples")]
    EmptyValidation,

    #[error("failed to record network weights: {0}")]
    Weights(String),
}
