//! Model quality report built from held-out metrics and history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::CategoryKind;

use super::model::ModelSet;
use super::series::YearMonth;

/// Tier of a category's relative error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionTier {
    Excellent,
    Good,
    Moderate,
    Fair,
    Poor,
}

impl PrecisionTier {
    pub fn from_relative_error(relative_error: f64) -> Self {
        match relative_error {
            e if e < 10.0 => Self::Excellent,
            e if e < 20.0 => Self::Good,
            e if e < 35.0 => Self::Moderate,
            e if e < 50.0 => Self::Fair,
            _ => Self::Poor,
        }
    }
}

/// Tier of a kind's mean absolute error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaeTier {
    Excellent,
    Good,
    Moderate,
    Fair,
}

impl MaeTier {
    pub fn from_mae(mae: f64) -> Self {
        match mae {
            m if m < 2.0 => Self::Excellent,
            m if m < 4.0 => Self::Good,
            m if m < 6.0 => Self::Moderate,
            _ => Self::Fair,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Excellent,
    Good,
    Acceptable,
    NeedsImprovement,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 85.0 => Self::Excellent,
            s if s >= 70.0 => Self::Good,
            s if s >= 55.0 => Self::Acceptable,
            _ => Self::NeedsImprovement,
        }
    }
}

/// Monthly count statistics of one category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalStats {
    pub mean: f64,
    pub max: u32,
    pub min: u32,
    /// Sample standard deviation
    pub std_dev: f64,
    pub months: usize,
}

impl HistoricalStats {
    pub fn from_counts(counts: &[u32]) -> Self {
        if counts.is_empty() {
            return Self {
                mean: 0.0,
                max: 0,
                min: 0,
                std_dev: 0.0,
                months: 0,
            };
        }

        let n = counts.len() as f64;
        let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / n;
        let std_dev = if counts.len() > 1 {
            let var = counts.iter().map(|&c| (c as f64 - mean).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt()
        } else {
            0.0
        };

        Self {
            mean,
            max: counts.iter().copied().max().unwrap_or(0),
            min: counts.iter().copied().min().unwrap_or(0),
            std_dev,
            months: counts.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category_id: u32,
    pub mae: f64,
    pub rmse: f64,
    pub history: HistoricalStats,
    /// MAE as a percentage of the historical mean
    pub relative_error: f64,
    pub precision: f64,
    pub tier: PrecisionTier,
}

/// Mean, min and max of one metric across categories.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSummary {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            mean: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindReport {
    pub kind: CategoryKind,
    pub categories: Vec<CategoryReport>,
    pub mae: Option<MetricSummary>,
    pub rmse: Option<MetricSummary>,
    pub mae_tier: Option<MaeTier>,
    pub quality_score: Option<f64>,
    pub quality_level: Option<QualityLevel>,
    pub first_period: Option<YearMonth>,
    pub last_period: Option<YearMonth>,
    /// Categories present in the history, trained or not
    pub category_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub generated_at: DateTime<Utc>,
    pub trained_at: DateTime<Utc>,
    pub kinds: Vec<KindReport>,
}

/// Global score from the mean relative error, in 0..=100.
pub fn quality_score(mean_relative_error: f64) -> f64 {
    (100.0 - 1.5 * mean_relative_error).clamp(0.0, 100.0)
}

fn category_report(category_id: u32, mae: f64, rmse: f64, counts: &[u32]) -> CategoryReport {
    let history = HistoricalStats::from_counts(counts);
    let relative_error = if history.mean > 0.0 {
        mae / history.mean * 100.0
    } else {
        0.0
    };

    CategoryReport {
        category_id,
        mae,
        rmse,
        history,
        relative_error,
        precision: (100.0 - relative_error).max(0.0),
        tier: PrecisionTier::from_relative_error(relative_error),
    }
}

/// Build the report for every kind in `set`.
pub fn build_report<R>(set: &ModelSet<R>, generated_at: DateTime<Utc>) -> ModelReport {
    let kinds = CategoryKind::ALL
        .iter()
        .filter_map(|kind| set.kinds.get(kind).map(|k| (*kind, k)))
        .map(|(kind, kind_models)| {
            let categories: Vec<CategoryReport> = kind_models
                .models
                .iter()
                .map(|(id, model)| {
                    let counts: Vec<u32> = kind_models
                        .series
                        .category_points(*id)
                        .iter()
                        .map(|p| p.count)
                        .collect();
                    category_report(*id, model.metrics.mae, model.metrics.rmse, &counts)
                })
                .collect();

            let maes: Vec<f64> = categories.iter().map(|c| c.mae).collect();
            let rmses: Vec<f64> = categories.iter().map(|c| c.rmse).collect();
            let relative: Vec<f64> = categories.iter().map(|c| c.relative_error).collect();

            let mae = MetricSummary::from_values(&maes);
            let score = MetricSummary::from_values(&relative).map(|r| quality_score(r.mean));

            KindReport {
                kind,
                mae,
                rmse: MetricSummary::from_values(&rmses),
                mae_tier: mae.map(|m| MaeTier::from_mae(m.mean)),
                quality_score: score,
                quality_level: score.map(QualityLevel::from_score),
                first_period: kind_models.series.first_period(),
                last_period: kind_models.series.last_period(),
                category_count: kind_models.series.category_count(),
                categories,
            }
        })
        .collect();

    ModelReport {
        generated_at,
        trained_at: set.created_at,
        kinds,
    }
}
