//! Outlier-resistant feature scaling.

use serde::{Deserialize, Serialize};

use super::series::{COUNT_COLUMN, FEATURE_COUNT};

/// Centers on the median and scales by the interquartile range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobustScaler {
    pub center: f64,
    pub scale: f64,
}

impl RobustScaler {
    /// Fit on a column of values. Empty input yields the identity scaler.
    pub fn fit(values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::identity();
        }
        sorted.sort_by(f64::total_cmp);

        let center = quantile(&sorted, 0.5);
        let iqr = quantile(&sorted, 0.75) - quantile(&sorted, 0.25);
        let scale = if iqr.abs() < f64::EPSILON { 1.0 } else { iqr };

        Self { center, scale }
    }

    pub fn identity() -> Self {
        Self {
            center: 0.0,
            scale: 1.0,
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.center) / self.scale
    }

    pub fn inverse_transform(&self, value: f64) -> f64 {
        value * self.scale + self.center
    }
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// One scaler per feature column, including the target count column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScalers {
    columns: [RobustScaler; FEATURE_COUNT],
}

impl FeatureScalers {
    /// Fit every column independently on the given feature rows.
    pub fn fit(rows: &[[f64; FEATURE_COUNT]]) -> Self {
        let columns = std::array::from_fn(|col| {
            let values: Vec<f64> = rows.iter().map(|row| row[col]).collect();
            RobustScaler::fit(&values)
        });
        Self { columns }
    }

    pub fn transform_row(&self, row: &[f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        std::array::from_fn(|col| self.columns[col].transform(row[col]))
    }

    pub fn column(&self, index: usize) -> &RobustScaler {
        &self.columns[index]
    }

    /// Scaler of the target column.
    pub fn count(&self) -> &RobustScaler {
        &self.columns[COUNT_COLUMN]
    }
}
