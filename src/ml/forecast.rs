//! Iterative multi-step forecasting over a category's history

use std::collections::VecDeque;

use crate::dataset::CategoryKind;
use crate::traits::SequenceRegressor;

use super::cache::{CacheKey, CacheStats, PredictionCache};
use super::model::TrainedCategoryModel;
use super::series::{FEATURE_COUNT, MonthlySeriesPoint, YearMonth};

/// Convert a raw model output into a count.
pub fn to_count(value: f64) -> u32 {
    // NaN maps to 0 through max
    value.max(0.0).round().min(u32::MAX as f64) as u32
}

/// Forecasts one category step by step up to a target month.
pub struct CategoryForecaster<'a, R> {
    pub kind: CategoryKind,
    pub category_id: u32,
    pub model: &'a TrainedCategoryModel<R>,
    /// Chronological history of the category
    pub history: &'a [&'a MonthlySeriesPoint],
    /// Categories in the kind; the trend index advances by this much per month
    pub category_count: usize,
}

impl<R: SequenceRegressor> CategoryForecaster<'_, R> {
    /// Predicted count for `target`, caching every intermediate month.
    ///
    /// Returns `None` when `target` is not after the last historical month
    /// or the history is too short to fill the lookback window. Months that
    /// could not be inferred are never cached.
    pub fn forecast(
        &self,
        target: YearMonth,
        cache: &mut PredictionCache,
        stats: &mut CacheStats,
    ) -> Option<u32> {
        let target_key = CacheKey::new(self.kind, self.category_id, target);
        if let Some(value) = cache.get(&target_key) {
            stats.hits += 1;
            return Some(value);
        }

        let lookback = self.model.lookback;
        let last = self.history.last()?;
        if target <= last.period() {
            return None;
        }

        let start = self.history.len().saturating_sub(lookback);
        let mut buffer: VecDeque<[f64; FEATURE_COUNT]> =
            self.history[start..].iter().map(|p| p.features()).collect();
        let mut trend = last.trend;
        let step = self.category_count.max(1) as f64;
        let mut value = 0;

        for period in last.period().months_through(target) {
            let key = CacheKey::new(self.kind, self.category_id, period);
            value = cache.get_or_try_insert_with(key, stats, || {
                self.model.predict_next(buffer.iter()).map(to_count)
            })?;

            trend += step;
            let row = MonthlySeriesPoint::new(period, self.category_id, value, trend);
            buffer.push_back(row.features());
            if buffer.len() > lookback {
                buffer.pop_front();
            }
        }

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::ModelMetrics;
    use crate::ml::scaler::FeatureScalers;
    use crate::traits::CountingRegressor;

    fn history(months: usize) -> Vec<MonthlySeriesPoint> {
        let mut period = YearMonth::new(2023, 1).unwrap();
        (0..months)
            .map(|i| {
                let count = 10 + (i % 4) as u32;
                let point = MonthlySeriesPoint::new(period, 3, count, (i * 2) as f64);
                period = period.next();
                point
            })
            .collect()
    }

    fn model(
        regressor: CountingRegressor,
        points: &[MonthlySeriesPoint],
    ) -> TrainedCategoryModel<CountingRegressor> {
        let rows: Vec<_> = points.iter().map(|p| p.features()).collect();
        TrainedCategoryModel {
            network: regressor,
            scalers: FeatureScalers::fit(&rows),
            lookback: 6,
            metrics: ModelMetrics { mae: 1.0, rmse: 1.0 },
            training_samples: 10,
            epochs_run: 1,
        }
    }

    #[test]
    fn test_to_count_clamps_and_rounds() {
        assert_eq!(to_count(-3.2), 0);
        assert_eq!(to_count(2.5), 3);
        assert_eq!(to_count(2.49), 2);
        assert_eq!(to_count(f64::NAN), 0);
    }

    #[test]
    fn test_multi_step_caches_every_intermediate_month() {
        let points = history(12);
        let refs: Vec<&MonthlySeriesPoint> = points.iter().collect();
        let regressor = CountingRegressor::new(0.0);
        let model = model(regressor.clone(), &points);
        let forecaster = CategoryForecaster {
            kind: CategoryKind::Complaints,
            category_id: 3,
            model: &model,
            history: &refs,
            category_count: 2,
        };
        let mut cache = PredictionCache::new();
        let mut stats = CacheStats::default();

        let target = YearMonth::new(2024, 3).unwrap();
        let value = forecaster.forecast(target, &mut cache, &mut stats).unwrap();

        assert_eq!(regressor.calls(), 3);
        assert_eq!(cache.len(), 3);
        for month in 1..=3 {
            let period = YearMonth::new(2024, month).unwrap();
            assert!(cache.contains(&CacheKey::new(CategoryKind::Complaints, 3, period)));
        }
        assert_eq!(cache.get(&CacheKey::new(CategoryKind::Complaints, 3, target)), Some(value));

        // Earlier month is now a pure cache hit
        let jan = forecaster
            .forecast(YearMonth::new(2024, 1).unwrap(), &mut cache, &mut stats)
            .unwrap();
        assert_eq!(regressor.calls(), 3);
        let jan_key = CacheKey::new(CategoryKind::Complaints, 3, YearMonth::new(2024, 1).unwrap());
        assert_eq!(Some(jan), cache.get(&jan_key));
    }

    #[test]
    fn test_reuses_cached_intermediate_months() {
        let points = history(12);
        let refs: Vec<&MonthlySeriesPoint> = points.iter().collect();
        let regressor = CountingRegressor::new(0.0);
        let model = model(regressor.clone(), &points);
        let forecaster = CategoryForecaster {
            kind: CategoryKind::Complaints,
            category_id: 3,
            model: &model,
            history: &refs,
            category_count: 1,
        };
        let mut cache = PredictionCache::new();
        let mut stats = CacheStats::default();

        forecaster.forecast(YearMonth::new(2024, 2).unwrap(), &mut cache, &mut stats);
        assert_eq!(regressor.calls(), 2);

        forecaster.forecast(YearMonth::new(2024, 4).unwrap(), &mut cache, &mut stats);
        assert_eq!(regressor.calls(), 4);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_target_inside_history_is_rejected() {
        let points = history(12);
        let refs: Vec<&MonthlySeriesPoint> = points.iter().collect();
        let regressor = CountingRegressor::new(0.0);
        let model = model(regressor.clone(), &points);
        let forecaster = CategoryForecaster {
            kind: CategoryKind::Emergencies,
            category_id: 3,
            model: &model,
            history: &refs,
            category_count: 1,
        };
        let mut cache = PredictionCache::new();

        let target = YearMonth::new(2023, 12).unwrap();
        let result = forecaster.forecast(target, &mut cache, &mut CacheStats::default());
        assert_eq!(result, None);
        assert_eq!(regressor.calls(), 0);
    }

    #[test]
    fn test_short_history_caches_nothing() {
        let points = history(4);
        let refs: Vec<&MonthlySeriesPoint> = points.iter().collect();
        let regressor = CountingRegressor::new(0.0);
        // Lookback of 6 cannot be filled from 4 months
        let model = model(regressor.clone(), &points);
        let forecaster = CategoryForecaster {
            kind: CategoryKind::Complaints,
            category_id: 3,
            model: &model,
            history: &refs,
            category_count: 1,
        };
        let mut cache = PredictionCache::new();

        let target = YearMonth::new(2023, 8).unwrap();
        let result = forecaster.forecast(target, &mut cache, &mut CacheStats::default());

        assert_eq!(result, None);
        assert!(cache.is_empty());
        assert_eq!(regressor.calls(), 0);
    }

    #[test]
    fn test_negative_outputs_clamp_to_zero() {
        let points = history(12);
        let refs: Vec<&MonthlySeriesPoint> = points.iter().collect();
        // Far below the count scaler's center
        let regressor = CountingRegressor::new(-1000.0);
        let model = model(regressor, &points);
        let forecaster = CategoryForecaster {
            kind: CategoryKind::Complaints,
            category_id: 3,
            model: &model,
            history: &refs,
            category_count: 1,
        };

        let target = YearMonth::new(2024, 2).unwrap();
        let value = forecaster
            .forecast(target, &mut PredictionCache::new(), &mut CacheStats::default())
            .unwrap();
        assert_eq!(value, 0);
    }
}
