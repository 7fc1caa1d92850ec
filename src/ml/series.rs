//! Monthly series builder
//!
//! Turns raw incident records into a dense, gap-filled monthly table per
//! category kind, with the cyclical and trend features the sequence model
//! consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dataset::{CategoryKind, IncidentRecord};

/// Number of feature columns fed to the sequence model.
pub const FEATURE_COUNT: usize = 7;

/// Stable column order shared by training and inference.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "month_sin",
    "month_cos",
    "quarter_sin",
    "quarter_cos",
    "trend",
    "month_index",
    "count",
];

/// Position of the target column in [`FEATURE_NAMES`].
pub const COUNT_COLUMN: usize = 6;

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    /// Returns `None` unless `month` is in 1..=12.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Months strictly after `self` up to and including `target`.
    pub fn months_through(self, target: YearMonth) -> Vec<YearMonth> {
        let mut months = Vec::new();
        let mut current = self;
        while current < target {
            current = current.next();
            months.push(current);
        }
        months
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// One (year, month, category) row of the dense table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySeriesPoint {
    pub year: i32,
    pub month: u32,
    pub category_id: u32,
    pub count: u32,
    pub month_sin: f64,
    pub month_cos: f64,
    pub quarter_sin: f64,
    pub quarter_cos: f64,
    /// Row position in the sorted kind table
    pub trend: f64,
    pub month_index: f64,
}

impl MonthlySeriesPoint {
    /// Build a row with its calendar features derived from `period`.
    pub fn new(period: YearMonth, category_id: u32, count: u32, trend: f64) -> Self {
        let (month_sin, month_cos) = cyclical_encode(period.month as f64, 12.0);
        let (quarter_sin, quarter_cos) = cyclical_encode(period.month as f64, 3.0);

        Self {
            year: period.year,
            month: period.month,
            category_id,
            count,
            month_sin,
            month_cos,
            quarter_sin,
            quarter_cos,
            trend,
            month_index: period.month as f64,
        }
    }

    pub fn period(&self) -> YearMonth {
        YearMonth {
            year: self.year,
            month: self.month,
        }
    }

    /// Feature vector in [`FEATURE_NAMES`] order.
    pub fn features(&self) -> [f64; FEATURE_COUNT] {
        [
            self.month_sin,
            self.month_cos,
            self.quarter_sin,
            self.quarter_cos,
            self.trend,
            self.month_index,
            self.count as f64,
        ]
    }
}

/// Dense monthly table for one category kind, sorted by (year, month, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySeries {
    pub kind: CategoryKind,
    points: Vec<MonthlySeriesPoint>,
    categories: Vec<u32>,
    years: Vec<i32>,
}

impl MonthlySeries {
    /// Build the dense series for `kind` from raw records.
    ///
    /// Every combination of observed year x 12 months x observed category
    /// appears exactly once; combinations without incidents get count 0.
    pub fn build(kind: CategoryKind, records: &[IncidentRecord]) -> Self {
        let mut counts: BTreeMap<(i32, u32, u32), u32> = BTreeMap::new();
        let mut years = BTreeSet::new();
        let mut categories = BTreeSet::new();

        for record in records.iter().filter(|r| r.category.kind == kind) {
            let key = (record.year(), record.month(), record.category.id);
            *counts.entry(key).or_insert(0) += 1;
            years.insert(record.year());
            categories.insert(record.category.id);
        }

        let mut points = Vec::with_capacity(years.len() * 12 * categories.len());
        for &year in &years {
            for month in 1..=12 {
                for &category_id in &categories {
                    let count = counts.get(&(year, month, category_id)).copied().unwrap_or(0);
                    let trend = points.len() as f64;
                    points.push(MonthlySeriesPoint::new(
                        YearMonth { year, month },
                        category_id,
                        count,
                        trend,
                    ));
                }
            }
        }

        tracing::debug!(
            kind = %kind,
            rows = points.len(),
            categories = categories.len(),
            years = years.len(),
            "Built monthly series"
        );

        Self {
            kind,
            points,
            categories: categories.into_iter().collect(),
            years: years.into_iter().collect(),
        }
    }

    pub fn points(&self) -> &[MonthlySeriesPoint] {
        &self.points
    }

    /// Category ids present in the series, ascending.
    pub fn categories(&self) -> &[u32] {
        &self.categories
    }

    /// Years present in the series, ascending.
    pub fn years(&self) -> &[i32] {
        &self.years
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Rows of one category in chronological order.
    pub fn category_points(&self, category_id: u32) -> Vec<&MonthlySeriesPoint> {
        self.points
            .iter()
            .filter(|p| p.category_id == category_id)
            .collect()
    }

    pub fn first_period(&self) -> Option<YearMonth> {
        self.points.first().map(MonthlySeriesPoint::period)
    }

    pub fn last_period(&self) -> Option<YearMonth> {
        self.points.last().map(MonthlySeriesPoint::period)
    }
}

/// Cyclical encoding for periodic features
/// Returns (sin, cos) encoding to preserve continuity
pub fn cyclical_encode(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn record(year: i32, month: u32, kind: CategoryKind, id: u32) -> IncidentRecord {
        let at = NaiveDate::from_ymd_opt(year, month, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        IncidentRecord::new(at, kind, id)
    }

    #[test]
    fn test_cyclical_encoding_continuity() {
        // December and January should be close in encoded space
        let (sin_12, cos_12) = cyclical_encode(12.0, 12.0);
        let (sin_1, cos_1) = cyclical_encode(1.0, 12.0);

        let distance = ((sin_12 - sin_1).powi(2) + (cos_12 - cos_1).powi(2)).sqrt();
        assert!(distance < 0.6, "Distance was {}", distance);
    }

    #[test]
    fn test_cyclical_encoding_quarter() {
        let (sin_3, cos_3) = cyclical_encode(3.0, 3.0);
        assert_relative_eq!(sin_3, 0.0, epsilon = 1e-10);
        assert_relative_eq!(cos_3, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_year_month_next_wraps() {
        let dec = YearMonth::new(2023, 12).unwrap();
        assert_eq!(dec.next(), YearMonth::new(2024, 1).unwrap());
        assert!(YearMonth::new(2023, 13).is_none());
        assert!(YearMonth::new(2023, 0).is_none());
    }

    #[test]
    fn test_months_through_is_exclusive_inclusive() {
        let last = YearMonth::new(2023, 11).unwrap();
        let target = YearMonth::new(2024, 2).unwrap();
        let months = last.months_through(target);

        assert_eq!(
            months,
            vec![
                YearMonth::new(2023, 12).unwrap(),
                YearMonth::new(2024, 1).unwrap(),
                YearMonth::new(2024, 2).unwrap(),
            ]
        );
        assert!(target.months_through(last).is_empty());
    }

    #[test]
    fn test_build_fills_gaps_with_zero() {
        let records = vec![
            record(2020, 1, CategoryKind::Complaints, 1),
            record(2020, 1, CategoryKind::Complaints, 1),
            record(2021, 6, CategoryKind::Complaints, 2),
            record(2021, 6, CategoryKind::Emergencies, 9),
        ];

        let series = MonthlySeries::build(CategoryKind::Complaints, &records);

        // 2 years x 12 months x 2 categories
        assert_eq!(series.points().len(), 48);
        assert_eq!(series.categories(), &[1, 2]);
        assert_eq!(series.years(), &[2020, 2021]);

        let cat1 = series.category_points(1);
        assert_eq!(cat1.len(), 24);
        assert_eq!(cat1[0].count, 2);
        assert!(cat1[1..].iter().all(|p| p.count == 0));

        let cat2 = series.category_points(2);
        let june_2021 = cat2
            .iter()
            .find(|p| p.year == 2021 && p.month == 6)
            .unwrap();
        assert_eq!(june_2021.count, 1);
    }

    #[test]
    fn test_build_sorted_with_trend_index() {
        let records = vec![
            record(2019, 3, CategoryKind::Emergencies, 4),
            record(2019, 1, CategoryKind::Emergencies, 2),
        ];
        let series = MonthlySeries::build(CategoryKind::Emergencies, &records);

        let points = series.points();
        for (i, window) in points.windows(2).enumerate() {
            let a = (window[0].year, window[0].month, window[0].category_id);
            let b = (window[1].year, window[1].month, window[1].category_id);
            assert!(a < b, "Rows out of order at {}", i);
        }
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.trend, i as f64);
            assert_eq!(p.month_index, p.month as f64);
        }

        assert_eq!(series.first_period(), YearMonth::new(2019, 1));
        assert_eq!(series.last_period(), YearMonth::new(2019, 12));
    }

    #[test]
    fn test_build_empty_kind() {
        let records = vec![record(2019, 3, CategoryKind::Emergencies, 4)];
        let series = MonthlySeries::build(CategoryKind::Complaints, &records);

        assert!(series.is_empty());
        assert_eq!(series.last_period(), None);
    }

    #[test]
    fn test_features_column_order() {
        let point = MonthlySeriesPoint::new(YearMonth::new(2024, 3).unwrap(), 5, 17, 42.0);
        let features = point.features();

        assert_eq!(features.len(), FEATURE_NAMES.len());
        assert_eq!(features[COUNT_COLUMN], 17.0);
        assert_eq!(features[4], 42.0);
        assert_eq!(features[5], 3.0);
        assert_relative_eq!(features[0], (2.0 * PI * 3.0 / 12.0).sin(), epsilon = 1e-12);
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn series_is_dense_per_category(
                entries in prop::collection::vec((2015i32..2020, 1u32..=12, 0u32..4), 1..200)
            ) {
                let records: Vec<IncidentRecord> = entries
                    .iter()
                    .map(|&(y, m, c)| record(y, m, CategoryKind::Complaints, c))
                    .collect();
                let series = MonthlySeries::build(CategoryKind::Complaints, &records);

                let years = series.years().len();
                for &category in series.categories() {
                    let points = series.category_points(category);
                    prop_assert_eq!(points.len(), years * 12);

                    let mut seen = BTreeSet::new();
                    for p in &points {
                        prop_assert!(seen.insert((p.year, p.month)));
                    }
                }

                let total: u32 = series.points().iter().map(|p| p.count).sum();
                prop_assert_eq!(total as usize, records.len());
            }
        }
    }
}
