//! Incident Forecast Library
//!
//! Monthly incident forecasting per category with a cached iterative
//! forecaster, and spatial disaggregation of forecasts over grid cells or
//! polygon sectors.

pub mod config;
pub mod dataset;
pub mod error;
pub mod ml;
pub mod spatial;
pub mod traits;

// Re-export commonly used types
pub use config::AppConfig;
pub use dataset::{CategoryKind, IncidentCategory, IncidentRecord, load_csv, read_records};
pub use error::{ForecastError, SpatialError};
pub use ml::{
    ForecastResult, IncidentForecaster, MAX_RANGE_MONTHS, ModelState, RetrainSummary,
    TrainingConfig,
    cache::{CacheKey, PredictionCache},
    model::{ModelMetrics, ModelSet, TrainedCategoryModel},
    network::BiLstmNetwork,
    quality::ModelReport,
    series::{MonthlySeries, MonthlySeriesPoint, YearMonth},
};
pub use spatial::{
    AllocationSummary, CellAllocation, CellDetail, HeatmapLayer, SpatialConfig, SpatialModel,
    criticality::{CriticalityLevel, CriticalityThresholds},
    heatmap, summarize, train_spatial,
};
pub use traits::{Clock, CountingRegressor, MockClock, SequenceRegressor, SystemClock};
