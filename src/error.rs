//! Typed errors surfaced to callers of the forecasting and spatial services.

use thiserror::Error;

use crate::ml::model::TrainingError;
use crate::ml::persistence::PersistenceError;

/// Errors returned by the forecasting service.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// The requested month is inside (or before) the historical coverage.
    #[error(
        "target period {year}-{month:02} is not after the last historical month {last_year}-{last_month:02}"
    )]
    InvalidTargetPeriod {
        year: i32,
        month: u32,
        last_year: i32,
        last_month: u32,
    },

    #[error("invalid month {0}: expected a value between 1 and 12")]
    InvalidMonth(u32),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Forecast or metrics requested before any successful training or load.
    #[error("no trained models are available; retrain or load artifacts first")]
    ModelNotTrained,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Training(#[from] TrainingError),
}

/// Errors returned by the spatial allocator.
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("spatial model has not been trained; run spatial training first")]
    NotTrained,

    #[error("no incidents with usable coordinates in the dataset")]
    NoCoordinates,

    #[error("invalid grid {rows}x{cols}: both dimensions must be at least 1")]
    InvalidGrid { rows: usize, cols: usize },

    #[error("invalid sector definitions: {0}")]
    Sectors(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
