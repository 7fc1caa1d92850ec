//! Abstractions for time and model inference to enable testing.
//!
//! This module provides traits for:
//! - `Clock`: Abstracting time access for artifact staleness checks
//! - `SequenceRegressor`: Abstracting the per-category network so the
//!   forecasting loop can be exercised without training

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ndarray::ArrayView2;

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Set the mock clock to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.utc_time.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.utc_time.lock().unwrap_or_else(|e| e.into_inner());
        *time += duration;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ==================== SequenceRegressor Trait ====================

/// One-step-ahead regressor over a scaled lookback window.
///
/// The window has one row per time step and one column per feature. The
/// returned value is in scaled count units.
pub trait SequenceRegressor: Send + Sync {
    fn predict(&self, window: ArrayView2<f64>) -> f64;
}

/// Mock regressor that returns a fixed scaled value and counts invocations.
///
/// Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct CountingRegressor {
    output: f64,
    calls: Arc<AtomicUsize>,
}

impl CountingRegressor {
    pub fn new(output: f64) -> Self {
        Self {
            output,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `predict` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

impl SequenceRegressor for CountingRegressor {
    fn predict(&self, _window: ArrayView2<f64>) -> f64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output
    }
}
