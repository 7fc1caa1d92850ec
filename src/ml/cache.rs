//! Write-once prediction cache keyed by category and month

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dataset::CategoryKind;

use super::persistence::{PersistenceError, read_bincode, write_bincode};
use super::series::YearMonth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: CategoryKind,
    pub category_id: u32,
    pub period: YearMonth,
}

impl CacheKey {
    pub fn new(kind: CategoryKind, category_id: u32, period: YearMonth) -> Self {
        Self {
            kind,
            category_id,
            period,
        }
    }
}

/// Hit/miss counters for one top-level forecast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// Predicted counts, persisted across restarts and cleared on retrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionCache {
    entries: BTreeMap<CacheKey, u32>,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        match read_bincode(path) {
            Ok(cache) => Ok(cache),
            Err(PersistenceError::FileNotFound(_)) => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        write_bincode(path, self)
    }

    pub fn get(&self, key: &CacheKey) -> Option<u32> {
        self.entries.get(key).copied()
    }

    /// Return the cached value, computing and storing it only when absent.
    ///
    /// Nothing is stored when `compute` yields `None`.
    pub fn get_or_try_insert_with<F: FnOnce() -> Option<u32>>(
        &mut self,
        key: CacheKey,
        stats: &mut CacheStats,
        compute: F,
    ) -> Option<u32> {
        if let Some(value) = self.entries.get(&key) {
            stats.hits += 1;
            return Some(*value);
        }
        stats.misses += 1;
        let value = compute()?;
        self.entries.insert(key, value);
        Some(value)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &u32)> {
        self.entries.iter()
    }
}
