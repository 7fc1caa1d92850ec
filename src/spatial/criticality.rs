//! Criticality tiers for cell totals

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered severity of a cell total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalityLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl CriticalityLevel {
    /// All tiers, most critical first.
    pub const ALL: [CriticalityLevel; 5] = [
        CriticalityLevel::VeryHigh,
        CriticalityLevel::High,
        CriticalityLevel::Medium,
        CriticalityLevel::Low,
        CriticalityLevel::VeryLow,
    ];

    /// Display color as a hex string.
    pub fn color(&self) -> &'static str {
        match self {
            CriticalityLevel::VeryHigh => "#b71c1c",
            CriticalityLevel::High => "#d32f2f",
            CriticalityLevel::Medium => "#f57c00",
            CriticalityLevel::Low => "#fbc02d",
            CriticalityLevel::VeryLow => "#388e3c",
        }
    }

    /// Sort priority, 1 being the most urgent.
    pub fn priority(&self) -> u8 {
        match self {
            CriticalityLevel::VeryHigh => 1,
            CriticalityLevel::High => 2,
            CriticalityLevel::Medium => 3,
            CriticalityLevel::Low => 4,
            CriticalityLevel::VeryLow => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CriticalityLevel::VeryHigh => "very_high",
            CriticalityLevel::High => "high",
            CriticalityLevel::Medium => "medium",
            CriticalityLevel::Low => "low",
            CriticalityLevel::VeryLow => "very_low",
        }
    }
}

impl fmt::Display for CriticalityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lower bounds of each tier above very-low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalityThresholds {
    pub very_high: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl Default for CriticalityThresholds {
    fn default() -> Self {
        Self {
            very_high: 100,
            high: 50,
            medium: 20,
            low: 5,
        }
    }
}

impl CriticalityThresholds {
    pub fn classify(&self, total: u64) -> CriticalityLevel {
        match total {
            t if t >= self.very_high => CriticalityLevel::VeryHigh,
            t if t >= self.high => CriticalityLevel::High,
            t if t >= self.medium => CriticalityLevel::Medium,
            t if t >= self.low => CriticalityLevel::Low,
            _ => CriticalityLevel::VeryLow,
        }
    }
}
