//! Memory categories and trim levels
//!
//! The in-memory cache budget can be scaled at runtime by a [`MemoryCategory`]
//! and shrunk in response to system memory pressure through a [`TrimLevel`].

use serde::{Deserialize, Serialize};

/// Memory pressure level derived from cache utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-90% utilization)
    High,
    /// Memory usage is critical (> 90% utilization)
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Scales the memory cache budget relative to its configured size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Half the configured size.
    Low,
    /// The configured size.
    #[default]
    Normal,
    /// One and a half times the configured size.
    High,
}

impl MemoryCategory {
    /// Multiplier applied to the configured budget.
    pub fn multiplier(&self) -> f32 {
        match self {
            MemoryCategory::Low => 0.5,
            MemoryCategory::Normal => 1.0,
            MemoryCategory::High => 1.5,
        }
    }
}

/// Signal from the host that memory should be given back.
///
/// Ordered from mildest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrimLevel {
    /// The process is running and the system is starting to run low.
    RunningModerate,
    /// The process is running and the system is low on memory.
    RunningLow,
    /// The process is running and the system is critically low on memory.
    RunningCritical,
    /// The user interface is no longer visible.
    UiHidden,
    /// The process is in the background.
    Background,
    /// The process is in the background and in the middle of the kill list.
    Moderate,
    /// The process is among the first to be killed.
    Complete,
}

/// What a cache should do for a given trim level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimAction {
    /// Keep everything.
    Keep,
    /// Trim to half the current budget.
    Halve,
    /// Evict everything.
    Clear,
}

impl TrimLevel {
    /// The cache action for this level.
    pub fn action(&self) -> TrimAction {
        match self {
            TrimLevel::Background | TrimLevel::Moderate | TrimLevel::Complete => TrimAction::Clear,
            TrimLevel::UiHidden | TrimLevel::RunningCritical => TrimAction::Halve,
            TrimLevel::RunningModerate | TrimLevel::RunningLow => TrimAction::Keep,
        }
    }
}

impl From<MemoryPressure> for TrimLevel {
    fn from(pressure: MemoryPressure) -> Self {
        match pressure {
            MemoryPressure::Low => TrimLevel::RunningModerate,
            MemoryPressure::Moderate => TrimLevel::RunningLow,
            MemoryPressure::High => TrimLevel::RunningCritical,
            MemoryPressure::Critical => TrimLevel::Complete,
        }
    }
}
