use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comparison::ComparisonSettings;

/// Tuning for reconciliation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Page size used when writing discrepancies.
    pub batch_size: usize,
    /// Attempts allowed for the external fetch before the task fails.
    pub retry_attempts: u32,
    /// Discrepancy ratio above which an alert event is published.
    pub alert_threshold: f64,
    pub amount_tolerance_cents: i64,
    /// Upper bound on one task's fetch-and-compare phase.
    pub task_timeout: Duration,
    /// Age after which closed tasks, resolved discrepancies and reports are purged.
    pub retention_days: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry_attempts: 3,
            alert_threshold: 0.01,
            amount_tolerance_cents: 0,
            task_timeout: Duration::from_secs(30 * 60),
            retention_days: 30,
        }
    }
}

impl ReconciliationConfig {
    pub fn comparison_settings(&self) -> ComparisonSettings {
        ComparisonSettings {
            amount_tolerance_cents: self.amount_tolerance_cents,
            alert_threshold: self.alert_threshold,
        }
    }
}
