//! Rule-based discrepancy resolution.
//!
//! Rules only run when explicitly handed to
//! [`ReconciliationService::apply_resolution_rules`](crate::ReconciliationService::apply_resolution_rules);
//! nothing is resolved implicitly.

use crate::discrepancy::{Discrepancy, DiscrepancyType};

pub trait ResolutionRule: Send + Sync {
    fn name(&self) -> &str;

    /// Resolution notes if this rule accepts the discrepancy, `None` otherwise.
    fn evaluate(&self, discrepancy: &Discrepancy) -> Option<String>;
}

/// Accepts amount-only mismatches within a tolerance (e.g. rounding on the
/// provider side). Status differences are never accepted.
#[derive(Debug, Clone)]
pub struct AmountToleranceRule {
    pub tolerance_cents: i64,
}

impl AmountToleranceRule {
    pub fn new(tolerance_cents: i64) -> Self {
        Self { tolerance_cents }
    }
}

impl ResolutionRule for AmountToleranceRule {
    fn name(&self) -> &str {
        "amount-tolerance"
    }

    fn evaluate(&self, discrepancy: &Discrepancy) -> Option<String> {
        if discrepancy.discrepancy_type != DiscrepancyType::Mismatch {
            return None;
        }
        let internal = discrepancy.details.internal.as_ref()?;
        let external = discrepancy.details.external.as_ref()?;
        if internal.normalized_status() != external.normalized_status() {
            return None;
        }
        let diff = (internal.amount_cents - external.amount_cents).abs();
        (diff <= self.tolerance_cents).then(|| {
            format!(
                "amount difference of {diff} within tolerance {}",
                self.tolerance_cents
            )
        })
    }
}
