//! Record-set comparison.
//!
//! Both sides are indexed by transaction id, then every key in the union is
//! classified:
//!
//! | internal | external | outcome |
//! |----------|----------|---------|
//! | present  | absent   | `MISSING`, source `WECHAT` |
//! | absent   | present  | `EXTRA`, source `INTERNAL` |
//! | present  | present, amount off by more than the tolerance or status differs | `MISMATCH` |
//! | present  | present, otherwise | matched |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discrepancy::{DiscrepancyType, RecordDetails, SourceSystem};
use crate::record::LedgerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSettings {
    /// Largest absolute amount difference still treated as equal.
    pub amount_tolerance_cents: i64,
    /// Discrepancy ratio above which an alert is raised.
    pub alert_threshold: f64,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            amount_tolerance_cents: 0,
            alert_threshold: 0.01,
        }
    }
}

/// One classified difference, not yet attached to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub discrepancy_type: DiscrepancyType,
    pub source_system: SourceSystem,
    pub record_key: String,
    pub details: RecordDetails,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonOutcome {
    pub internal_count: usize,
    pub external_count: usize,
    /// Distinct transaction ids across both sides.
    pub compared: usize,
    pub matched: usize,
    pub findings: Vec<Finding>,
    pub ratio: f64,
    pub alert: bool,
}

impl ComparisonOutcome {
    pub fn count_of(&self, kind: DiscrepancyType) -> usize {
        self.findings
            .iter()
            .filter(|f| f.discrepancy_type == kind)
            .count()
    }
}

fn index(side: &'static str, records: &[LedgerRecord]) -> BTreeMap<String, LedgerRecord> {
    let mut map = BTreeMap::new();
    for r in records {
        if map.contains_key(&r.transaction_id) {
            debug!(side, transaction_id = %r.transaction_id, "duplicate transaction id ignored");
            continue;
        }
        map.insert(r.transaction_id.clone(), r.clone());
    }
    map
}

fn differs(a: &LedgerRecord, b: &LedgerRecord, tolerance: i64) -> bool {
    (a.amount_cents - b.amount_cents).abs() > tolerance
        || a.normalized_status() != b.normalized_status()
}

/// Classify every transaction id in either record set.
///
/// Findings come out ordered by transaction id.
pub fn compare(
    internal: &[LedgerRecord],
    external: &[LedgerRecord],
    settings: &ComparisonSettings,
) -> ComparisonOutcome {
    let mut internal_idx = index("internal", internal);
    let mut external_idx = index("external", external);

    let mut keys: Vec<String> = internal_idx
        .keys()
        .chain(external_idx.keys())
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();

    let mut findings = Vec::new();
    let mut matched = 0;

    for key in &keys {
        let finding = match (internal_idx.remove(key), external_idx.remove(key)) {
            (Some(i), None) => Some((DiscrepancyType::Missing, SourceSystem::Wechat, Some(i), None)),
            (None, Some(e)) => Some((DiscrepancyType::Extra, SourceSystem::Internal, None, Some(e))),
            (Some(i), Some(e)) if differs(&i, &e, settings.amount_tolerance_cents) => Some((
                DiscrepancyType::Mismatch,
                SourceSystem::Internal,
                Some(i),
                Some(e),
            )),
            (Some(_), Some(_)) => {
                matched += 1;
                None
            }
            (None, None) => None,
        };

        if let Some((discrepancy_type, source_system, internal, external)) = finding {
            findings.push(Finding {
                discrepancy_type,
                source_system,
                record_key: key.clone(),
                details: RecordDetails { internal, external },
            });
        }
    }

    let compared = keys.len();
    let ratio = if compared == 0 {
        0.0
    } else {
        findings.len() as f64 / compared as f64
    };

    ComparisonOutcome {
        internal_count: internal.len(),
        external_count: external.len(),
        compared,
        matched,
        alert: ratio > settings.alert_threshold,
        findings,
        ratio,
    }
}
