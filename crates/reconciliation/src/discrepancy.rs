//! Discrepancy ledger entries.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{DomainError, DomainResult};

use crate::record::LedgerRecord;
use crate::task::TaskId;

/// Identifier of a discrepancy (UUIDv7, time-ordered).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscrepancyId(Uuid);

impl DiscrepancyId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DiscrepancyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DiscrepancyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DiscrepancyId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("DiscrepancyId: {}", e)))?;
        Ok(Self(uuid))
    }
}

macro_rules! wire_enum {
    ($t:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $t {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $wire),+
                }
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($t::$variant),)+
                    other => Err(DomainError::validation(format!(
                        concat!("unknown ", stringify!($t), ": {}"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// How the two sides disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    /// Recorded internally, absent at the provider.
    Missing,
    /// Present on both sides with differing amount or status.
    Mismatch,
    /// Recorded at the provider, absent internally.
    Extra,
}

wire_enum!(DiscrepancyType {
    Missing => "MISSING",
    Mismatch => "MISMATCH",
    Extra => "EXTRA",
});

/// The system whose record set lacks (or disagrees with) the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceSystem {
    Internal,
    Wechat,
}

wire_enum!(SourceSystem {
    Internal => "INTERNAL",
    Wechat => "WECHAT",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyStatus {
    Unresolved,
    Resolved,
}

wire_enum!(DiscrepancyStatus {
    Unresolved => "UNRESOLVED",
    Resolved => "RESOLVED",
});

/// Both sides of the disagreement, as they were when detected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDetails {
    pub internal: Option<LedgerRecord>,
    pub external: Option<LedgerRecord>,
}

/// A recorded difference between the internal ledger and the provider.
///
/// Immutable apart from the resolution fields; once `RESOLVED` it is never re-opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: DiscrepancyId,
    pub task_id: TaskId,
    pub discrepancy_type: DiscrepancyType,
    pub source_system: SourceSystem,
    pub status: DiscrepancyStatus,
    pub record_key: String,
    pub expected_value: Option<String>,
    pub actual_value: Option<String>,
    pub details: RecordDetails,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

impl Discrepancy {
    pub fn new(
        task_id: TaskId,
        discrepancy_type: DiscrepancyType,
        source_system: SourceSystem,
        record_key: impl Into<String>,
        details: RecordDetails,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let expected_value = details.internal.as_ref().map(LedgerRecord::describe);
        let actual_value = details.external.as_ref().map(LedgerRecord::describe);
        Self {
            id: DiscrepancyId::new(),
            task_id,
            discrepancy_type,
            source_system,
            status: DiscrepancyStatus::Unresolved,
            record_key: record_key.into(),
            expected_value,
            actual_value,
            details,
            detected_at,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == DiscrepancyStatus::Resolved
    }

    pub fn resolve(
        &mut self,
        notes: impl Into<String>,
        resolved_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.is_resolved() {
            return Err(DomainError::conflict(format!(
                "discrepancy {} already resolved",
                self.id
            )));
        }
        let resolved_by = resolved_by.into();
        if resolved_by.trim().is_empty() {
            return Err(DomainError::validation("resolved_by must not be empty"));
        }
        self.status = DiscrepancyStatus::Resolved;
        self.resolution_notes = Some(notes.into());
        self.resolved_by = Some(resolved_by);
        self.resolved_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing() -> Discrepancy {
        Discrepancy::new(
            TaskId::from_i64(7),
            DiscrepancyType::Missing,
            SourceSystem::Wechat,
            "tx-1",
            RecordDetails {
                internal: Some(LedgerRecord::new("tx-1", 100, "SUCCESS", Utc::now())),
                external: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn captures_expected_side() {
        let d = missing();
        assert_eq!(d.expected_value.as_deref(), Some("amount=100, status=SUCCESS"));
        assert!(d.actual_value.is_none());
        assert_eq!(d.status, DiscrepancyStatus::Unresolved);
    }

    #[test]
    fn resolves_once() {
        let mut d = missing();
        d.resolve("refunded offline", "ops@example.com", Utc::now()).unwrap();
        assert!(d.is_resolved());
        assert!(matches!(
            d.resolve("again", "ops@example.com", Utc::now()),
            Err(DomainError::Conflict(_))
        ));
        assert_eq!(d.resolution_notes.as_deref(), Some("refunded offline"));
    }

    #[test]
    fn resolver_is_required() {
        let mut d = missing();
        assert!(d.resolve("notes", "  ", Utc::now()).is_err());
        assert!(!d.is_resolved());
    }

    #[test]
    fn wire_names() {
        assert_eq!(DiscrepancyType::Extra.as_str(), "EXTRA");
        assert_eq!("WECHAT".parse::<SourceSystem>().unwrap(), SourceSystem::Wechat);
        assert!("OPEN".parse::<DiscrepancyStatus>().is_err());
    }
}
