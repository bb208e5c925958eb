use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::timestamp;

pub type JobId = String;
pub type UnitId = String;
pub type ParentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl UnitStatus {
    /// Work is promised but not finished yet.
    pub fn is_unresolved(self) -> bool {
        matches!(self, UnitStatus::Queued | UnitStatus::Processing)
    }
}

/// One long-running generation job as cached on the client.
///
/// Field names follow the backend's camelCase job payloads, where units are
/// called segments and the parent entity is a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "chapterId")]
    pub parent_id: ParentId,
    pub status: JobStatus,
    #[serde(rename = "totalSegments", default)]
    pub total_units: u32,
    #[serde(rename = "processedSegments", default)]
    pub processed_units: u32,
    #[serde(rename = "failedSegments", default)]
    pub failed_units: u32,
    #[serde(rename = "currentSegmentId", default)]
    pub current_unit_id: Option<UnitId>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(with = "timestamp::required")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "segmentIds",
        default,
        deserialize_with = "deserialize_unit_ids"
    )]
    pub unit_ids: Vec<UnitId>,
}

impl Job {
    /// A freshly queued job, as announced by a `created` or `resumed` event.
    pub fn pending(
        id: impl Into<JobId>,
        parent_id: impl Into<ParentId>,
        total_units: u32,
        unit_ids: Vec<UnitId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            status: JobStatus::Pending,
            total_units,
            processed_units: 0,
            failed_units: 0,
            current_unit_id: None,
            error_message: None,
            created_at,
            started_at: None,
            completed_at: None,
            updated_at: Some(created_at),
            unit_ids,
        }
    }

    pub fn covers_unit(&self, unit_id: &str) -> bool {
        self.unit_ids.iter().any(|id| id == unit_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: UnitId,
    #[serde(rename = "chapterId")]
    pub parent_id: ParentId,
    pub status: UnitStatus,
    #[serde(rename = "audioPath", default)]
    pub result_ref: Option<String>,
}

/// The entity jobs run against (a chapter) together with its ordered units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentEntity {
    pub id: ParentId,
    #[serde(rename = "segments", default)]
    pub units: Vec<Unit>,
}

impl ParentEntity {
    pub fn unit(&self, unit_id: &str) -> Option<&Unit> {
        self.units.iter().find(|unit| unit.id == unit_id)
    }

    pub(crate) fn unit_mut(&mut self, unit_id: &str) -> Option<&mut Unit> {
        self.units.iter_mut().find(|unit| unit.id == unit_id)
    }
}

/// Accepts `["seg-1", ...]` as well as `[{"id": "seg-1", ...}, ...]`.
pub(crate) fn deserialize_unit_ids<'de, D>(deserializer: D) -> Result<Vec<UnitId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UnitRef {
        Id(UnitId),
        Object { id: UnitId },
    }

    let refs: Option<Vec<UnitRef>> = Option::deserialize(deserializer)?;
    Ok(refs
        .unwrap_or_default()
        .into_iter()
        .map(|unit_ref| match unit_ref {
            UnitRef::Id(id) | UnitRef::Object { id } => id,
        })
        .collect())
}
