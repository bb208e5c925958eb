use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::state::deserialize_unit_ids;
use crate::timestamp::parse_timestamp;
use crate::{JobId, ParentId, UnitId, UnitStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub job_id: JobId,
    pub parent_id: Option<ParentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRef {
    pub unit_id: UnitId,
    pub parent_id: Option<ParentId>,
    pub job_id: Option<JobId>,
}

/// Job and segment events understood by the reconciler.
///
/// Every other event category on the channel (health, settings, speakers,
/// export) is routed elsewhere and never becomes a `JobEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Created {
        job: JobRef,
        total_units: u32,
        unit_ids: Vec<UnitId>,
        created_at: Option<DateTime<Utc>>,
    },
    Started {
        job: JobRef,
        total_units: Option<u32>,
        processed_units: Option<u32>,
        started_at: Option<DateTime<Utc>>,
    },
    Progress {
        job: JobRef,
        processed_units: Option<u32>,
        total_units: Option<u32>,
        failed_units: Option<u32>,
        current_unit_id: Option<UnitId>,
    },
    Completed {
        job: JobRef,
        processed_units: Option<u32>,
        total_units: Option<u32>,
        completed_at: Option<DateTime<Utc>>,
    },
    Failed {
        job: JobRef,
        processed_units: Option<u32>,
        error: String,
        completed_at: Option<DateTime<Utc>>,
    },
    Cancelling {
        job: JobRef,
    },
    Cancelled {
        job: JobRef,
        unit_ids: Vec<UnitId>,
        completed_at: Option<DateTime<Utc>>,
    },
    /// `job` is the new job created for the remaining units.
    Resumed {
        job: JobRef,
        original_job_id: Option<JobId>,
        total_units: u32,
        processed_units: u32,
        unit_ids: Vec<UnitId>,
        resumed_at: Option<DateTime<Utc>>,
    },
    UnitStarted {
        unit: UnitRef,
    },
    UnitCompleted {
        unit: UnitRef,
        result_ref: Option<String>,
    },
    UnitFailed {
        unit: UnitRef,
        error: Option<String>,
    },
    UnitUpdated {
        unit: UnitRef,
        status: UnitStatus,
        result_ref: Option<String>,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "job.created",
            JobEvent::Started { .. } => "job.started",
            JobEvent::Progress { .. } => "job.progress",
            JobEvent::Completed { .. } => "job.completed",
            JobEvent::Failed { .. } => "job.failed",
            JobEvent::Cancelling { .. } => "job.cancelling",
            JobEvent::Cancelled { .. } => "job.cancelled",
            JobEvent::Resumed { .. } => "job.resumed",
            JobEvent::UnitStarted { .. } => "segment.started",
            JobEvent::UnitCompleted { .. } => "segment.completed",
            JobEvent::UnitFailed { .. } => "segment.failed",
            JobEvent::UnitUpdated { .. } => "segment.updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("event data is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("event has no name")]
    MissingEventName,
    #[error("malformed {event} payload: {message}")]
    MalformedPayload { event: String, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobPayload {
    job_id: JobId,
    #[serde(default)]
    chapter_id: Option<ParentId>,
    #[serde(default)]
    total_segments: Option<u32>,
    #[serde(default)]
    processed_segments: Option<u32>,
    #[serde(default)]
    failed_segments: Option<u32>,
    #[serde(default)]
    current_segment_id: Option<UnitId>,
    #[serde(default, deserialize_with = "deserialize_unit_ids")]
    segment_ids: Vec<UnitId>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    original_job_id: Option<JobId>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    resumed_at: Option<String>,
    #[serde(rename = "_timestamp", default)]
    timestamp: Option<String>,
}

impl JobPayload {
    fn job_ref(&self) -> JobRef {
        JobRef {
            job_id: self.job_id.clone(),
            parent_id: self.chapter_id.clone(),
        }
    }

    /// The event-specific timestamp, falling back to the envelope timestamp.
    fn at(&self, specific: &Option<String>) -> Option<DateTime<Utc>> {
        specific
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.timestamp.as_deref().and_then(parse_timestamp))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentPayload {
    segment_id: UnitId,
    #[serde(default)]
    chapter_id: Option<ParentId>,
    #[serde(default)]
    job_id: Option<JobId>,
    #[serde(default)]
    status: Option<UnitStatus>,
    #[serde(default)]
    audio_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SegmentPayload {
    fn unit_ref(&self) -> UnitRef {
        UnitRef {
            unit_id: self.segment_id.clone(),
            parent_id: self.chapter_id.clone(),
            job_id: self.job_id.clone(),
        }
    }
}

/// Turns one raw channel message into a job event.
///
/// `name` is the SSE `event:` field when the server used a named event; the
/// backend normally sends default messages and puts the name in `data.event`.
/// Returns `Ok(None)` for events that are not about jobs or segments.
pub fn parse_event(name: Option<&str>, data: &str) -> Result<Option<JobEvent>, ProtocolError> {
    let value: Value =
        serde_json::from_str(data).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;

    let name = match name.filter(|name| !name.is_empty() && *name != "message") {
        Some(name) => name.to_string(),
        None => value
            .get("event")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(ProtocolError::MissingEventName)?,
    };

    if let Some(kind) = name.strip_prefix("job.") {
        let payload: JobPayload = decode(&name, value)?;
        let job = payload.job_ref();
        let event = match kind {
            "created" => JobEvent::Created {
                total_units: payload
                    .total_segments
                    .unwrap_or(payload.segment_ids.len() as u32),
                created_at: payload.at(&payload.created_at),
                unit_ids: payload.segment_ids,
                job,
            },
            "started" => JobEvent::Started {
                total_units: payload.total_segments,
                processed_units: payload.processed_segments,
                started_at: payload.at(&payload.started_at),
                job,
            },
            "progress" => JobEvent::Progress {
                processed_units: payload.processed_segments,
                total_units: payload.total_segments,
                failed_units: payload.failed_segments,
                current_unit_id: payload.current_segment_id,
                job,
            },
            "completed" => JobEvent::Completed {
                processed_units: payload.processed_segments,
                total_units: payload.total_segments,
                completed_at: payload.at(&payload.completed_at),
                job,
            },
            "failed" => JobEvent::Failed {
                processed_units: payload.processed_segments,
                completed_at: payload.at(&payload.completed_at),
                error: payload.error.unwrap_or_default(),
                job,
            },
            "cancelling" => JobEvent::Cancelling { job },
            "cancelled" => JobEvent::Cancelled {
                completed_at: payload.at(&payload.completed_at),
                unit_ids: payload.segment_ids,
                job,
            },
            "resumed" => JobEvent::Resumed {
                total_units: payload
                    .total_segments
                    .unwrap_or(payload.segment_ids.len() as u32),
                processed_units: payload.processed_segments.unwrap_or(0),
                resumed_at: payload.at(&payload.resumed_at),
                original_job_id: payload.original_job_id,
                unit_ids: payload.segment_ids,
                job,
            },
            _ => return Ok(None),
        };
        return Ok(Some(event));
    }

    if let Some(kind) = name.strip_prefix("segment.") {
        let payload: SegmentPayload = decode(&name, value)?;
        let unit = payload.unit_ref();
        let event = match kind {
            "started" => JobEvent::UnitStarted { unit },
            "completed" => JobEvent::UnitCompleted {
                result_ref: payload.audio_path,
                unit,
            },
            "failed" => JobEvent::UnitFailed {
                error: payload.error,
                unit,
            },
            "updated" => match payload.status {
                Some(status) => JobEvent::UnitUpdated {
                    result_ref: payload.audio_path,
                    status,
                    unit,
                },
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        return Ok(Some(event));
    }

    Ok(None)
}

fn decode<T: for<'de> Deserialize<'de>>(name: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|err| ProtocolError::MalformedPayload {
        event: name.to_string(),
        message: err.to_string(),
    })
}
