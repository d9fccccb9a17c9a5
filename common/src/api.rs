use crate::catalog::{Phase, Profile, ToolDef};
use crate::job::{
    AdvancedOptions, JobId, JobRecord, JobStatus, LogEntry, ToolSelection, UnitState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /api/scan/start`. Either `tools` or `profile_id` selects
/// what runs; an explicit tool list wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartScanRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolSelection>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub scan_name: Option<String>,
    #[serde(default)]
    pub advanced_options: AdvancedOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartScanResponse {
    pub job_id: JobId,
    pub message: String,
}

/// Point-in-time view of one job, as returned by the status endpoint. Logs
/// are the entries from the requested offset onward; the client advances its
/// offset by the number of entries received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub overall_progress: u8,
    pub targets: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    pub tool_progress: BTreeMap<String, UnitState>,
    pub error_message: Option<String>,
    pub zip_path: Option<String>,
}

impl JobSnapshot {
    pub fn from_record(record: &JobRecord, log_offset: usize) -> Self {
        Self {
            job_id: record.id.clone(),
            name: record.name.clone(),
            status: record.status,
            overall_progress: record.overall_progress,
            targets: record.targets.clone(),
            start_time: record.start_timestamp,
            end_time: record.end_timestamp,
            logs: record.logs_from(log_offset).to_vec(),
            tool_progress: record.tool_progress.clone(),
            error_message: record.error_message.clone(),
            zip_path: record.zip_path.clone(),
        }
    }
}

/// One row of `GET /api/jobs`, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub targets: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub overall_progress: u8,
    pub zip_path: Option<String>,
}

impl JobSummary {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            status: record.status,
            targets: record.targets.clone(),
            timestamp: record.start_timestamp.unwrap_or(record.creation_timestamp),
            overall_progress: record.overall_progress,
            zip_path: record.zip_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub message: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Payload of `GET /api/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub tools: BTreeMap<String, ToolDef>,
    pub profiles: BTreeMap<String, Profile>,
    pub phases: BTreeMap<String, Phase>,
}
