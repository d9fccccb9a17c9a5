use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job lifecycle: PENDING -> RUNNING -> terminal, with CANCELLING as the
/// intermediate state entered on a cancel request against a running job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    CompletedWithErrors,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Error
                | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobStatus::Error => "ERROR",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-unit status within a job. A unit is one (tool, target) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Error,
    Timeout,
    Skipped,
    Cancelled,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitStatus::Pending | UnitStatus::Running)
    }

    /// True for the states that make a finished job COMPLETED_WITH_ERRORS
    /// instead of COMPLETED.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitStatus::Error | UnitStatus::Timeout | UnitStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
    Command,
}

/// Append-only log record. `is_html` marks entries whose message carries
/// markup the UI may render directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    pub is_html: bool,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
            is_html: false,
        }
    }
}

/// One tool as selected by the client: which tool, the values for its
/// declared CLI parameters, and free-form extra arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelection {
    pub id: String,
    #[serde(default)]
    pub cli_params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub additional_args: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvancedOptions {
    /// Per-tool timeout override in seconds; the tool's own default applies
    /// when unset.
    #[serde(default)]
    pub tool_timeout: Option<u64>,
    /// Whole-job timeout in seconds, applied as an implicit cancel request.
    #[serde(default)]
    pub job_timeout: Option<u64>,
}

/// Progress record for one tool execution unit, keyed in the job's
/// `tool_progress` map by [`unit_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitState {
    pub id: String,
    pub name: String,
    pub status: UnitStatus,
    pub command: Option<String>,
    pub output_file: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl UnitState {
    pub fn pending(tool_id: &str, name: &str) -> Self {
        Self {
            id: tool_id.to_string(),
            name: name.to_string(),
            status: UnitStatus::Pending,
            command: None,
            output_file: None,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }
}

/// Map key for one (tool, target) unit. Duplicate pairs in a request
/// collapse onto the same key.
pub fn unit_key(tool_id: &str, target: &str) -> String {
    format!("{}_on_{}", tool_id, target)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub targets: Vec<String>,
    pub selected_tools: Vec<ToolSelection>,
    pub advanced_options: AdvancedOptions,
    pub creation_timestamp: DateTime<Utc>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub overall_progress: u8,
    pub logs: Vec<LogEntry>,
    pub tool_progress: BTreeMap<String, UnitState>,
    pub error_message: Option<String>,
    pub results_path: PathBuf,
    pub zip_path: Option<String>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        name: String,
        targets: Vec<String>,
        selected_tools: Vec<ToolSelection>,
        advanced_options: AdvancedOptions,
        tool_progress: BTreeMap<String, UnitState>,
        results_path: PathBuf,
    ) -> Self {
        let mut record = Self {
            id,
            name,
            status: JobStatus::Pending,
            targets,
            selected_tools,
            advanced_options,
            creation_timestamp: Utc::now(),
            start_timestamp: None,
            end_timestamp: None,
            overall_progress: 0,
            logs: Vec::new(),
            tool_progress,
            error_message: None,
            results_path,
            zip_path: None,
        };
        let msg = format!("Job {} created and queued.", record.id);
        record.push_log(LogLevel::Info, msg);
        record
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry::new(level, message));
    }

    pub fn total_units(&self) -> usize {
        self.tool_progress.len()
    }

    pub fn finished_units(&self) -> usize {
        self.tool_progress
            .values()
            .filter(|u| u.status.is_terminal())
            .count()
    }

    /// Recompute overall progress from unit completions. Clamped so readers
    /// observe a monotone sequence.
    pub fn recompute_progress(&mut self) {
        let total = self.total_units();
        if total == 0 {
            return;
        }
        let pct = (self.finished_units() * 100 / total) as u8;
        if pct > self.overall_progress {
            self.overall_progress = pct;
        }
    }

    /// Terminal status once every unit has settled.
    pub fn derive_terminal_status(&self, cancelled: bool) -> JobStatus {
        if cancelled {
            return JobStatus::Cancelled;
        }
        let completed = self
            .tool_progress
            .values()
            .filter(|u| u.status == UnitStatus::Completed)
            .count();
        let failures = self
            .tool_progress
            .values()
            .filter(|u| u.status.is_failure())
            .count();
        if completed == 0 {
            JobStatus::Error
        } else if failures > 0 {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        }
    }

    /// Log entries at and after `offset`, in insertion order. An offset past
    /// the end yields an empty slice.
    pub fn logs_from(&self, offset: usize) -> &[LogEntry] {
        if offset >= self.logs.len() {
            &[]
        } else {
            &self.logs[offset..]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_units(units: &[(&str, &str, UnitStatus)]) -> JobRecord {
        let mut progress = BTreeMap::new();
        for (tool, target, status) in units {
            let mut unit = UnitState::pending(tool, tool);
            unit.status = *status;
            progress.insert(unit_key(tool, target), unit);
        }
        JobRecord::new(
            JobId::from("test-job"),
            "test".to_string(),
            vec!["10.0.0.5".to_string()],
            Vec::new(),
            AdvancedOptions::default(),
            progress,
            PathBuf::from("/tmp/test-job"),
        )
    }

    #[test]
    fn progress_tracks_finished_units() {
        let mut record = record_with_units(&[
            ("a", "t", UnitStatus::Completed),
            ("b", "t", UnitStatus::Running),
            ("c", "t", UnitStatus::Pending),
            ("d", "t", UnitStatus::Error),
        ]);
        record.recompute_progress();
        assert_eq!(record.overall_progress, 50);
    }

    #[test]
    fn progress_never_regresses() {
        let mut record = record_with_units(&[
            ("a", "t", UnitStatus::Completed),
            ("b", "t", UnitStatus::Pending),
        ]);
        record.recompute_progress();
        assert_eq!(record.overall_progress, 50);
        record.overall_progress = 75;
        record.recompute_progress();
        assert_eq!(record.overall_progress, 75);
    }

    #[test]
    fn all_completed_is_completed() {
        let record = record_with_units(&[
            ("a", "t", UnitStatus::Completed),
            ("b", "t", UnitStatus::Completed),
        ]);
        assert_eq!(record.derive_terminal_status(false), JobStatus::Completed);
    }

    #[test]
    fn mixed_results_are_completed_with_errors() {
        for failure in [UnitStatus::Error, UnitStatus::Timeout, UnitStatus::Skipped] {
            let record = record_with_units(&[
                ("a", "t", UnitStatus::Completed),
                ("b", "t", failure),
            ]);
            assert_eq!(
                record.derive_terminal_status(false),
                JobStatus::CompletedWithErrors
            );
        }
    }

    #[test]
    fn all_failed_is_error() {
        let record = record_with_units(&[
            ("a", "t", UnitStatus::Error),
            ("b", "t", UnitStatus::Timeout),
        ]);
        assert_eq!(record.derive_terminal_status(false), JobStatus::Error);
    }

    #[test]
    fn cancellation_wins_over_unit_results() {
        let record = record_with_units(&[("a", "t", UnitStatus::Completed)]);
        assert_eq!(record.derive_terminal_status(true), JobStatus::Cancelled);
    }

    #[test]
    fn log_offsets_never_repeat_or_skip() {
        let mut record = record_with_units(&[("a", "t", UnitStatus::Pending)]);
        record.push_log(LogLevel::Info, "one");
        record.push_log(LogLevel::Warn, "two");
        let first_len = record.logs.len();
        let first = record.logs_from(0).to_vec();
        assert_eq!(first.len(), first_len);

        record.push_log(LogLevel::Error, "three");
        let second = record.logs_from(first_len);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message, "three");

        assert!(record.logs_from(100).is_empty());
    }

    #[test]
    fn status_wire_names_match_contract() {
        assert_eq!(
            serde_json::to_string(&JobStatus::CompletedWithErrors).unwrap(),
            "\"COMPLETED_WITH_ERRORS\""
        );
        assert_eq!(
            serde_json::to_string(&UnitStatus::Timeout).unwrap(),
            "\"timeout\""
        );
        assert_eq!(
            serde_json::to_string(&LogLevel::Command).unwrap(),
            "\"command\""
        );
    }

    #[test]
    fn unit_keys_are_distinct_per_pair() {
        assert_eq!(unit_key("nmap", "10.0.0.5"), "nmap_on_10.0.0.5");
        assert_ne!(unit_key("nmap", "a"), unit_key("nmap", "b"));
    }
}
