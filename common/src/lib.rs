pub mod api;
pub mod catalog;
pub mod command;
pub mod job;

pub use api::{
    CancelResponse, ConfigResponse, ErrorBody, JobSnapshot, JobSummary, MessageResponse,
    StartScanRequest, StartScanResponse,
};
pub use catalog::{Catalog, CatalogError, CliParam, ParamKind, Phase, Profile, ToolDef};
pub use command::{build_command, output_file_base, BuiltCommand, CommandContext, Invocation};
pub use job::{
    unit_key, AdvancedOptions, JobId, JobRecord, JobStatus, LogEntry, LogLevel, ToolSelection,
    UnitState, UnitStatus,
};

/// Subdirectory of a job's results directory holding per-tool artifacts.
pub const TOOL_OUTPUTS_DIR: &str = "tool_outputs";

/// Download path template for a finished job's archive.
pub fn archive_download_path(job_id: &JobId) -> String {
    format!("/api/results/download/{}", job_id)
}

/// On-disk name of a job's archive, written next to the job directory.
pub fn archive_file_name(job_id: &JobId) -> String {
    format!("{}_results.zip", job_id)
}
