use crate::archive;
use crate::metrics::MetricsCollector;
use crate::runner;
use crate::store::JobStore;
use anyhow::Context;
use common::{
    build_command, output_file_base, unit_key, AdvancedOptions, Catalog, CommandContext, JobId,
    JobRecord, JobStatus, LogLevel, StartScanRequest, ToolSelection, UnitState, UnitStatus,
    TOOL_OUTPUTS_DIR,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<common::CatalogError> for StartError {
    fn from(err: common::CatalogError) -> Self {
        StartError::Validation(err.to_string())
    }
}

pub struct ExecutorConfig {
    pub jobs_dir: PathBuf,
    pub per_job_units: usize,
    pub max_total_units: usize,
    pub default_tool_timeout: Duration,
    pub job_timeout: Option<Duration>,
}

/// Owns the lifecycle of scan jobs: validates requests, fans tool
/// invocations out across targets under concurrency limits, and drives each
/// job to a terminal state.
pub struct Executor {
    store: Arc<JobStore>,
    catalog: Arc<Catalog>,
    metrics: Arc<MetricsCollector>,
    global_units: Arc<Semaphore>,
    cancel_tokens: DashMap<String, CancellationToken>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        store: Arc<JobStore>,
        catalog: Arc<Catalog>,
        metrics: Arc<MetricsCollector>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            metrics,
            global_units: Arc::new(Semaphore::new(config.max_total_units)),
            cancel_tokens: DashMap::new(),
            config,
        }
    }

    /// Validate a scan request, register the job, and spawn its driver task.
    /// Returns once the job is durably PENDING.
    pub async fn start_scan(self: &Arc<Self>, req: StartScanRequest) -> Result<JobId, StartError> {
        let targets = normalize_targets(&req.targets)?;

        // An explicit tool list wins over a profile.
        let selections = if !req.tools.is_empty() {
            req.tools
        } else if let Some(profile_id) = req.profile_id.as_deref().filter(|p| !p.is_empty()) {
            self.catalog.expand_profile(profile_id)?
        } else {
            return Err(StartError::Validation("No tools selected".to_string()));
        };
        let selections = self.catalog.resolve_selections(selections)?;

        let id = JobId::generate();
        let name = match req.scan_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Scan {}", chrono::Utc::now().format("%Y-%m-%d %H:%M")),
        };
        let advanced = req.advanced_options;

        // Duplicate (tool, target) pairs collapse onto one unit key.
        let mut units = BTreeMap::new();
        for sel in &selections {
            let tool = self
                .catalog
                .get(&sel.id)
                .ok_or_else(|| common::CatalogError::UnknownTool(sel.id.clone()))?;
            for target in &targets {
                units.insert(unit_key(&sel.id, target), UnitState::pending(&sel.id, &tool.name));
            }
        }

        let results_path = self.config.jobs_dir.join(id.as_str());
        tokio::fs::create_dir_all(results_path.join(TOOL_OUTPUTS_DIR))
            .await
            .with_context(|| format!("Failed to create job directory {:?}", results_path))?;

        let record = JobRecord::new(
            id.clone(),
            name,
            targets,
            selections,
            advanced,
            units,
            results_path,
        );
        self.store.create(record).map_err(StartError::Internal)?;

        let token = CancellationToken::new();
        self.cancel_tokens.insert(id.as_str().to_string(), token.clone());

        let executor = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            executor.run_job(job_id, token).await;
        });

        Ok(id)
    }

    /// Request cancellation. Terminal jobs are a no-op; the returned status
    /// tells the caller which case they hit. `None` means unknown job.
    pub fn request_cancel(&self, id: &str) -> Option<JobStatus> {
        let status = self.store.with_job(id, |record| {
            if record.status.is_terminal() {
                return record.status;
            }
            record.status = JobStatus::Cancelling;
            record.push_log(LogLevel::Warn, "Cancellation requested.");
            JobStatus::Cancelling
        })?;

        if status == JobStatus::Cancelling {
            if let Some(token) = self.cancel_tokens.get(id) {
                token.cancel();
            }
            log::info!("Cancellation requested for job {}", id);
        }
        Some(status)
    }

    async fn run_job(self: Arc<Self>, id: JobId, token: CancellationToken) {
        self.metrics.job_started();
        log::info!("Job {} starting", id);

        let plan = self.begin_job(id.as_str());
        let Some((targets, selections, advanced, results_path)) = plan else {
            log::error!("Job {} vanished before it could run", id);
            self.cancel_tokens.remove(id.as_str());
            self.metrics.job_finished();
            return;
        };

        // A job timeout acts as an implicit cancellation request.
        let job_deadline = advanced
            .job_timeout
            .map(Duration::from_secs)
            .or(self.config.job_timeout);
        let watchdog = job_deadline.map(|deadline| {
            let executor = Arc::clone(&self);
            let watch_token = token.clone();
            let job_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if !watch_token.is_cancelled() {
                    log::warn!(
                        "Job {} exceeded its {}s deadline, cancelling",
                        job_id,
                        deadline.as_secs()
                    );
                    executor.store.with_job(job_id.as_str(), |record| {
                        if record.status.is_terminal() {
                            return;
                        }
                        record.status = JobStatus::Cancelling;
                        record.push_log(
                            LogLevel::Error,
                            format!("Job timeout of {}s exceeded.", deadline.as_secs()),
                        );
                    });
                    watch_token.cancel();
                }
            })
        });

        let per_job = Arc::new(Semaphore::new(self.config.per_job_units));
        let mut tasks = JoinSet::new();
        for sel in &selections {
            for target in &targets {
                let executor = Arc::clone(&self);
                let per_job = Arc::clone(&per_job);
                let token = token.clone();
                let id = id.clone();
                let sel = sel.clone();
                let target = target.clone();
                let results_path = results_path.clone();
                let tool_timeout = advanced.tool_timeout;
                tasks.spawn(async move {
                    executor
                        .run_one_unit(id, sel, target, results_path, tool_timeout, per_job, token)
                        .await;
                });
            }
        }
        while tasks.join_next().await.is_some() {}

        if let Some(handle) = watchdog {
            handle.abort();
        }

        let cancelled = token.is_cancelled();
        self.finish_job(id.as_str(), cancelled);

        // Archive whatever landed on disk, including partial results from a
        // cancelled job.
        let snapshot = self.store.snapshot(id.as_str(), 0);
        if let Some(snapshot) = snapshot {
            let record_for_zip = self
                .store
                .with_job(id.as_str(), |record| record.clone());
            if let Some(record_for_zip) = record_for_zip {
                let packaged =
                    tokio::task::spawn_blocking(move || archive::package_job(&record_for_zip))
                        .await;
                match packaged {
                    Ok(Ok(Some(_))) => {
                        self.store.with_job(id.as_str(), |record| {
                            record.zip_path = Some(common::archive_download_path(&record.id));
                            record.push_log(LogLevel::Info, "Results archive is ready.");
                        });
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        log::error!("Failed to package job {}: {}", id, e);
                        self.store.with_job(id.as_str(), |record| {
                            record.push_log(
                                LogLevel::Warn,
                                format!("Failed to package results: {}", e),
                            );
                        });
                    }
                    Err(e) => log::error!("Archive task for job {} panicked: {}", id, e),
                }
            }
            log::info!("Job {} finished as {}", id, snapshot.status);
        }

        self.cancel_tokens.remove(id.as_str());
        self.metrics.job_finished();
    }

    /// Transition a queued job to RUNNING and capture its execution plan.
    /// A cancellation that landed while the job was still queued stays in
    /// place.
    fn begin_job(
        &self,
        id: &str,
    ) -> Option<(Vec<String>, Vec<ToolSelection>, AdvancedOptions, PathBuf)> {
        self.store.with_job(id, |record| {
            if record.status == JobStatus::Pending {
                record.status = JobStatus::Running;
            }
            record.start_timestamp = Some(chrono::Utc::now());
            record.push_log(
                LogLevel::Info,
                format!(
                    "Starting scan against {} target(s) with {} tool(s).",
                    record.targets.len(),
                    record.selected_tools.len()
                ),
            );
            (
                record.targets.clone(),
                record.selected_tools.clone(),
                record.advanced_options.clone(),
                record.results_path.clone(),
            )
        })
    }

    /// Write the job's final state once every unit is done. A job that is
    /// already terminal keeps that outcome; a storage fault can force ERROR
    /// while units are still in flight.
    fn finish_job(&self, id: &str, cancelled: bool) {
        self.store.with_job(id, |record| {
            if record.status.is_terminal() {
                return;
            }
            record.status = record.derive_terminal_status(cancelled);
            record.end_timestamp = Some(chrono::Utc::now());
            if !cancelled {
                record.overall_progress = 100;
            }
            let level = match record.status {
                JobStatus::Completed => LogLevel::Success,
                JobStatus::CompletedWithErrors => LogLevel::Warn,
                _ => LogLevel::Error,
            };
            record.push_log(level, format!("Job finished with status {}.", record.status));
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_unit(
        &self,
        id: JobId,
        sel: ToolSelection,
        target: String,
        results_path: PathBuf,
        tool_timeout: Option<u64>,
        per_job: Arc<Semaphore>,
        token: CancellationToken,
    ) {
        let key = unit_key(&sel.id, &target);

        let Ok(_job_permit) = per_job.acquire().await else {
            return;
        };
        let Ok(_global_permit) = self.global_units.acquire().await else {
            return;
        };

        // Units that never started under a cancelled job are skipped, not
        // cancelled.
        if token.is_cancelled() {
            self.store.with_job(id.as_str(), |record| {
                if let Some(unit) = record.tool_progress.get_mut(&key) {
                    unit.status = UnitStatus::Skipped;
                    unit.end_time = Some(chrono::Utc::now());
                }
                record.recompute_progress();
            });
            return;
        }

        let Some(tool) = self.catalog.get(&sel.id).cloned() else {
            self.store.with_job(id.as_str(), |record| {
                if let Some(unit) = record.tool_progress.get_mut(&key) {
                    unit.status = UnitStatus::Error;
                    unit.error_message = Some(format!("Unknown tool: {}", sel.id));
                }
                record.recompute_progress();
            });
            return;
        };

        let output_dir = results_path.join(TOOL_OUTPUTS_DIR);
        let file_base = output_file_base(&tool.id, &target);
        let ctx = CommandContext {
            target: &target,
            job_dir: &results_path,
            output_dir: &output_dir,
            file_base: &file_base,
        };
        let built = match build_command(&tool, &sel, &ctx) {
            Ok(built) => built,
            Err(e) => {
                log::error!("Job {}: cannot build command for {}: {}", id, key, e);
                self.store.with_job(id.as_str(), |record| {
                    if let Some(unit) = record.tool_progress.get_mut(&key) {
                        unit.status = UnitStatus::Error;
                        unit.end_time = Some(chrono::Utc::now());
                        unit.error_message = Some(format!("Command build failed: {}", e));
                    }
                    record.push_log(
                        LogLevel::Error,
                        format!("{} on {}: command build failed: {}", tool.name, target, e),
                    );
                    record.recompute_progress();
                });
                self.metrics.record_failure(&tool.id);
                return;
            }
        };

        // Precedence: request override, then the tool's own timeout, then the
        // server-wide default.
        let timeout_secs = tool_timeout
            .or((tool.timeout > 0).then_some(tool.timeout))
            .unwrap_or(self.config.default_tool_timeout.as_secs());
        let timeout = Duration::from_secs(timeout_secs);
        let display = built.display.clone();
        self.store.with_job(id.as_str(), |record| {
            if let Some(unit) = record.tool_progress.get_mut(&key) {
                unit.status = UnitStatus::Running;
                unit.start_time = Some(chrono::Utc::now());
                unit.command = Some(display.clone());
            }
            record.push_log(LogLevel::Command, display.clone());
        });
        self.metrics.record_execution(&tool.id);
        log::info!(target: "job_output", "[{}] {} on {}: {}", id, tool.name, target, display);

        let outcome = runner::run_unit(&built, &output_dir, &file_base, timeout, &token).await;

        match outcome.status {
            UnitStatus::Completed => self.metrics.record_success(&tool.id, outcome.duration_ms),
            UnitStatus::Cancelled => {}
            _ => self.metrics.record_failure(&tool.id),
        }

        self.store.with_job(id.as_str(), |record| {
            if let Some(unit) = record.tool_progress.get_mut(&key) {
                unit.status = outcome.status;
                unit.end_time = Some(chrono::Utc::now());
                unit.error_message = outcome.error_message.clone();
                unit.output_file = outcome.artifact.clone();
            }
            match outcome.status {
                UnitStatus::Completed => record.push_log(
                    LogLevel::Success,
                    format!("{} finished on {}.", tool.name, target),
                ),
                UnitStatus::Cancelled => record.push_log(
                    LogLevel::Warn,
                    format!("{} on {} was cancelled.", tool.name, target),
                ),
                _ => record.push_log(
                    LogLevel::Error,
                    format!(
                        "{} on {} failed: {}",
                        tool.name,
                        target,
                        outcome
                            .error_message
                            .as_deref()
                            .unwrap_or("unknown error")
                    ),
                ),
            }
            record.recompute_progress();
        });
    }
}

fn normalize_targets(raw: &[String]) -> Result<Vec<String>, StartError> {
    let mut targets = Vec::new();
    for entry in raw {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(StartError::Validation(format!(
                "Invalid target: {}",
                trimmed
            )));
        }
        if !targets.iter().any(|t| t == trimmed) {
            targets.push(trimmed.to_string());
        }
    }
    if targets.is_empty() {
        return Err(StartError::Validation("No targets provided".to_string()));
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn executor_over(store: Arc<JobStore>) -> Executor {
        Executor::new(
            store,
            Arc::new(Catalog::builtin()),
            Arc::new(MetricsCollector::new()),
            ExecutorConfig {
                jobs_dir: std::env::temp_dir().join("scanhive-executor-tests"),
                per_job_units: 2,
                max_total_units: 4,
                default_tool_timeout: Duration::from_secs(60),
                job_timeout: None,
            },
        )
    }

    fn record(id: &str, unit_status: UnitStatus) -> JobRecord {
        let mut unit = UnitState::pending("echoer", "Echoer");
        unit.status = unit_status;
        let mut units = BTreeMap::new();
        units.insert(unit_key("echoer", "localhost"), unit);
        JobRecord::new(
            JobId::from(id),
            format!("Scan {}", id),
            vec!["localhost".to_string()],
            Vec::new(),
            AdvancedOptions::default(),
            units,
            std::env::temp_dir().join("scanhive-executor-tests").join(id),
        )
    }

    fn store_with(rec: JobRecord) -> Arc<JobStore> {
        let store = Arc::new(JobStore::open(Db::in_memory().unwrap()).unwrap());
        store.create(rec).unwrap();
        store
    }

    #[test]
    fn begin_marks_queued_jobs_running() {
        let store = store_with(record("j1", UnitStatus::Pending));
        let executor = executor_over(Arc::clone(&store));

        let plan = executor.begin_job("j1");
        assert!(plan.is_some());
        assert_eq!(store.status("j1"), Some(JobStatus::Running));
    }

    #[test]
    fn cancellation_of_a_queued_job_survives_job_start() {
        let store = store_with(record("j1", UnitStatus::Pending));
        store.with_job("j1", |rec| rec.status = JobStatus::Cancelling);
        let executor = executor_over(Arc::clone(&store));

        let plan = executor.begin_job("j1");
        assert!(plan.is_some());
        assert_eq!(store.status("j1"), Some(JobStatus::Cancelling));
    }

    #[test]
    fn finish_keeps_a_storage_faulted_job_in_error() {
        // All units completed, but a mid-flight storage fault already drove
        // the job terminal; the final write must not resurrect it.
        let store = store_with(record("j1", UnitStatus::Completed));
        store.with_job("j1", |rec| {
            rec.status = JobStatus::Error;
            rec.error_message = Some("Storage fault: disk I/O error".to_string());
            rec.end_timestamp = Some(chrono::Utc::now());
        });
        let executor = executor_over(Arc::clone(&store));

        executor.finish_job("j1", false);
        let snap = store.snapshot("j1", 0).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert_eq!(
            snap.error_message.as_deref(),
            Some("Storage fault: disk I/O error")
        );
    }

    #[test]
    fn finish_resolves_a_running_job() {
        let store = store_with(record("j1", UnitStatus::Completed));
        store.with_job("j1", |rec| rec.status = JobStatus::Running);
        let executor = executor_over(Arc::clone(&store));

        executor.finish_job("j1", false);
        let snap = store.snapshot("j1", 0).unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.overall_progress, 100);
    }

    #[test]
    fn targets_are_trimmed_and_deduplicated() {
        let raw = vec![
            "  10.0.0.5 ".to_string(),
            "10.0.0.5".to_string(),
            "".to_string(),
            "example.com".to_string(),
        ];
        let targets = normalize_targets(&raw).unwrap();
        assert_eq!(targets, vec!["10.0.0.5", "example.com"]);
    }

    #[test]
    fn blank_target_list_is_rejected() {
        let err = normalize_targets(&["  ".to_string()]).unwrap_err();
        assert!(matches!(err, StartError::Validation(_)));
    }

    #[test]
    fn embedded_whitespace_is_rejected() {
        let err = normalize_targets(&["10.0.0.5; rm x".to_string()]).unwrap_err();
        assert!(matches!(err, StartError::Validation(_)));
    }
}
