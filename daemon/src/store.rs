use crate::db::Db;
use anyhow::{Context, Result};
use common::{JobRecord, JobSnapshot, JobStatus, JobSummary, LogLevel};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

/// Durable job registry: an in-memory map of per-job records over sqlite.
///
/// Each record sits behind its own mutex, giving the single-writer
/// discipline the executor relies on; readers take the same lock briefly to
/// clone a consistent snapshot.
pub struct JobStore {
    jobs: DashMap<String, Arc<Mutex<JobRecord>>>,
    db: Mutex<Db>,
}

impl JobStore {
    pub fn open(db: Db) -> Result<Self> {
        let store = Self {
            jobs: DashMap::new(),
            db: Mutex::new(db),
        };

        let loaded = store.db.lock().unwrap().load_jobs()?;
        for mut record in loaded {
            // A non-terminal job in the database means the daemon died under
            // it; history must not show it running forever.
            if record.status.is_active() {
                log::warn!(
                    "Job {} was {} at startup; marking as ERROR",
                    record.id,
                    record.status
                );
                record.status = JobStatus::Error;
                record.error_message = Some("Interrupted by daemon restart".to_string());
                record.push_log(LogLevel::Error, "Job interrupted by daemon restart.");
                record.end_timestamp = Some(chrono::Utc::now());
                store.db.lock().unwrap().save_job(&record)?;
            }
            store
                .jobs
                .insert(record.id.as_str().to_string(), Arc::new(Mutex::new(record)));
        }
        log::info!("Loaded {} jobs from history", store.jobs.len());
        Ok(store)
    }

    /// Register a new job. The database write happens first; a storage
    /// failure means the job was never created.
    pub fn create(&self, record: JobRecord) -> Result<()> {
        self.db
            .lock()
            .unwrap()
            .save_job(&record)
            .context("Failed to record new job")?;
        self.jobs
            .insert(record.id.as_str().to_string(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Mutate one job under its lock and persist the result. Returns `None`
    /// for an unknown id.
    ///
    /// A persistence failure is a job fault: it is logged, escalates the job
    /// to ERROR once, and is not retried beyond the escalation write.
    pub fn with_job<T>(&self, id: &str, f: impl FnOnce(&mut JobRecord) -> T) -> Option<T> {
        let entry = self.jobs.get(id)?;
        let mut record = entry.lock().unwrap();
        let result = f(&mut record);

        if let Err(e) = self.db.lock().unwrap().save_job(&record) {
            log::error!("Storage fault for job {}: {}", id, e);
            if !record.status.is_terminal() {
                record.status = JobStatus::Error;
                record.error_message = Some(format!("Storage fault: {}", e));
                record.push_log(LogLevel::Error, format!("Storage fault: {}", e));
                record.end_timestamp = Some(chrono::Utc::now());
                if let Err(e2) = self.db.lock().unwrap().save_job(&record) {
                    log::error!("Failed to persist ERROR escalation for job {}: {}", id, e2);
                }
            }
        }
        Some(result)
    }

    /// Consistent point-in-time view of a job, logs from `log_offset`.
    pub fn snapshot(&self, id: &str, log_offset: usize) -> Option<JobSnapshot> {
        let entry = self.jobs.get(id)?;
        let record = entry.lock().unwrap();
        Some(JobSnapshot::from_record(&record, log_offset))
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        let entry = self.jobs.get(id)?;
        let status = entry.lock().unwrap().status;
        Some(status)
    }

    /// Job summaries, most recent first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .jobs
            .iter()
            .map(|entry| JobSummary::from_record(&entry.value().lock().unwrap()))
            .collect();
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        summaries
    }

    /// Remove a job from history, including its results directory. Active
    /// jobs are refused.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.jobs.get(id) else {
            return Ok(false);
        };
        let results_path = {
            let record = entry.lock().unwrap();
            if record.status.is_active() {
                anyhow::bail!("job {} is still active", id);
            }
            record.results_path.clone()
        };
        drop(entry);

        self.jobs.remove(id);
        self.db.lock().unwrap().delete_job(id)?;
        if results_path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&results_path) {
                log::warn!("Failed to remove results dir {:?}: {}", results_path, e);
            }
        }
        Ok(true)
    }

    #[cfg(test)]
    pub fn fail_writes(&self) {
        self.db.lock().unwrap().set_readonly();
    }

    pub fn zip_file_for(&self, id: &str) -> Option<std::path::PathBuf> {
        let entry = self.jobs.get(id)?;
        let record = entry.lock().unwrap();
        record.zip_path.as_ref()?;
        let parent = record.results_path.parent()?;
        Some(parent.join(common::archive_file_name(&record.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AdvancedOptions, JobId, UnitState, UnitStatus};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn record(id: &str) -> JobRecord {
        let mut units = BTreeMap::new();
        units.insert(
            common::unit_key("echo", "t"),
            UnitState::pending("echo", "Echo"),
        );
        JobRecord::new(
            JobId::from(id),
            format!("Scan {}", id),
            vec!["t".to_string()],
            Vec::new(),
            AdvancedOptions::default(),
            units,
            PathBuf::from("/tmp/scanhive-test").join(id),
        )
    }

    fn open_store() -> JobStore {
        JobStore::open(Db::in_memory().unwrap()).unwrap()
    }

    #[test]
    fn create_then_snapshot() {
        let store = open_store();
        store.create(record("j1")).unwrap();
        let snap = store.snapshot("j1", 0).unwrap();
        assert_eq!(snap.status, JobStatus::Pending);
        assert_eq!(snap.logs.len(), 1);
        assert!(store.snapshot("missing", 0).is_none());
    }

    #[test]
    fn with_job_persists_and_returns() {
        let store = open_store();
        store.create(record("j1")).unwrap();
        let progress = store
            .with_job("j1", |rec| {
                rec.status = JobStatus::Running;
                rec.tool_progress.get_mut("echo_on_t").unwrap().status = UnitStatus::Completed;
                rec.recompute_progress();
                rec.overall_progress
            })
            .unwrap();
        assert_eq!(progress, 100);
        assert_eq!(store.status("j1"), Some(JobStatus::Running));
        assert!(store.with_job("missing", |_| ()).is_none());
    }

    #[test]
    fn list_is_newest_first() {
        let store = open_store();
        let mut old = record("j-old");
        old.creation_timestamp = chrono::Utc::now() - chrono::Duration::minutes(10);
        store.create(old).unwrap();
        store.create(record("j-new")).unwrap();

        let list = store.list();
        assert_eq!(list[0].id.as_str(), "j-new");
        assert_eq!(list[1].id.as_str(), "j-old");
    }

    #[test]
    fn restart_marks_interrupted_jobs_as_error() {
        let db = Db::in_memory().unwrap();
        let mut rec = record("j1");
        rec.status = JobStatus::Running;
        db.save_job(&rec).unwrap();

        let store = JobStore::open(db).unwrap();
        let snap = store.snapshot("j1", 0).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert!(snap
            .logs
            .iter()
            .any(|l| l.message.contains("interrupted by daemon restart")));
    }

    #[test]
    fn storage_fault_escalates_the_job_to_error() {
        let store = open_store();
        store.create(record("j1")).unwrap();
        store.fail_writes();

        store.with_job("j1", |rec| rec.status = JobStatus::Running);
        let snap = store.snapshot("j1", 0).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert!(snap.error_message.unwrap().contains("Storage fault"));
        assert!(snap.end_time.is_some());

        // Once terminal, later faults leave the outcome alone.
        store.with_job("j1", |rec| rec.overall_progress = 50);
        assert_eq!(store.status("j1"), Some(JobStatus::Error));
    }

    #[test]
    fn delete_refuses_active_jobs() {
        let store = open_store();
        store.create(record("j1")).unwrap();
        assert!(store.delete("j1").is_err());

        store.with_job("j1", |rec| rec.status = JobStatus::Cancelled);
        assert!(store.delete("j1").unwrap());
        assert!(!store.contains("j1"));
        assert!(!store.delete("j1").unwrap());
    }
}
