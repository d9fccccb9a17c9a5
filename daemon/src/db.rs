use crate::migrations::Migrator;
use anyhow::{Context, Result};
use common::JobRecord;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Sqlite-backed job history. One row per job; the serialized record is the
/// source of truth, with status and creation time denormalized for queries.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn new(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Migrator::new(&mut conn)
            .run_migrations()
            .context("Failed to run database migrations")?;
        Ok(Self { conn })
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Migrator::new(&mut conn).run_migrations()?;
        Ok(Self { conn })
    }

    /// Reject every further write, so tests can exercise storage faults.
    #[cfg(test)]
    pub fn set_readonly(&self) {
        self.conn
            .execute_batch("PRAGMA query_only = ON")
            .expect("failed to flip database read-only");
    }

    /// Insert or replace the row for this job.
    pub fn save_job(&self, record: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize job record")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO job (id, status, creation_timestamp, record)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.as_str(),
                    record.status.as_str(),
                    record
                        .creation_timestamp
                        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                    json
                ],
            )
            .with_context(|| format!("Failed to persist job {}", record.id))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT record FROM job WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match json {
            Some(json) => {
                let record =
                    serde_json::from_str(&json).context("Failed to deserialize job record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All persisted jobs, newest first.
    pub fn load_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM job ORDER BY creation_timestamp DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut jobs = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str(&json) {
                Ok(record) => jobs.push(record),
                Err(e) => log::error!("Skipping undecodable job row: {}", e),
            }
        }
        Ok(jobs)
    }

    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM job WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn job_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM job", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
