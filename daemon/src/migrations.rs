use rusqlite::{params, Connection, Result, Transaction};

const SCHEMA_VERSION: i32 = 2;

pub struct Migrator<'a> {
    conn: &'a mut Connection,
}

impl<'a> Migrator<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn run_migrations(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        log::info!("Current database schema version: {}", current_version);

        if current_version < SCHEMA_VERSION {
            log::info!(
                "Migrating database from version {} to {}",
                current_version,
                SCHEMA_VERSION
            );
            self.migrate_from(current_version)?;
        }

        Ok(())
    }

    fn get_current_version(&self) -> Result<i32> {
        let version: Result<i32> =
            self.conn
                .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                });
        Ok(version.unwrap_or(0))
    }

    fn migrate_from(&mut self, from_version: i32) -> Result<()> {
        let tx = self.conn.transaction()?;

        for version in (from_version + 1)..=SCHEMA_VERSION {
            log::info!("Applying migration to version {}", version);
            match version {
                1 => Self::migrate_to_v1(&tx)?,
                2 => Self::migrate_to_v2(&tx)?,
                _ => return Err(rusqlite::Error::InvalidQuery),
            }
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![version],
            )?;
        }

        tx.commit()
    }

    /// v1: the job table. The full record lives in the JSON `record` column;
    /// id, status, and creation_timestamp are pulled out for queries.
    fn migrate_to_v1(tx: &Transaction) -> Result<()> {
        tx.execute(
            "CREATE TABLE IF NOT EXISTS job (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                creation_timestamp TEXT NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// v2: history listing sorts by creation time.
    fn migrate_to_v2(tx: &Transaction) -> Result<()> {
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_created ON job(creation_timestamp)",
            [],
        )?;
        Ok(())
    }
}
