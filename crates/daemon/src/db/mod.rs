use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use engine::timeline::{Tier, TierAttemptResult};

pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                stage TEXT,
                mission TEXT NOT NULL,
                params_json TEXT NOT NULL,
                report_json TEXT,
                error TEXT,
                error_kind TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Append-only: rows are inserted and read, never updated or deleted.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tier_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                sequence_index INTEGER NOT NULL,
                tier TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                success INTEGER NOT NULL,
                artifact_path TEXT,
                failure_reason TEXT,
                measured_duration_ticks INTEGER,
                recorded_at TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tier_attempts_job ON tier_attempts(job_id)",
            [],
        )?;

        Ok(())
    }

    pub fn insert_attempt(&self, job_id: i64, attempt: &TierAttemptResult) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tier_attempts (job_id, sequence_index, tier, attempt_number, success, artifact_path, failure_reason, measured_duration_ticks, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job_id,
                attempt.sequence_index as i64,
                attempt.tier.as_str(),
                attempt.attempt_number,
                attempt.success,
                attempt.produced_artifact_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                attempt.failure_reason,
                attempt.measured_duration_ticks,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_attempts(&self, job_id: i64) -> Result<Vec<TierAttemptResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence_index, tier, attempt_number, success, artifact_path, failure_reason, measured_duration_ticks
             FROM tier_attempts WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], attempt_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn attempt_from_row(row: &Row) -> rusqlite::Result<TierAttemptResult> {
    let sequence_index: i64 = row.get(0)?;
    let tier_str: String = row.get(1)?;
    let tier: Tier = tier_str
        .parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(1, "TEXT".to_string(), rusqlite::types::Type::Text))?;
    let artifact_path: Option<String> = row.get(4)?;

    Ok(TierAttemptResult {
        sequence_index: sequence_index as usize,
        tier,
        attempt_number: row.get(2)?,
        success: row.get(3)?,
        produced_artifact_path: artifact_path.map(PathBuf::from),
        failure_reason: row.get(5)?,
        measured_duration_ticks: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_round_trip_in_append_order() {
        let db = Database::open_in_memory().unwrap();
        let failed = TierAttemptResult {
            sequence_index: 1,
            tier: Tier::Primary,
            attempt_number: 1,
            success: false,
            produced_artifact_path: None,
            failure_reason: Some("content policy rejected: blocked".to_string()),
            measured_duration_ticks: None,
        };
        let succeeded = TierAttemptResult {
            sequence_index: 1,
            tier: Tier::Secondary,
            attempt_number: 1,
            success: true,
            produced_artifact_path: Some(PathBuf::from("/w/secondary_001.mp4")),
            failure_reason: None,
            measured_duration_ticks: Some(480_000),
        };
        db.insert_attempt(7, &failed).unwrap();
        db.insert_attempt(7, &succeeded).unwrap();
        db.insert_attempt(8, &failed).unwrap();

        let attempts = db.list_attempts(7).unwrap();
        assert_eq!(attempts, vec![failed, succeeded]);
        assert!(db.list_attempts(9).unwrap().is_empty());
    }
}
