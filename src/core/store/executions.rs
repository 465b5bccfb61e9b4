use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{
    ExecStatus, ExecutionDayStat, ExecutionRecord, json_from_sql, opt_ts_from_sql, ts_from_sql,
    ts_to_sql,
};
use crate::core::error::Result;

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get("status")?;
    let start: String = row.get("start_time")?;
    let end: Option<String> = row.get("end_time")?;
    let params_raw: Option<String> = row.get("params")?;
    Ok(ExecutionRecord {
        id: row.get("id")?,
        script_id: row.get("script_id")?,
        chain_id: row.get("chain_id")?,
        status: status.parse::<ExecStatus>().unwrap_or(ExecStatus::Failed),
        start_time: ts_from_sql(&start),
        end_time: opt_ts_from_sql(end),
        duration_secs: row.get("duration_secs")?,
        params: json_from_sql(params_raw),
        output: row.get("output")?,
        error: row.get("error")?,
    })
}

impl Store {
    /// Create a record in the `running` state. The caller (engine or
    /// scheduler tick) is the only writer until a supervisor takes over.
    pub async fn insert_execution(
        &self,
        script_id: Option<i64>,
        chain_id: Option<i64>,
        params: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO execution_history (script_id, chain_id, status, start_time, params)
             VALUES (?1, ?2, 'running', ?3, ?4)",
            params![
                script_id,
                chain_id,
                ts_to_sql(Utc::now()),
                params.map(|v| v.to_string()),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Progress update: overwrite output/error without touching the status.
    /// Guarded on `status = 'running'` so a straggler flush can never
    /// resurrect output after the terminal write.
    pub async fn update_progress(&self, id: i64, output: &str, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE execution_history SET output = ?1, error = ?2
             WHERE id = ?3 AND status = 'running'",
            params![output, error, id],
        )?;
        Ok(changed > 0)
    }

    /// The single running→terminal transition. Sets end_time and duration
    /// together, atomically, exactly once: the `status = 'running'` guard
    /// makes a second terminal write a no-op (returns false).
    pub async fn finalize_execution(
        &self,
        id: i64,
        status: ExecStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let db = self.db.lock().await;
        let start: Option<String> = db
            .query_row(
                "SELECT start_time FROM execution_history WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(start) = start else {
            return Ok(false);
        };
        let end = Utc::now();
        let duration = (end - ts_from_sql(&start)).num_milliseconds() as f64 / 1000.0;
        let changed = db.execute(
            "UPDATE execution_history
             SET status = ?1, output = COALESCE(?2, output), error = ?3,
                 end_time = ?4, duration_secs = ?5
             WHERE id = ?6 AND status = 'running'",
            params![status.as_str(), output, error, ts_to_sql(end), duration, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM execution_history WHERE id = ?1",
                params![id],
                execution_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_executions(&self, limit: usize, offset: usize) -> Result<Vec<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT * FROM execution_history ORDER BY start_time DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], execution_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Per-day success/failure counts and average duration.
    pub async fn execution_stats(&self) -> Result<Vec<ExecutionDayStat>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT substr(start_time, 1, 10) AS day,
                    COUNT(*),
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                    AVG(duration_secs)
             FROM execution_history
             GROUP BY day ORDER BY day ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ExecutionDayStat {
                day: row.get(0)?,
                total: row.get(1)?,
                completed: row.get(2)?,
                failed: row.get(3)?,
                avg_duration_secs: row.get(4)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
