use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{ScheduledTaskRecord, json_from_sql, opt_ts_from_sql, ts_to_sql};
use crate::core::error::Result;

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTaskRecord> {
    let params_raw: Option<String> = row.get("params")?;
    let last_run: Option<String> = row.get("last_run")?;
    let next_run: Option<String> = row.get("next_run")?;
    Ok(ScheduledTaskRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        cron_expression: row.get("cron_expression")?,
        script_id: row.get("script_id")?,
        chain_id: row.get("chain_id")?,
        active: row.get::<_, i64>("active")? != 0,
        params: json_from_sql(params_raw),
        last_run: opt_ts_from_sql(last_run),
        next_run: opt_ts_from_sql(next_run),
    })
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        name: &str,
        cron_expression: &str,
        script_id: Option<i64>,
        chain_id: Option<i64>,
        params: Option<&serde_json::Value>,
        next_run: DateTime<Utc>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO scheduled_tasks (name, cron_expression, script_id, chain_id, params, next_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                cron_expression,
                script_id,
                chain_id,
                params.map(|v| v.to_string()),
                ts_to_sql(next_run),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<ScheduledTaskRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row("SELECT * FROM scheduled_tasks WHERE id = ?1", params![id], task_from_row)
            .optional()?;
        Ok(record)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT * FROM scheduled_tasks ORDER BY id")?;
        let rows = stmt.query_map([], task_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Active tasks whose next_run is at or before `now`.
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT * FROM scheduled_tasks
             WHERE active = 1 AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC",
        )?;
        let rows = stmt.query_map(params![ts_to_sql(now)], task_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Mark a task dispatched: record the run and advance next_run. Done at
    /// dispatch time so a slow execution cannot delay its own next slot.
    pub async fn task_dispatched(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scheduled_tasks SET last_run = ?1, next_run = ?2 WHERE id = ?3",
            params![ts_to_sql(last_run), ts_to_sql(next_run), id],
        )?;
        Ok(changed > 0)
    }

    pub async fn set_task_active(&self, id: i64, active: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scheduled_tasks SET active = ?1 WHERE id = ?2",
            params![active as i64, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn update_task_schedule(
        &self,
        id: i64,
        cron_expression: &str,
        next_run: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scheduled_tasks SET cron_expression = ?1, next_run = ?2 WHERE id = ?3",
            params![cron_expression, ts_to_sql(next_run), id],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn due_tasks_respects_active_flag_and_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        let past = store
            .create_task("nightly", "0 0 * * *", Some(1), None, None, now - Duration::minutes(5))
            .await
            .unwrap();
        let future = store
            .create_task("hourly", "0 * * * *", Some(2), None, None, now + Duration::hours(1))
            .await
            .unwrap();
        let paused = store
            .create_task("paused", "0 0 * * *", Some(3), None, None, now - Duration::minutes(5))
            .await
            .unwrap();
        store.set_task_active(paused, false).await.unwrap();

        let due = store.due_tasks(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past);
        assert_ne!(due[0].id, future);
    }

    #[tokio::test]
    async fn dispatch_advances_next_run_past_the_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let id = store
            .create_task("nightly", "0 0 * * *", Some(1), None, None, now - Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(store.due_tasks(now).await.unwrap().len(), 1);
        store
            .task_dispatched(id, now, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(store.due_tasks(now).await.unwrap().is_empty());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert!(task.last_run.is_some());
        assert!(task.next_run.unwrap() > now);
    }
}
