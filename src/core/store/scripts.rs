use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{
    OutputMode, ScriptRecord, ScriptVersionRecord, ts_from_sql, ts_to_sql,
};
use crate::core::error::Result;
use crate::core::interpreter::InterpreterKind;

fn script_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScriptRecord> {
    let interpreter: String = row.get("interpreter")?;
    let output_mode: String = row.get("output_mode")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    let schema: Option<String> = row.get("param_schema")?;
    Ok(ScriptRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        interpreter: interpreter
            .parse::<InterpreterKind>()
            .unwrap_or(InterpreterKind::Shell),
        file_path: row.get("file_path")?,
        param_schema: schema.and_then(|s| serde_json::from_str(&s).ok()),
        output_mode: output_mode.parse::<OutputMode>().unwrap_or(OutputMode::Text),
        deleted: row.get::<_, i64>("deleted")? != 0,
        created_at: ts_from_sql(&created),
        updated_at: ts_from_sql(&updated),
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScriptVersionRecord> {
    let created: String = row.get("created_at")?;
    Ok(ScriptVersionRecord {
        id: row.get("id")?,
        script_id: row.get("script_id")?,
        label: row.get("label")?,
        content_hash: row.get("content_hash")?,
        is_current: row.get::<_, i64>("is_current")? != 0,
        body: row.get("body")?,
        file_path: row.get("file_path")?,
        created_at: ts_from_sql(&created),
    })
}

impl Store {
    pub async fn create_script(
        &self,
        name: &str,
        description: &str,
        interpreter: InterpreterKind,
        output_mode: OutputMode,
        param_schema: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        let now = ts_to_sql(Utc::now());
        db.execute(
            "INSERT INTO scripts (name, description, interpreter, output_mode, param_schema, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                name,
                description,
                interpreter.as_str(),
                output_mode.as_str(),
                param_schema.map(|v| v.to_string()),
                now,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Scripts are readable by id even after soft-deletion, because history
    /// keeps referencing them.
    pub async fn get_script(&self, id: i64) -> Result<Option<ScriptRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row("SELECT * FROM scripts WHERE id = ?1", params![id], script_from_row)
            .optional()?;
        Ok(record)
    }

    pub async fn list_scripts(&self) -> Result<Vec<ScriptRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT * FROM scripts WHERE deleted = 0 ORDER BY id")?;
        let rows = stmt.query_map([], script_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn update_script_path(&self, id: i64, file_path: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scripts SET file_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![file_path, ts_to_sql(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    pub async fn soft_delete_script(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scripts SET deleted = 1, updated_at = ?1 WHERE id = ?2",
            params![ts_to_sql(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    /// Insert a new current version: demotes the existing current version,
    /// inserts the new row and repoints the script's file path, all in one
    /// transaction so "exactly one current version" holds at every commit.
    pub async fn insert_version(
        &self,
        script_id: i64,
        label: &str,
        content_hash: &str,
        body: Option<&str>,
        file_path: &str,
    ) -> Result<i64> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let now = ts_to_sql(Utc::now());
        tx.execute(
            "UPDATE script_versions SET is_current = 0 WHERE script_id = ?1",
            params![script_id],
        )?;
        tx.execute(
            "INSERT INTO script_versions (script_id, label, content_hash, is_current, body, file_path, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
            params![script_id, label, content_hash, body, file_path, now],
        )?;
        let version_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE scripts SET file_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![file_path, now, script_id],
        )?;
        tx.commit()?;
        Ok(version_id)
    }

    pub async fn get_version(&self, version_id: i64) -> Result<Option<ScriptVersionRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM script_versions WHERE id = ?1",
                params![version_id],
                version_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn current_version(&self, script_id: i64) -> Result<Option<ScriptVersionRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM script_versions WHERE script_id = ?1 AND is_current = 1",
                params![script_id],
                version_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn latest_version_label(&self, script_id: i64) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let label = db
            .query_row(
                "SELECT label FROM script_versions WHERE script_id = ?1 ORDER BY id DESC LIMIT 1",
                params![script_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(label)
    }

    pub async fn list_versions(&self, script_id: i64) -> Result<Vec<ScriptVersionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT * FROM script_versions WHERE script_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![script_id], version_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
