use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{ChainNodeRecord, ChainRecord, ts_from_sql, ts_to_sql};
use crate::core::error::Result;

fn chain_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChainRecord> {
    let created: String = row.get("created_at")?;
    Ok(ChainRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_at: ts_from_sql(&created),
    })
}

impl Store {
    pub async fn create_chain(&self, name: &str, description: &str) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO script_chains (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, ts_to_sql(Utc::now())],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn get_chain(&self, id: i64) -> Result<Option<ChainRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row("SELECT * FROM script_chains WHERE id = ?1", params![id], chain_from_row)
            .optional()?;
        Ok(record)
    }

    pub async fn list_chains(&self) -> Result<Vec<ChainRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT * FROM script_chains ORDER BY id")?;
        let rows = stmt.query_map([], chain_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn add_chain_node(&self, chain_id: i64, script_id: i64, rank: i64) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO chain_nodes (chain_id, script_id, rank) VALUES (?1, ?2, ?3)",
            params![chain_id, script_id, rank],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Nodes in execution order: rank ascending. Gaps in the rank sequence
    /// are tolerated; only the relative order matters.
    pub async fn chain_nodes(&self, chain_id: i64) -> Result<Vec<ChainNodeRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, chain_id, script_id, rank FROM chain_nodes
             WHERE chain_id = ?1 ORDER BY rank ASC",
        )?;
        let rows = stmt.query_map(params![chain_id], |row| {
            Ok(ChainNodeRecord {
                id: row.get(0)?,
                chain_id: row.get(1)?,
                script_id: row.get(2)?,
                rank: row.get(3)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn delete_chain(&self, id: i64) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM chain_nodes WHERE chain_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM script_chains WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(changed > 0)
    }
}
