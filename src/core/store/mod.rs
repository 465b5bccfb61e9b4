mod alerts;
mod chains;
mod executions;
mod schedules;
mod scripts;
pub mod types;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::Result;

/// SQLite-backed metadata store. Cheap to clone; every operation takes the
/// connection lock for its own duration only, so no caller holds a
/// transaction across an external process's lifetime.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        info!("Opened metadata store at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store, used by tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS scripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                interpreter TEXT NOT NULL,
                file_path TEXT NOT NULL DEFAULT '',
                param_schema TEXT,
                output_mode TEXT NOT NULL DEFAULT 'text',
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS script_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                script_id INTEGER NOT NULL REFERENCES scripts(id),
                label TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                is_current INTEGER NOT NULL DEFAULT 0,
                body TEXT,
                file_path TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS script_chains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS chain_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id INTEGER NOT NULL REFERENCES script_chains(id),
                script_id INTEGER NOT NULL REFERENCES scripts(id),
                rank INTEGER NOT NULL,
                UNIQUE(chain_id, rank)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS execution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                script_id INTEGER,
                chain_id INTEGER,
                status TEXT NOT NULL DEFAULT 'running',
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_secs REAL,
                params TEXT,
                output TEXT,
                error TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                script_id INTEGER,
                chain_id INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                params TEXT,
                last_run TEXT,
                next_run TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS alert_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                condition_value TEXT NOT NULL,
                notify_kind TEXT NOT NULL,
                notify_config TEXT NOT NULL DEFAULT '{}',
                active INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS alert_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER NOT NULL REFERENCES alert_rules(id),
                execution_id INTEGER NOT NULL REFERENCES execution_history(id),
                outcome TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                sent_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}
