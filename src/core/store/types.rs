use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::interpreter::InterpreterKind;

/// Execution record lifecycle. `Completed` and `Failed` are terminal; a
/// record leaves `Running` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Running => "running",
            ExecStatus::Completed => "completed",
            ExecStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecStatus::Running)
    }
}

impl FromStr for ExecStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecStatus::Running),
            "completed" => Ok(ExecStatus::Completed),
            "failed" => Ok(ExecStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Declared shape of a script's stdout on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Json,
    Text,
    /// Stdout names a file the script generated.
    File,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Json => "json",
            OutputMode::Text => "text",
            OutputMode::File => "file",
        }
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(OutputMode::Json),
            "text" => Ok(OutputMode::Text),
            "file" => Ok(OutputMode::File),
            other => Err(format!("unknown output mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub interpreter: InterpreterKind,
    pub file_path: String,
    /// Declared parameter schema, opaque to the engine.
    pub param_schema: Option<serde_json::Value>,
    pub output_mode: OutputMode,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptVersionRecord {
    pub id: i64,
    pub script_id: i64,
    pub label: String,
    pub content_hash: String,
    pub is_current: bool,
    pub body: Option<String>,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainNodeRecord {
    pub id: i64,
    pub chain_id: i64,
    pub script_id: i64,
    /// Execution order; ascending, gaps tolerated.
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub script_id: Option<i64>,
    pub chain_id: Option<i64>,
    pub status: ExecStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub params: Option<serde_json::Value>,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTaskRecord {
    pub id: i64,
    pub name: String,
    pub cron_expression: String,
    pub script_id: Option<i64>,
    pub chain_id: Option<i64>,
    pub active: bool,
    pub params: Option<serde_json::Value>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertRuleKind {
    StatusEquals,
    DurationExceeds,
}

impl AlertRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertRuleKind::StatusEquals => "status-equals",
            AlertRuleKind::DurationExceeds => "duration-exceeds",
        }
    }
}

impl FromStr for AlertRuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status-equals" => Ok(AlertRuleKind::StatusEquals),
            "duration-exceeds" => Ok(AlertRuleKind::DurationExceeds),
            other => Err(format!("unknown alert rule kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    Email,
    Webhook,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyKind::Email => "email",
            NotifyKind::Webhook => "webhook",
        }
    }
}

impl FromStr for NotifyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(NotifyKind::Email),
            "webhook" => Ok(NotifyKind::Webhook),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRuleRecord {
    pub id: i64,
    pub name: String,
    pub kind: AlertRuleKind,
    /// Status text for `StatusEquals`, threshold seconds for `DurationExceeds`.
    pub condition_value: String,
    pub notify_kind: NotifyKind,
    /// Channel settings: `{"recipients": [...]}` for email, `{"url": ...}`
    /// for webhook.
    pub notify_config: serde_json::Value,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertDeliveryRecord {
    pub id: i64,
    pub rule_id: i64,
    pub execution_id: i64,
    /// "sent" or "failed".
    pub outcome: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Per-day execution counts for the history dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDayStat {
    pub day: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_duration_secs: Option<f64>,
}

pub(crate) fn ts_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn opt_ts_from_sql(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(ts_from_sql)
}

pub(crate) fn json_from_sql(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|raw| serde_json::from_str(&raw).ok())
}
