use chrono::Utc;
use rusqlite::params;

use super::Store;
use super::types::{
    AlertDeliveryRecord, AlertRuleKind, AlertRuleRecord, NotifyKind, ts_from_sql, ts_to_sql,
};
use crate::core::error::Result;

fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRuleRecord> {
    let kind: String = row.get("kind")?;
    let notify_kind: String = row.get("notify_kind")?;
    let config: String = row.get("notify_config")?;
    Ok(AlertRuleRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: kind.parse::<AlertRuleKind>().unwrap_or(AlertRuleKind::StatusEquals),
        condition_value: row.get("condition_value")?,
        notify_kind: notify_kind.parse::<NotifyKind>().unwrap_or(NotifyKind::Email),
        notify_config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        active: row.get::<_, i64>("active")? != 0,
    })
}

impl Store {
    pub async fn create_alert_rule(
        &self,
        name: &str,
        kind: AlertRuleKind,
        condition_value: &str,
        notify_kind: NotifyKind,
        notify_config: &serde_json::Value,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO alert_rules (name, kind, condition_value, notify_kind, notify_config)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                kind.as_str(),
                condition_value,
                notify_kind.as_str(),
                notify_config.to_string(),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn active_alert_rules(&self) -> Result<Vec<AlertRuleRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT * FROM alert_rules WHERE active = 1 ORDER BY id")?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn set_rule_active(&self, id: i64, active: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE alert_rules SET active = ?1 WHERE id = ?2",
            params![active as i64, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_alert_rule(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Record one delivery attempt, successful or not. Every fired rule
    /// leaves a row here even when the channel itself errored.
    pub async fn record_delivery(
        &self,
        rule_id: i64,
        execution_id: i64,
        outcome: &str,
        message: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO alert_history (rule_id, execution_id, outcome, message, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rule_id, execution_id, outcome, message, ts_to_sql(Utc::now())],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn list_deliveries(&self, limit: usize) -> Result<Vec<AlertDeliveryRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, rule_id, execution_id, outcome, message, sent_at
             FROM alert_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let sent: String = row.get(5)?;
            Ok(AlertDeliveryRecord {
                id: row.get(0)?,
                rule_id: row.get(1)?,
                execution_id: row.get(2)?,
                outcome: row.get(3)?,
                message: row.get(4)?,
                sent_at: ts_from_sql(&sent),
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn inactive_rules_are_filtered_out() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .create_alert_rule(
                "on failure",
                AlertRuleKind::StatusEquals,
                "failed",
                NotifyKind::Email,
                &json!({"recipients": ["ops@example.com"]}),
            )
            .await
            .unwrap();
        let b = store
            .create_alert_rule(
                "slow runs",
                AlertRuleKind::DurationExceeds,
                "30",
                NotifyKind::Webhook,
                &json!({"url": "http://localhost/hook"}),
            )
            .await
            .unwrap();
        store.set_rule_active(b, false).await.unwrap();

        let active = store.active_alert_rules().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a);
        assert_eq!(active[0].kind, AlertRuleKind::StatusEquals);
        assert_eq!(active[0].notify_config["recipients"][0], "ops@example.com");
    }

    #[tokio::test]
    async fn deliveries_record_both_outcomes() {
        let store = Store::open_in_memory().unwrap();
        let rule = store
            .create_alert_rule(
                "on failure",
                AlertRuleKind::StatusEquals,
                "failed",
                NotifyKind::Email,
                &serde_json::Value::Null,
            )
            .await
            .unwrap();
        store.insert_execution(None, None, None).await.unwrap();
        store.insert_execution(None, None, None).await.unwrap();
        store.record_delivery(rule, 1, "sent", "alert: run 1 failed").await.unwrap();
        store.record_delivery(rule, 2, "failed", "smtp unreachable").await.unwrap();

        let deliveries = store.list_deliveries(10).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        // Newest first.
        assert_eq!(deliveries[0].outcome, "failed");
        assert_eq!(deliveries[1].outcome, "sent");
    }
}
