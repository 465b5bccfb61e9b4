use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SmtpConfig;
use crate::core::error::Result;
use crate::core::store::Store;
use crate::core::store::types::{AlertRuleKind, AlertRuleRecord, ExecutionRecord, NotifyKind};

/// Delivery backend for a fired alert rule.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> NotifyKind;

    /// `config` is the rule's channel settings (recipients, url, ...).
    async fn deliver(
        &self,
        config: &serde_json::Value,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()>;
}

/// SMTP delivery via lettre.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
}

impl EmailChannel {
    pub fn new(smtp: &SmtpConfig) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.server)?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
            .build();
        Ok(Self {
            transport,
            sender: smtp.sender.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> NotifyKind {
        NotifyKind::Email
    }

    async fn deliver(
        &self,
        config: &serde_json::Value,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        let recipients: Vec<&str> = config["recipients"]
            .as_array()
            .map(|list| list.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if recipients.is_empty() {
            anyhow::bail!("alert rule has no recipients");
        }
        let mut builder = Message::builder()
            .from(self.sender.parse()?)
            .subject(subject);
        for recipient in recipients {
            builder = builder.to(recipient.parse()?);
        }
        let email = builder.body(body.to_string())?;
        self.transport.send(email).await?;
        Ok(())
    }
}

/// HTTP POST delivery; the rule config names the target url.
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> NotifyKind {
        NotifyKind::Webhook
    }

    async fn deliver(
        &self,
        config: &serde_json::Value,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        let url = config["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("alert rule has no webhook url"))?;
        self.client
            .post(url)
            .json(&serde_json::json!({ "subject": subject, "message": body }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Evaluates alert rules against executions that just reached a terminal
/// state. Channel failures are recorded and logged; they never propagate into
/// the execution path.
pub struct AlertEvaluator {
    store: Store,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl AlertEvaluator {
    pub fn new(store: Store, smtp: Option<&SmtpConfig>) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> =
            vec![Arc::new(WebhookChannel::new())];
        match smtp.map(EmailChannel::new) {
            Some(Ok(channel)) => channels.push(Arc::new(channel)),
            Some(Err(e)) => warn!("Email channel disabled: {e}"),
            None => {}
        }
        Self { store, channels }
    }

    #[cfg(test)]
    pub(crate) fn with_channels(store: Store, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { store, channels }
    }

    /// Run every active rule against a terminal execution record. Each firing
    /// rule leaves exactly one delivery record, sent or failed.
    pub async fn on_terminal(&self, record: &ExecutionRecord) -> Result<()> {
        let rules = self.store.active_alert_rules().await?;
        for rule in rules.iter().filter(|r| rule_fires(r, record)) {
            let (subject, body) = format_alert(rule, record);
            let (outcome, message) = match self.channels.iter().find(|c| c.kind() == rule.notify_kind) {
                Some(channel) => match channel.deliver(&rule.notify_config, &subject, &body).await {
                    Ok(()) => ("sent", subject.clone()),
                    Err(e) => ("failed", format!("{subject}: {e}")),
                },
                None => (
                    "failed",
                    format!("{subject}: no {} channel configured", rule.notify_kind.as_str()),
                ),
            };
            if outcome == "sent" {
                info!("Alert '{}' delivered for execution {}", rule.name, record.id);
            } else {
                warn!("Alert '{}' delivery failed for execution {}: {message}", rule.name, record.id);
            }
            self.store
                .record_delivery(rule.id, record.id, outcome, &message)
                .await?;
        }
        Ok(())
    }
}

/// Pure rule predicate, shared with tests.
pub fn rule_fires(rule: &AlertRuleRecord, record: &ExecutionRecord) -> bool {
    match rule.kind {
        AlertRuleKind::StatusEquals => rule.condition_value == record.status.as_str(),
        AlertRuleKind::DurationExceeds => match rule.condition_value.parse::<f64>() {
            Ok(threshold) => record.duration_secs.is_some_and(|d| d > threshold),
            Err(_) => {
                warn!("Alert rule {} has a non-numeric threshold, never fires", rule.id);
                false
            }
        },
    }
}

fn format_alert(rule: &AlertRuleRecord, record: &ExecutionRecord) -> (String, String) {
    let target = match (record.script_id, record.chain_id) {
        (Some(id), _) => format!("script {id}"),
        (_, Some(id)) => format!("chain {id}"),
        _ => "unknown target".to_string(),
    };
    let subject = format!(
        "[scriptdeck] {}: execution {} {}",
        rule.name,
        record.id,
        record.status.as_str()
    );
    let body = format!(
        "Execution {} of {} finished with status {}.\n\
         Started: {}\nEnded: {}\nDuration: {}\nError: {}",
        record.id,
        target,
        record.status.as_str(),
        record.start_time.to_rfc3339(),
        record
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        record
            .duration_secs
            .map(|d| format!("{d:.2}s"))
            .unwrap_or_else(|| "-".to_string()),
        record.error.as_deref().unwrap_or("-"),
    );
    (subject, body)
}
