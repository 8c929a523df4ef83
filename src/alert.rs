//! Best-effort failure alerts posted to a webhook that fans out to Slack and
//! email. Delivery problems are returned to the caller, which only logs them.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Alerts;

const ALERT_TIMEOUT: Duration = Duration::from_secs(15);
const ENDPOINT: &str = "catalog-sync";

const TITLE_LIMIT: usize = 200;
const ERROR_LIMIT: usize = 2000;
const CONTEXT_LIMIT: usize = 8000;
const STACK_LIMIT: usize = 12000;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("invalid alert webhook URL: {0}")]
    InvalidUrl(String),
    #[error("alert webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub code: String,
    pub title: String,
    pub error: String,
    pub context: Map<String, Value>,
    pub stack: Option<String>,
    pub severity: Severity,
}

/// Short, human-readable triage code from the failing stage and error text.
pub fn compute_alert_code(stage: &str, message: &str) -> &'static str {
    let msg = message.to_lowercase();
    let has = |needle: &str| msg.contains(needle);

    if stage.contains("square") {
        if has("401") || has("403") || has("unauthorized") || has("forbidden") {
            return "SYNC-SQUARE-AUTH";
        }
        if has("429") || has("rate") {
            return "SYNC-SQUARE-RATE";
        }
        return "SYNC-SQUARE-API";
    }
    if stage.contains("db") || stage.contains("postgres") {
        if has("bad record mac") || has("ssl") || has("tls") {
            return "SYNC-DB-SSL";
        }
        if has("timeout") || has("timed out") {
            return "SYNC-DB-TIMEOUT";
        }
        if has("could not connect") || has("connection") || has("server closed") {
            return "SYNC-DB-CONN";
        }
        return "SYNC-DB-QUERY";
    }
    if stage.contains("state") {
        return "SYNC-STATE";
    }
    if stage.contains("config") {
        return "SYNC-CONFIG";
    }
    if stage.contains("categor") {
        return "SYNC-CATEGORIES";
    }
    if stage.contains("image") {
        return "SYNC-IMAGES";
    }
    if stage.contains("albums") {
        return "SYNC-ALBUMS-CACHE";
    }
    "SYNC-UNKNOWN"
}

/// Cut `s` to at most `limit` characters, marking the cut with `…`.
pub fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let mut out: String = s.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn build_payload(alert: &Alert, env: &str, now: DateTime<Utc>) -> Value {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let code = alert.code.as_str();

    let mut context = alert.context.clone();
    context.insert("alertCode".into(), Value::String(alert.code.clone()));
    // Map is ordered by key, so the pretty rendering is stable.
    let context_json = serde_json::to_string_pretty(&context).unwrap_or_default();

    let mut html = String::from("<html><body style=\"font-family: ui-sans-serif, system-ui;\">");
    html.push_str(&format!("<h2>[{code}] Catalog Sync Alert</h2>"));
    html.push_str(&format!(
        "<p><strong>Severity:</strong> {}</p>",
        alert.severity.as_str()
    ));
    html.push_str(&format!(
        "<p><strong>Title:</strong> {}</p>",
        escape_html(&truncate(&alert.title, TITLE_LIMIT))
    ));
    html.push_str(&format!(
        "<p><strong>Error:</strong> {}</p>",
        escape_html(&truncate(&alert.error, ERROR_LIMIT))
    ));
    html.push_str(&format!(
        "<h3>Context</h3><pre>{}</pre>",
        escape_html(&truncate(&context_json, CONTEXT_LIMIT))
    ));
    if let Some(stack) = alert.stack.as_deref() {
        html.push_str(&format!(
            "<h3>Stack</h3><pre>{}</pre>",
            escape_html(&truncate(stack, STACK_LIMIT))
        ));
    }
    html.push_str(&format!(
        "<p style=\"color:#666;font-size:12px;\">Timestamp: {timestamp}</p></body></html>"
    ));

    json!({
        "event": "sync.error",
        "timestamp": timestamp,
        "env": env,
        "severity": alert.severity,
        "statusCode": 500,
        "method": "SYNC",
        "endpoint": ENDPOINT,
        "title": format!("[{code}] {}", alert.title),
        "summary": format!("[{code}] {}", alert.error),
        "error": format!("[{code}] {}", alert.error),
        "errorFingerprint": code,
        "context": context,
        "stack": alert.stack,
        "stackTrace": alert.stack,
        "html": html,
    })
}

#[derive(Debug, Clone)]
pub struct AlertNotifier {
    http: Client,
    webhook: Option<Url>,
    environment: String,
}

impl AlertNotifier {
    /// A notifier that is inactive unless alerts are configured and enabled.
    pub fn from_config(cfg: &Alerts) -> Result<Self, AlertError> {
        let webhook = if cfg.is_active() {
            let raw = cfg.webhook_url.as_deref().unwrap_or_default().trim();
            Some(Url::parse(raw).map_err(|_| AlertError::InvalidUrl(raw.to_string()))?)
        } else {
            None
        };
        let http = Client::builder().timeout(ALERT_TIMEOUT).build()?;
        Ok(Self {
            http,
            webhook,
            environment: cfg.environment.clone(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.webhook.is_some()
    }

    pub async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let Some(url) = self.webhook.as_ref() else {
            debug!(code = %alert.code, "alerts disabled; not sending");
            return Ok(());
        };
        let payload = build_payload(alert, &self.environment, Utc::now());
        self.http
            .post(url.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!(code = %alert.code, severity = alert.severity.as_str(), "alert sent");
        Ok(())
    }
}
