//! Notification dispatch — delivers a rendered firing to its sink.
//! Supports: HTTP webhook (JSON POST) and direct email through an `EmailTransport`.
//!
//! Both channels return a [`DispatchOutcome`]; neither raises. Every call is
//! bounded by a timeout and a timeout counts as a failed delivery.

use std::sync::Arc;
use std::time::Duration;

use notiflow_core::config::WebhookConfig;
use notiflow_core::traits::EmailTransport;
use notiflow_core::types::OutgoingEmail;

use crate::payload::{Firing, WebhookPayload};
use crate::tasks::DeliveryMode;

/// Why a delivery failed. Stored as `errorDetails.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    HttpStatus,
    Network,
    Timeout,
    Transport,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::HttpStatus => "HTTP_STATUS",
            FailureKind::Network => "NETWORK",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::Transport => "TRANSPORT",
        }
    }
}

/// Uniform result of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub ok: bool,
    /// HTTP status for webhooks, Message-ID for email.
    pub reference: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl DispatchOutcome {
    pub fn delivered(reference: Option<String>) -> Self {
        Self {
            ok: true,
            reference,
            error: None,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            reference: None,
            error: Some(error.into()),
            failure: Some(kind),
        }
    }
}

/// JSON POST to the task's webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    timeout: Duration,
    user_agent: String,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: config.timeout(),
            user_agent: config.user_agent.clone(),
        }
    }

    pub async fn send(&self, firing: &Firing<'_>) -> DispatchOutcome {
        let payload = WebhookPayload::from_firing(firing);
        let n = firing.notification;

        let mut req = self
            .client
            .post(firing.webhook_url)
            .json(&payload)
            .timeout(self.timeout)
            .header("User-Agent", self.user_agent.as_str())
            .header("X-Task-ID", firing.task.id.as_str())
            .header("X-Execution-ID", firing.execution_id)
            .header("X-Execution-Type", firing.execution_type);
        if let Some(from) = &n.from {
            req = req.header("X-Email-From", from.as_str());
        }
        if !n.to.is_empty() {
            req = req.header("X-Email-To", n.to.join(","));
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status();
                tracing::info!("✅ Webhook delivered for task {} ({status})", firing.task.id);
                DispatchOutcome::delivered(Some(status.as_u16().to_string()))
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                DispatchOutcome::failed(
                    FailureKind::HttpStatus,
                    format!("Webhook error {status}: {}", body.trim()),
                )
            }
            Err(e) if e.is_timeout() => DispatchOutcome::failed(
                FailureKind::Timeout,
                format!("Webhook timed out after {}s", self.timeout.as_secs()),
            ),
            Err(e) => DispatchOutcome::failed(FailureKind::Network, format!("Webhook send failed: {e}")),
        }
    }
}

/// Direct email through an `EmailTransport`.
#[derive(Clone)]
pub struct EmailChannel {
    transport: Arc<dyn EmailTransport>,
    timeout: Duration,
}

impl EmailChannel {
    pub fn new(transport: Arc<dyn EmailTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn send(&self, firing: &Firing<'_>) -> DispatchOutcome {
        let n = firing.notification;
        let email = OutgoingEmail {
            from: n.from.clone(),
            from_name: Some(n.from_name.clone()),
            to: n.to.clone(),
            cc: n.cc.clone(),
            bcc: n.bcc.clone(),
            subject: n.subject.clone(),
            text: n.text.clone(),
            html: Some(n.html.clone()),
        };

        match tokio::time::timeout(self.timeout, self.transport.send(&email)).await {
            Ok(receipt) if receipt.success => {
                tracing::info!(
                    "✅ Email sent via {} for task {}: {}",
                    self.transport.name(),
                    firing.task.id,
                    n.subject
                );
                DispatchOutcome::delivered(receipt.message_id)
            }
            Ok(receipt) => DispatchOutcome::failed(
                FailureKind::Transport,
                receipt.error.unwrap_or_else(|| "Email send failed".to_string()),
            ),
            Err(_) => DispatchOutcome::failed(
                FailureKind::Timeout,
                format!("Email send timed out after {}s", self.timeout.as_secs()),
            ),
        }
    }
}

/// Routes each firing to the channel its task's delivery mode selects.
#[derive(Clone)]
pub struct Dispatcher {
    webhook: WebhookChannel,
    email: EmailChannel,
}

impl Dispatcher {
    pub fn new(webhook: WebhookChannel, email: EmailChannel) -> Self {
        Self { webhook, email }
    }

    pub async fn dispatch(&self, firing: &Firing<'_>) -> DispatchOutcome {
        match firing.task.delivery_mode {
            DeliveryMode::Webhook => self.webhook.send(firing).await,
            DeliveryMode::Email => self.email.send(firing).await,
        }
    }
}
