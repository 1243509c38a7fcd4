//! SMTP email transport on async lettre.
//!
//! Built once from `SmtpConfig`. When credentials are missing the mailer still
//! exists and every send reports "Email service not configured".

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use notiflow_core::config::SmtpConfig;
use notiflow_core::traits::EmailTransport;
use notiflow_core::types::{EmailReceipt, OutgoingEmail};

pub const NOT_CONFIGURED: &str = "Email service not configured";

/// SMTP mailer.
pub struct SmtpMailer {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        let transport = if config.is_configured() {
            match build_transport(&config) {
                Ok(t) => {
                    tracing::info!("✅ Email service initialized ({}:{})", config.host.as_deref().unwrap_or(""), config.port);
                    Some(t)
                }
                Err(e) => {
                    tracing::error!("❌ Email service initialization failed: {e}");
                    None
                }
            }
        } else {
            tracing::warn!("⚠️ SMTP credentials not configured. Direct email delivery is disabled.");
            None
        };
        Self { config, transport }
    }

    /// Sender address for a message: the task's own, then EMAIL_FROM, then the SMTP user.
    fn sender(&self, email: &OutgoingEmail) -> Option<String> {
        email
            .from
            .clone()
            .or_else(|| self.config.from.clone())
            .or_else(|| self.config.username.clone())
    }
}

fn build_transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
    let host = config.host.as_deref().unwrap_or_default();
    let builder = if config.starttls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host)
    }
    .map_err(|e| format!("SMTP relay: {e}"))?;

    let creds = Credentials::new(
        config.username.clone().unwrap_or_default(),
        config.password.clone().unwrap_or_default(),
    );

    Ok(builder
        .port(config.port)
        .credentials(creds)
        .timeout(Some(config.timeout()))
        .build())
}

fn mailbox(addr: &str, name: Option<&str>) -> Result<Mailbox, String> {
    let address = addr
        .trim()
        .parse()
        .map_err(|e| format!("Invalid address '{addr}': {e}"))?;
    Ok(Mailbox::new(name.map(str::to_string), address))
}

/// Build the MIME message. Returns the message and its Message-ID.
pub fn build_message(
    from: &str,
    email: &OutgoingEmail,
) -> Result<(LettreMessage, String), String> {
    if email.to.is_empty() {
        return Err("No recipients".into());
    }
    let message_id = format!("<{}@notiflow>", uuid::Uuid::new_v4());

    let mut builder = LettreMessage::builder()
        .from(mailbox(from, email.from_name.as_deref())?)
        .subject(email.subject.clone())
        .message_id(Some(message_id.clone()));
    for to in &email.to {
        builder = builder.to(mailbox(to, None)?);
    }
    for cc in &email.cc {
        builder = builder.cc(mailbox(cc, None)?);
    }
    for bcc in &email.bcc {
        builder = builder.bcc(mailbox(bcc, None)?);
    }

    let message = match &email.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            email.text.clone(),
            html.clone(),
        )),
        None => builder.header(ContentType::TEXT_PLAIN).body(email.text.clone()),
    }
    .map_err(|e| format!("Build email: {e}"))?;

    Ok((message, message_id))
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    async fn send(&self, email: &OutgoingEmail) -> EmailReceipt {
        let Some(transport) = &self.transport else {
            tracing::warn!("Email service not available, skipping send");
            return EmailReceipt::failed(NOT_CONFIGURED);
        };
        let Some(from) = self.sender(email) else {
            return EmailReceipt::failed("No sender address configured");
        };

        let (message, message_id) = match build_message(&from, email) {
            Ok(built) => built,
            Err(e) => return EmailReceipt::failed(e),
        };

        match transport.send(message).await {
            Ok(_) => {
                tracing::info!("📤 Email sent to {}: {}", email.to.join(", "), message_id);
                EmailReceipt::sent(message_id)
            }
            Err(e) => {
                tracing::warn!("❌ Failed to send email: {e}");
                EmailReceipt::failed(format!("SMTP send: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OutgoingEmail {
        OutgoingEmail {
            from: Some("ops@example.com".into()),
            from_name: Some("Ops".into()),
            to: vec!["a@example.com".into(), "b@example.com".into()],
            cc: vec!["c@example.com".into()],
            bcc: vec![],
            subject: "Daily digest".into(),
            text: "Hello there".into(),
            html: None,
        }
    }

    #[tokio::test]
    async fn test_unconfigured_mailer_reports_failure() {
        let mailer = SmtpMailer::new(SmtpConfig::default());
        assert!(!mailer.is_configured());
        let receipt = mailer.send(&sample()).await;
        assert!(!receipt.success);
        assert_eq!(receipt.error.as_deref(), Some(NOT_CONFIGURED));
    }

    #[test]
    fn test_build_plain_message() {
        let (message, id) = build_message("ops@example.com", &sample()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Daily digest"));
        assert!(raw.contains("a@example.com"));
        assert!(raw.contains(&id));
    }

    #[test]
    fn test_build_html_message() {
        let mut email = sample();
        email.html = Some("<p>Hello there</p>".into());
        let (message, _) = build_message("ops@example.com", &email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("multipart/alternative"));
    }

    #[test]
    fn test_invalid_recipient_rejected() {
        let mut email = sample();
        email.to = vec!["not-an-email".into()];
        assert!(build_message("ops@example.com", &email).is_err());
    }

    #[test]
    fn test_sender_fallback() {
        let config = SmtpConfig {
            from: Some("default@example.com".into()),
            ..Default::default()
        };
        let mailer = SmtpMailer::new(config);
        let mut email = sample();
        email.from = None;
        assert_eq!(mailer.sender(&email).as_deref(), Some("default@example.com"));
    }
}
