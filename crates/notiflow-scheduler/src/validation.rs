//! Email configuration checks run before any dispatch.

use std::sync::LazyLock;

use notiflow_core::error::{NotiflowError, Result};
use regex::Regex;

use crate::tasks::EmailConfig;

#[allow(clippy::expect_used)]
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("constant regex pattern is valid"));

/// Basic `local@domain.tld` syntax check.
pub fn is_valid_email(address: &str) -> bool {
    EMAIL_RE.is_match(address)
}

/// Sender and every `to` recipient must pass [`is_valid_email`]; at least one `to` is required.
/// Copies are not checked here, see [`retain_valid_copies`].
pub fn validate_email_config(config: Option<&EmailConfig>) -> Result<()> {
    let config = match config {
        Some(c) if !c.from.trim().is_empty() && !c.to.is_empty() => c,
        _ => {
            return Err(NotiflowError::Validation(
                "Invalid email configuration: missing from or to addresses".into(),
            ));
        }
    };

    if !is_valid_email(&config.from) {
        return Err(NotiflowError::Validation(format!(
            "Invalid 'from' email format: {}",
            config.from
        )));
    }
    if let Some(bad) = config.to.iter().find(|a| !is_valid_email(a)) {
        return Err(NotiflowError::Validation(format!("Invalid 'to' email format: {bad}")));
    }
    Ok(())
}

/// Well-formed `cc`/`bcc` addresses. Malformed ones are dropped with a warning
/// instead of failing the firing.
pub fn retain_valid_copies(task_id: &str, field: &str, list: &[String]) -> Vec<String> {
    list.iter()
        .filter(|address| {
            let ok = is_valid_email(address);
            if !ok {
                tracing::warn!("⚠️ Task {task_id}: dropping malformed '{field}' address {address}");
            }
            ok
        })
        .cloned()
        .collect()
}
