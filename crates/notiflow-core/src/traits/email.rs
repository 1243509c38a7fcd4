//! Email transport trait.

use async_trait::async_trait;

use crate::types::{EmailReceipt, OutgoingEmail};

/// Sends a rendered email. Failures are reported in the receipt, never raised.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Whether credentials are present. An unconfigured transport still answers `send`.
    fn is_configured(&self) -> bool;

    async fn send(&self, email: &OutgoingEmail) -> EmailReceipt;
}
