//! # Notiflow Channels
//!
//! Delivery transports used by the scheduler's direct-email mode.

pub mod email;

pub use email::SmtpMailer;
