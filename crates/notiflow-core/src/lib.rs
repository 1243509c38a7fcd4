//! # Notiflow Core
//!
//! Shared building blocks for the Notiflow workspace: configuration loading,
//! the error taxonomy, email message types and the transport trait that
//! delivery backends implement.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NotiflowConfig;
pub use error::{NotiflowError, Result};
