//! Trait seams implemented by delivery backends.

pub mod email;

pub use email::EmailTransport;
