//! # Notiflow Scheduler
//!
//! Minute-granularity notification scheduler with a guarded rules engine,
//! a Handlebars-style template compiler and webhook / direct-email dispatch.
//!
//! ## Design Principles
//! - At most one execution record per task per minute (guard + ledger constraint)
//! - Rule conditions are parsed, never evaluated as code
//! - A bad template or rule degrades to a visible error, never a crashed tick
//! - Tokio timers only, nothing runs between ticks
//!
//! ## Architecture
//! ```text
//! spawn_scheduler (sleep to each minute boundary)
//!   └── SchedulerEngine::tick
//!         ├── TaskStore::find_active_by_frequency (daily, weekly, selected, one-time)
//!         ├── schedule::is_due → ExecutionGuard
//!         ├── validation → rules::evaluate_rules → template::render
//!         ├── Dispatcher
//!         │     ├── WebhookChannel (JSON POST)
//!         │     └── EmailChannel (EmailTransport)
//!         └── TaskStore::record_firing (append-only ledger)
//! ```

pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod guard;
pub mod payload;
pub mod persistence;
pub mod rules;
pub mod schedule;
pub mod store;
pub mod tasks;
pub mod template;
pub mod validation;
pub mod versions;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{DispatchOutcome, Dispatcher, EmailChannel, WebhookChannel};
pub use engine::{AuditReport, FiringOutcome, SchedulerEngine, TaskOutcome, TickReport, spawn_scheduler};
pub use guard::ExecutionGuard;
pub use persistence::SqliteTaskStore;
pub use store::{FileTaskStore, TaskStore};
pub use tasks::{ExecutionRecord, ExecutionStatus, Frequency, Task};
