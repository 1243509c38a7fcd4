//! Scheduler Engine — the per-minute loop that matches, gates and fires tasks.
//! Sleeps to each wall-clock minute boundary, then ticks.
//!
//! One firing:
//! ```text
//! due? → guard → webhook default → email validation → rules → render → dispatch → record
//!          │                            │                 │
//!          └ already fired (no record)  └ failed record   └ skipped record
//! ```
//! Every per-task failure ends up in the ledger or a log line, never in the tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use futures::StreamExt;
use notiflow_core::config::{NotiflowConfig, SchedulerConfig};
use notiflow_core::error::{NotiflowError, Result};
use notiflow_core::traits::EmailTransport;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::dispatch::{Dispatcher, EmailChannel, WebhookChannel};
use crate::guard::ExecutionGuard;
use crate::payload::{Firing, Notification};
use crate::rules::{RuleContext, RuleEvaluation, evaluate_rules};
use crate::schedule;
use crate::store::TaskStore;
use crate::tasks::{
    EmailSnapshot, ErrorDetails, ExecutionRecord, ExecutionStatus, Frequency, Task,
};
use crate::template;
use crate::validation::validate_email_config;

const SKIPPED_LOG: &str = "Execution skipped due to conditional rules";
const SUCCESS_LOG: &str = "Execution completed successfully";

/// What started a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Result of one firing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FiringOutcome {
    /// A ledger record was appended.
    Recorded {
        status: ExecutionStatus,
        error: Option<String>,
    },
    /// The guard or the ledger already holds this minute. Nothing was written.
    AlreadyFired,
    /// The store failed. Nothing was written.
    StoreError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub outcome: FiringOutcome,
}

/// Per-tick summary.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub at: DateTime<FixedOffset>,
    /// Active tasks enumerated across all frequency classes.
    pub scanned: usize,
    pub outcomes: Vec<TaskOutcome>,
    pub store_errors: Vec<String>,
}

impl TickReport {
    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, FiringOutcome::Recorded { status: s, .. } if s == status))
            .count()
    }
}

/// Startup configuration audit summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub total: usize,
    pub webhooks_backfilled: usize,
    pub valid_email: usize,
    pub invalid: Vec<AuditIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIssue {
    pub task_id: String,
    pub reason: String,
}

/// Enumerates due tasks and fires them.
pub struct SchedulerEngine {
    store: Arc<dyn TaskStore>,
    dispatcher: Dispatcher,
    guard: ExecutionGuard,
    clock: Arc<dyn Clock>,
    default_webhook: String,
    concurrency: usize,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        scheduler: &SchedulerConfig,
        default_webhook: &str,
    ) -> Self {
        Self {
            store,
            dispatcher,
            guard: ExecutionGuard::new(scheduler.guard_window()),
            clock,
            default_webhook: default_webhook.to_string(),
            concurrency: scheduler.concurrency(),
        }
    }

    /// Wire an engine from configuration: system clock in the tenant offset,
    /// webhook channel, and direct email through `transport`.
    pub fn from_config(
        config: &NotiflowConfig,
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn EmailTransport>,
    ) -> Result<Self> {
        let clock = Arc::new(SystemClock::new(config.scheduler.offset()?));
        let dispatcher = Dispatcher::new(
            WebhookChannel::new(&config.webhook),
            EmailChannel::new(transport, config.smtp.timeout()),
        );
        Ok(Self::new(
            store,
            dispatcher,
            clock,
            &config.scheduler,
            &config.webhook.default_url,
        ))
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now()
    }

    /// Match every active task against the current minute and fire the due ones.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport {
            at: now,
            scanned: 0,
            outcomes: Vec::new(),
            store_errors: Vec::new(),
        };

        for frequency in Frequency::ALL {
            let tasks = match self.store.find_active_by_frequency(frequency).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!("⚠️ Failed to load {frequency} tasks: {e}");
                    report.store_errors.push(format!("{frequency}: {e}"));
                    continue;
                }
            };
            report.scanned += tasks.len();

            let due: Vec<Task> = tasks
                .into_iter()
                .filter(|task| schedule::is_due(task, &now))
                .collect();
            if due.is_empty() {
                continue;
            }

            let outcomes: Vec<TaskOutcome> = futures::stream::iter(due)
                .map(|task| self.fire(task, now, Trigger::Scheduled))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            report.outcomes.extend(outcomes);
        }

        tracing::debug!(
            "⏱️ Tick {:02}:{:02}: scanned {}, fired {} (success {}, failed {}, skipped {})",
            now.hour(),
            now.minute(),
            report.scanned,
            report.outcomes.len(),
            report.count(ExecutionStatus::Success),
            report.count(ExecutionStatus::Failed),
            report.count(ExecutionStatus::Skipped),
        );
        report
    }

    /// Manual re-fire, regardless of schedule. Same path as a scheduled firing.
    pub async fn trigger_now(&self, task_id: &str) -> Result<TaskOutcome> {
        let task = self.store.get_task(task_id).await?;
        if task.frequency == Frequency::OneTime && task.executed {
            return Err(NotiflowError::Validation(format!(
                "Task {task_id} is a one-time task that has already been executed"
            )));
        }
        tracing::info!("👆 Manual trigger for task {task_id}");
        Ok(self.fire(task, self.clock.now(), Trigger::Manual).await)
    }

    /// The task's ledger, unmodified.
    pub async fn execution_history(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.store.execution_history(task_id).await
    }

    /// Backfill missing webhook URLs and report tasks whose email settings would fail.
    pub async fn audit_tasks(&self) -> Result<AuditReport> {
        let tasks = self.store.list_tasks().await?;
        let mut report = AuditReport {
            total: tasks.len(),
            ..Default::default()
        };

        for task in &tasks {
            if !has_webhook(task) {
                match self.store.set_default_webhook(&task.id, &self.default_webhook).await {
                    Ok(()) => report.webhooks_backfilled += 1,
                    Err(e) => tracing::warn!("⚠️ Could not set default webhook on {}: {e}", task.id),
                }
            }
            match validate_email_config(task.email_config.as_ref()) {
                Ok(()) => report.valid_email += 1,
                Err(e) => report.invalid.push(AuditIssue {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        tracing::info!(
            "🔧 Task audit: {} total, {} webhooks backfilled, {} valid email, {} invalid",
            report.total,
            report.webhooks_backfilled,
            report.valid_email,
            report.invalid.len()
        );
        for issue in &report.invalid {
            tracing::warn!("⚠️ Task {}: {}", issue.task_id, issue.reason);
        }
        Ok(report)
    }

    /// Create or replace a task document. A new task starts at version 1; an
    /// update that changes the template, variables or email settings appends a
    /// version. Returns the version recorded, if any.
    pub async fn upsert_task(&self, mut task: Task, changed_by: Option<&str>) -> Result<Option<u32>> {
        let at = self.clock.now().with_timezone(&Utc);
        let version = match self.store.get_task(&task.id).await {
            Ok(existing) => {
                let changed = existing.template != task.template
                    || existing.variables != task.variables
                    || existing.email_config != task.email_config;
                if task.version_history.is_empty() {
                    task.version_history = existing.version_history;
                }
                changed.then(|| task.record_version(changed_by, "Updated version", at))
            }
            Err(NotiflowError::NotFound(_)) => task
                .version_history
                .is_empty()
                .then(|| task.record_version(changed_by, "Initial version", at)),
            Err(e) => return Err(e),
        };
        self.store.save_task(&task).await?;
        Ok(version)
    }

    /// Restore a task's content from an earlier version. Returns the new version number.
    pub async fn rollback_task(&self, task_id: &str, version: u32, changed_by: Option<&str>) -> Result<u32> {
        let mut task = self.store.get_task(task_id).await?;
        let restored = task.rollback(version, changed_by, self.clock.now().with_timezone(&Utc))?;
        self.store.save_task(&task).await?;
        Ok(restored)
    }

    async fn fire(&self, mut task: Task, now: DateTime<FixedOffset>, trigger: Trigger) -> TaskOutcome {
        let task_id = task.id.clone();
        let outcome = match self.fire_inner(&mut task, now, trigger).await {
            Ok(outcome) => outcome,
            Err(NotiflowError::DuplicateExecution { .. }) => FiringOutcome::AlreadyFired,
            Err(e) => {
                tracing::warn!("⚠️ Task {task_id} could not be recorded: {e}");
                FiringOutcome::StoreError(e.to_string())
            }
        };
        TaskOutcome { task_id, outcome }
    }

    async fn fire_inner(
        &self,
        task: &mut Task,
        now: DateTime<FixedOffset>,
        trigger: Trigger,
    ) -> Result<FiringOutcome> {
        let executed_at = now.with_timezone(&Utc);
        if !self.guard.try_acquire(&task.id, &now) || task.has_record_for_minute(&executed_at) {
            return Ok(FiringOutcome::AlreadyFired);
        }

        let execution_type = match trigger {
            Trigger::Scheduled => task.frequency.as_str(),
            Trigger::Manual => "manual",
        };
        tracing::info!(
            "🔔 Firing task '{}' ({}) [{execution_type}]",
            task.description,
            task.id
        );

        if !has_webhook(task) {
            if let Err(e) = self.store.set_default_webhook(&task.id, &self.default_webhook).await {
                tracing::warn!("⚠️ Could not persist default webhook for {}: {e}", task.id);
            }
            task.webhook_url = Some(self.default_webhook.clone());
        }
        let webhook_url = task.webhook_url.clone().unwrap_or_default();

        let mut record = ExecutionRecord {
            executed_at,
            status: ExecutionStatus::Success,
            execution_id: format!("{}-{}", task.id, now.timestamp_millis()),
            webhook_url: webhook_url.clone(),
            manual_trigger: trigger == Trigger::Manual,
            triggered_rules: Vec::new(),
            logs: Vec::new(),
            version_used: task.current_version(),
            compiled_template: None,
            reference: None,
            error: None,
            error_details: None,
            email_config: None,
        };

        // Configuration errors are terminal for this firing and never retried.
        if let Err(e) = validate_email_config(task.email_config.as_ref()) {
            let message = e.to_string();
            tracing::warn!("❌ Task {} has invalid email configuration: {message}", task.id);
            record.logs.push(format!("Execution failed: {message}"));
            fail(&mut record, task, "VALIDATION", message.clone());
            self.store.record_firing(&task.id, record, false).await?;
            return Ok(FiringOutcome::Recorded {
                status: ExecutionStatus::Failed,
                error: Some(message),
            });
        }

        let RuleEvaluation {
            triggered_rules,
            should_proceed,
            logs,
        } = evaluate_rules(&task.conditional_rules, &RuleContext::for_firing(task, execution_type, now));
        record.triggered_rules = triggered_rules;
        record.logs = logs;

        if !should_proceed {
            tracing::info!("⏭️ Task {} skipped by conditional rules", task.id);
            record.status = ExecutionStatus::Skipped;
            record.logs.push(SKIPPED_LOG.to_string());
            self.store.record_firing(&task.id, record, false).await?;
            return Ok(FiringOutcome::Recorded {
                status: ExecutionStatus::Skipped,
                error: None,
            });
        }

        let variables = template::render_context(task, &now);
        let body = render_body(task, &variables);
        let notification = Notification::for_task(task, body.clone());
        let firing = Firing {
            task,
            notification: &notification,
            variables: &variables,
            execution_type,
            execution_id: &record.execution_id,
            webhook_url: &webhook_url,
            triggered_rules: &record.triggered_rules,
            now,
        };
        let result = self.dispatcher.dispatch(&firing).await;
        record.compiled_template = Some(body);

        let (status, error, mark_executed) = if result.ok {
            record.reference = result.reference;
            record.logs.push(SUCCESS_LOG.to_string());
            (ExecutionStatus::Success, None, task.frequency == Frequency::OneTime)
        } else {
            let message = result.error.unwrap_or_else(|| "Dispatch failed".to_string());
            let kind = result.failure.map_or("DISPATCH", |k| k.as_str());
            tracing::warn!("❌ Task {} dispatch failed: {message}", task.id);
            record.logs.push(format!("Execution failed: {message}"));
            fail(&mut record, task, kind, message.clone());
            (ExecutionStatus::Failed, Some(message), false)
        };

        self.store.record_firing(&task.id, record, mark_executed).await?;
        Ok(FiringOutcome::Recorded { status, error })
    }
}

fn has_webhook(task: &Task) -> bool {
    task.webhook_url.as_deref().is_some_and(|u| !u.trim().is_empty())
}

/// Rendered template, or the configured message, or a generic line.
fn render_body(task: &Task, variables: &serde_json::Map<String, serde_json::Value>) -> String {
    match task.template.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(source) => template::render(source, variables),
        None => task
            .email_config
            .as_ref()
            .and_then(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("Your scheduled task \"{}\" has been executed.", task.description)),
    }
}

fn fail(record: &mut ExecutionRecord, task: &Task, kind: &str, message: String) {
    record.status = ExecutionStatus::Failed;
    record.error_details = Some(ErrorDetails {
        kind: kind.to_string(),
        message: message.clone(),
        timestamp: record.executed_at,
    });
    record.error = Some(message);
    record.email_config = task.email_config.as_ref().map(EmailSnapshot::from);
}

/// Time from `now` until the next whole minute.
fn until_next_minute(now: &DateTime<FixedOffset>) -> Duration {
    let into_minute = Duration::from_secs(u64::from(now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000));
    Duration::from_secs(60).saturating_sub(into_minute)
}

/// Run the scheduler loop. Every iteration sleeps to the next minute boundary
/// of the engine clock, so a stepped or drifting wall clock cannot skip a
/// minute. Ticks never overlap: the next sleep starts after the previous tick.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>) {
    tracing::info!("⏰ Scheduler started (every minute, on the minute)");

    loop {
        tokio::time::sleep(until_next_minute(&engine.now())).await;
        let report = engine.tick().await;
        for outcome in &report.outcomes {
            if let FiringOutcome::Recorded { status, error } = &outcome.outcome {
                match error {
                    Some(e) => tracing::info!("📣 [{}] {status}: {e}", outcome.task_id),
                    None => tracing::info!("📣 [{}] {status}", outcome.task_id),
                }
            }
        }
    }
}
