//! Rendered notification and the webhook wire payload built from it.
//!
//! The payload carries the message twice, nested under `email` and flattened
//! at the top level, for downstream workflow tools that only read flat fields.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::tasks::Task;
use crate::validation::retain_valid_copies;

/// The message produced for one firing, independent of delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub from: Option<String>,
    pub from_name: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub priority: String,
    pub attachments: Vec<Value>,
}

impl Notification {
    /// Fill sender, recipients and defaults from the task's email settings.
    pub fn for_task(task: &Task, body: String) -> Self {
        let email = task.email_config.as_ref();
        let from = email.map(|e| e.from.clone()).filter(|f| !f.is_empty());
        let from_name = email
            .and_then(|e| e.from_name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| {
                from.as_deref()
                    .and_then(|f| f.split('@').next())
                    .filter(|local| !local.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "Task Scheduler".to_string());
        let subject = email
            .and_then(|e| e.subject.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Task Notification: {}", task.description));
        let html = email
            .and_then(|e| e.html_message.clone())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| body.clone());

        Self {
            from,
            from_name,
            to: email.map(|e| e.to.clone()).unwrap_or_default(),
            cc: email
                .map(|e| retain_valid_copies(&task.id, "cc", &e.cc))
                .unwrap_or_default(),
            bcc: email
                .map(|e| retain_valid_copies(&task.id, "bcc", &e.bcc))
                .unwrap_or_default(),
            subject,
            html,
            text: body,
            priority: email
                .and_then(|e| e.priority.clone())
                .unwrap_or_else(|| "normal".to_string()),
            attachments: email.map(|e| e.attachments.clone()).unwrap_or_default(),
        }
    }

    /// Recipients joined as `"a@x.com, b@x.com"`.
    pub fn to_joined(&self) -> String {
        self.to.join(", ")
    }
}

/// Everything a channel needs to deliver one firing.
#[derive(Debug, Clone)]
pub struct Firing<'a> {
    pub task: &'a Task,
    pub notification: &'a Notification,
    /// Render context, forwarded to the webhook as `email.variables`.
    pub variables: &'a Map<String, Value>,
    /// Frequency name, or `"manual"` for a manual trigger.
    pub execution_type: &'a str,
    pub execution_id: &'a str,
    pub webhook_url: &'a str,
    pub triggered_rules: &'a [usize],
    pub now: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub task_id: String,
    pub task_description: String,
    pub frequency: String,
    pub execution_type: String,
    pub timestamp: String,
    pub email: EmailSection,

    pub from: Option<String>,
    pub to: String,
    pub to_array: Vec<String>,
    pub subject: String,
    pub body: String,
    pub message: String,
    pub text: String,

    pub context: PayloadContext,
    pub action: PayloadAction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSection {
    pub from: Option<String>,
    pub from_name: String,
    pub to: Vec<String>,
    #[serde(rename = "toString")]
    pub to_joined: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub message: String,
    pub html_message: String,
    pub text: String,
    pub priority: String,
    pub attachments: Vec<Value>,
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadContext {
    pub webhook_url: String,
    pub execution_id: String,
    pub timezone: String,
    pub server_time: String,
    pub scheduling: Scheduling,
    pub conditional_rules: RulesSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    pub frequency: String,
    pub time: String,
    pub weekly_day: Option<String>,
    pub selected_days: Vec<String>,
    pub datetime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesSummary {
    pub triggered: Vec<usize>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadAction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub requires_email: bool,
    pub validate_email: bool,
    pub log_execution: bool,
}

impl Default for PayloadAction {
    fn default() -> Self {
        Self {
            kind: "send_email",
            requires_email: true,
            validate_email: true,
            log_execution: true,
        }
    }
}

impl WebhookPayload {
    pub fn from_firing(firing: &Firing<'_>) -> Self {
        let task = firing.task;
        let n = firing.notification;
        let timestamp = firing
            .now
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        Self {
            task_id: task.id.clone(),
            task_description: task.description.clone(),
            frequency: task.frequency.as_str().to_string(),
            execution_type: firing.execution_type.to_string(),
            timestamp: timestamp.clone(),
            email: EmailSection {
                from: n.from.clone(),
                from_name: n.from_name.clone(),
                to: n.to.clone(),
                to_joined: n.to_joined(),
                cc: n.cc.clone(),
                bcc: n.bcc.clone(),
                subject: n.subject.clone(),
                body: n.text.clone(),
                message: n.text.clone(),
                html_message: n.html.clone(),
                text: n.text.clone(),
                priority: n.priority.clone(),
                attachments: n.attachments.clone(),
                variables: firing.variables.clone(),
            },
            from: n.from.clone(),
            to: n.to_joined(),
            to_array: n.to.clone(),
            subject: n.subject.clone(),
            body: n.text.clone(),
            message: n.text.clone(),
            text: n.text.clone(),
            context: PayloadContext {
                webhook_url: firing.webhook_url.to_string(),
                execution_id: firing.execution_id.to_string(),
                timezone: format!("UTC{}", firing.now.offset()),
                server_time: timestamp,
                scheduling: Scheduling {
                    frequency: task.frequency.as_str().to_string(),
                    time: task.time.clone(),
                    weekly_day: task.weekly_day.clone(),
                    selected_days: task.selected_days.clone(),
                    datetime: task.datetime,
                },
                conditional_rules: RulesSummary {
                    triggered: firing.triggered_rules.to_vec(),
                    total: task.conditional_rules.len(),
                },
            },
            action: PayloadAction::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{EmailConfig, RuleAction};
    use chrono::TimeZone;
    use serde_json::json;

    fn task() -> Task {
        Task::daily("t1", "Standup", "09:30")
            .with_email(EmailConfig {
                from: "bot@x.com".into(),
                to: vec!["a@x.com".into(), "b@x.com".into()],
                ..Default::default()
            })
            .with_rule("5 > 3", RuleAction::Log)
    }

    #[test]
    fn test_notification_defaults() {
        let n = Notification::for_task(&task(), "hello".into());
        assert_eq!(n.from_name, "bot");
        assert_eq!(n.subject, "Task Notification: Standup");
        assert_eq!(n.html, "hello");
        assert_eq!(n.priority, "normal");

        let bare = Notification::for_task(&Task::daily("t2", "x", "09:00"), String::new());
        assert_eq!(bare.from, None);
        assert_eq!(bare.from_name, "Task Scheduler");
    }

    #[test]
    fn test_malformed_copies_are_dropped() {
        let mut task = task();
        if let Some(email) = task.email_config.as_mut() {
            email.cc = vec!["broken@".into(), "c@x.com".into()];
            email.bcc = vec!["nope".into()];
        }
        let n = Notification::for_task(&task, "hello".into());
        assert_eq!(n.to, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(n.cc, vec!["c@x.com".to_string()]);
        assert!(n.bcc.is_empty());
    }

    #[test]
    fn test_payload_shape() {
        let task = task();
        let n = Notification::for_task(&task, "Body text".into());
        let vars = Map::new();
        let now = FixedOffset::east_opt(19800).unwrap().with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        let firing = Firing {
            task: &task,
            notification: &n,
            variables: &vars,
            execution_type: "daily",
            execution_id: "t1-1772423400000",
            webhook_url: "http://hook.test/exec",
            triggered_rules: &[0],
            now,
        };

        let v = serde_json::to_value(WebhookPayload::from_firing(&firing)).unwrap();
        assert_eq!(v["email"]["to"], json!(["a@x.com", "b@x.com"]));
        assert_eq!(v["email"]["toString"], json!("a@x.com, b@x.com"));
        assert_eq!(v["to"], json!("a@x.com, b@x.com"));
        assert_eq!(v["toArray"], json!(["a@x.com", "b@x.com"]));
        assert_eq!(v["email"]["htmlMessage"], json!("Body text"));
        assert_eq!(v["body"], json!("Body text"));
        assert_eq!(v["timestamp"], json!("2026-03-02T04:00:00.000Z"));
        assert_eq!(v["context"]["timezone"], json!("UTC+05:30"));
        assert_eq!(v["context"]["conditionalRules"], json!({"triggered": [0], "total": 1}));
        assert_eq!(v["context"]["scheduling"]["time"], json!("09:30"));
        assert_eq!(v["action"]["type"], json!("send_email"));
        assert_eq!(v["action"]["requiresEmail"], json!(true));
    }
}
