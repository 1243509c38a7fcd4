//! Task definitions — the core data model for scheduled notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A scheduled notification task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    pub user_id: String,
    pub tenant_id: String,
    /// Human-readable name, exposed to templates as `taskName`.
    pub description: String,

    pub frequency: Frequency,
    /// Local wall-clock "HH:MM".
    #[serde(default)]
    pub time: String,
    /// Weekday name, required for weekly tasks.
    #[serde(default)]
    pub weekly_day: Option<String>,
    /// Weekday names, required for selected-days tasks.
    #[serde(default)]
    pub selected_days: Vec<String>,
    /// Absolute instant, required for one-time tasks.
    #[serde(default)]
    pub datetime: Option<DateTime<Utc>>,
    /// One-time tasks only: set after the first successful firing.
    #[serde(default)]
    pub executed: bool,

    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub email_config: Option<EmailConfig>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    #[serde(default)]
    pub conditional_rules: Vec<ConditionalRule>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Confidence of an auto-created task. Advisory only.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Human review requested. Advisory only; the scheduler does not enforce it.
    #[serde(default)]
    pub needs_review: bool,

    #[serde(default)]
    pub version_history: Vec<TemplateVersion>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    1.0
}

/// How often a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "selected", alias = "selected-days")]
    SelectedDays,
    #[serde(rename = "one-time")]
    OneTime,
}

impl Frequency {
    /// Every frequency class, in the order a tick processes them.
    pub const ALL: [Frequency; 4] = [
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::SelectedDays,
        Frequency::OneTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::SelectedDays => "selected",
            Frequency::OneTime => "one-time",
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which delivery channel a task uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Webhook,
    Email,
}

/// Sender, recipients and subject of the notification email.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub from: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Fallback body when the task has no template.
    #[serde(default)]
    pub message: Option<String>,
    /// Pre-rendered HTML body.
    #[serde(default)]
    pub html_message: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

/// A guard evaluated before each firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub condition: String,
    pub action: RuleAction,
    #[serde(default)]
    pub parameters: Value,
}

/// What a triggered rule does. Only `skip` changes the firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Skip,
    Log,
    #[serde(untagged)]
    Other(String),
}

/// A saved snapshot of a task's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersion {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub email_config: Option<EmailConfig>,
    #[serde(default)]
    pub changed_by: Option<String>,
    #[serde(default)]
    pub change_description: String,
}

/// Outcome of one firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => f.write_str("success"),
            ExecutionStatus::Failed => f.write_str("failed"),
            ExecutionStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// Immutable ledger entry appended once per firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub execution_id: String,
    pub webhook_url: String,
    #[serde(default)]
    pub manual_trigger: bool,
    #[serde(default)]
    pub triggered_rules: Vec<usize>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub version_used: Option<u32>,
    #[serde(default)]
    pub compiled_template: Option<String>,
    /// Dispatch reference: HTTP status for webhooks, Message-ID for email.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_details: Option<ErrorDetails>,
    #[serde(default)]
    pub email_config: Option<EmailSnapshot>,
}

impl ExecutionRecord {
    /// Minute bucket used for the one-record-per-minute invariant.
    pub fn minute_key(&self) -> i64 {
        minute_key(&self.executed_at)
    }
}

/// Unix minutes of an instant.
pub fn minute_key(at: &DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Failure class: "VALIDATION", "HTTP_STATUS", "NETWORK", "TIMEOUT", "TRANSPORT".
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Email settings captured on a failed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSnapshot {
    pub from: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
}

impl From<&EmailConfig> for EmailSnapshot {
    fn from(config: &EmailConfig) -> Self {
        Self {
            from: config.from.clone(),
            to: config.to.clone(),
            subject: config.subject.clone(),
        }
    }
}

impl Task {
    /// Create an active task with an empty schedule. Callers fill in the schedule fields.
    pub fn new(id: &str, description: &str, frequency: Frequency) -> Self {
        Self {
            id: id.to_string(),
            user_id: String::new(),
            tenant_id: String::new(),
            description: description.to_string(),
            frequency,
            time: String::new(),
            weekly_day: None,
            selected_days: Vec::new(),
            datetime: None,
            executed: false,
            template: None,
            variables: Map::new(),
            email_config: None,
            webhook_url: None,
            delivery_mode: DeliveryMode::Webhook,
            conditional_rules: Vec::new(),
            is_active: true,
            progress: 0,
            deadline: None,
            confidence: 1.0,
            needs_review: false,
            version_history: Vec::new(),
            execution_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Daily task at "HH:MM".
    pub fn daily(id: &str, description: &str, time: &str) -> Self {
        let mut task = Self::new(id, description, Frequency::Daily);
        task.time = time.to_string();
        task
    }

    /// Weekly task on a named weekday at "HH:MM".
    pub fn weekly(id: &str, description: &str, day: &str, time: &str) -> Self {
        let mut task = Self::new(id, description, Frequency::Weekly);
        task.weekly_day = Some(day.to_string());
        task.time = time.to_string();
        task
    }

    /// Task on a set of weekdays at "HH:MM".
    pub fn selected_days(id: &str, description: &str, days: &[&str], time: &str) -> Self {
        let mut task = Self::new(id, description, Frequency::SelectedDays);
        task.selected_days = days.iter().map(|d| d.to_string()).collect();
        task.time = time.to_string();
        task
    }

    /// One-time task at an absolute instant.
    pub fn once(id: &str, description: &str, at: DateTime<Utc>) -> Self {
        let mut task = Self::new(id, description, Frequency::OneTime);
        task.datetime = Some(at);
        task
    }

    pub fn with_email(mut self, email: EmailConfig) -> Self {
        self.email_config = Some(email);
        self
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn with_rule(mut self, condition: &str, action: RuleAction) -> Self {
        self.conditional_rules.push(ConditionalRule {
            condition: condition.to_string(),
            action,
            parameters: Value::Null,
        });
        self
    }

    /// Whether the scheduler may still consider this task.
    pub fn is_schedulable(&self) -> bool {
        self.is_active && !(self.frequency == Frequency::OneTime && self.executed)
    }

    /// Latest recorded content version, if any.
    pub fn current_version(&self) -> Option<u32> {
        self.version_history.iter().map(|v| v.version).max()
    }

    /// Whether a record already exists for the minute containing `at`.
    pub fn has_record_for_minute(&self, at: &DateTime<Utc>) -> bool {
        let key = minute_key(at);
        self.execution_history.iter().any(|r| r.minute_key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_task_document() {
        let doc = json!({
            "id": "t1",
            "userId": "u1",
            "tenantId": "acme",
            "description": "Standup reminder",
            "frequency": "selected-days",
            "time": "09:30",
            "selectedDays": ["Monday", "Wednesday"],
            "template": "Hi {{name}}",
            "variables": {"name": "team"},
            "emailConfig": {"from": "bot@acme.io", "to": ["a@acme.io"]},
            "conditionalRules": [
                {"condition": "5 > 3", "action": "skip"},
                {"condition": "true", "action": "notify-manager"}
            ]
        });
        let task: Task = serde_json::from_value(doc).unwrap();
        assert_eq!(task.frequency, Frequency::SelectedDays);
        assert!(task.is_active);
        assert_eq!(task.delivery_mode, DeliveryMode::Webhook);
        assert_eq!(task.conditional_rules[0].action, RuleAction::Skip);
        assert_eq!(
            task.conditional_rules[1].action,
            RuleAction::Other("notify-manager".into())
        );
        assert_eq!(task.confidence, 1.0);
    }

    #[test]
    fn test_frequency_wire_names() {
        assert_eq!(serde_json::to_value(Frequency::SelectedDays).unwrap(), json!("selected"));
        assert_eq!(serde_json::to_value(Frequency::OneTime).unwrap(), json!("one-time"));
    }

    #[test]
    fn test_executed_one_time_is_not_schedulable() {
        let mut task = Task::once("t1", "launch", Utc::now());
        assert!(task.is_schedulable());
        task.executed = true;
        assert!(!task.is_schedulable());
    }

    #[test]
    fn test_minute_key_truncates_seconds() {
        let a = DateTime::parse_from_rfc3339("2026-03-02T09:30:05Z").unwrap().with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-03-02T09:30:59Z").unwrap().with_timezone(&Utc);
        let c = DateTime::parse_from_rfc3339("2026-03-02T09:31:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(minute_key(&a), minute_key(&b));
        assert_ne!(minute_key(&a), minute_key(&c));
    }
}
