//! Conditional rules engine.
//!
//! Each task carries an ordered list of `{condition, action}` rules that are
//! checked before every firing. Rule text is user-authored and persisted, so it
//! is treated as untrusted input:
//!
//! ```text
//! condition string
//!   → denylist scan          (any hit → UnsafeCondition, never a value)
//!   → tokenize               (integers, true/false, allow-listed paths, comparison ops)
//!   → parse                  (literal | path | operand op operand)
//!   → evaluate on RuleContext (typed struct, no dynamic lookup)
//! ```
//!
//! Anything that tokenizes or parses badly evaluates to `false`, so a broken
//! rule never triggers rather than blocking the task.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use notiflow_core::error::{NotiflowError, Result};
use regex::Regex;

use crate::tasks::{ConditionalRule, Frequency, RuleAction, Task};

// Compile-time constant patterns; a failure here is a programming error.
#[allow(clippy::expect_used)]
static DENYLIST: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)function\s*\(", "function expression"),
        (r"=>", "arrow function"),
        (r"(?i)eval\s*\(", "eval"),
        (r"(?i)require\s*\(", "require"),
        (r"(?i)import\s*[\s(]", "import"),
        (r"(?i)process\s*\.", "process access"),
        (r"(?i)global(this)?\s*\.", "global access"),
        (r"(?i)console\s*\.", "console access"),
        (r"(?i)set(timeout|interval|immediate)", "timer scheduling"),
        (r"(?i)new\s+function", "dynamic function construction"),
        (r"(?i)__proto__", "prototype access"),
        (r"(?i)prototype", "prototype access"),
        (r"(?i)\.\s*constructor", "constructor access"),
    ]
    .into_iter()
    .map(|(pattern, label)| {
        (
            Regex::new(pattern).expect("constant regex pattern is valid"),
            label,
        )
    })
    .collect()
});

/// Facts about the task that a condition may read.
#[derive(Debug, Clone)]
pub struct TaskFacts {
    pub description: String,
    pub frequency: Frequency,
    pub progress: u8,
    pub is_active: bool,
}

/// Facts about the current firing.
#[derive(Debug, Clone)]
pub struct ExecutionFacts {
    pub timestamp: DateTime<FixedOffset>,
    pub execution_type: String,
    pub previous_executions: usize,
}

/// Local calendar facts at firing time.
#[derive(Debug, Clone)]
pub struct DateFacts {
    pub now: DateTime<FixedOffset>,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u32,
    pub hour: u32,
    pub minute: u32,
}

/// Everything a condition can see. Nothing else is reachable.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub task: TaskFacts,
    pub execution: ExecutionFacts,
    pub date: DateFacts,
}

impl RuleContext {
    pub fn for_firing(task: &Task, execution_type: &str, now: DateTime<FixedOffset>) -> Self {
        Self {
            task: TaskFacts {
                description: task.description.clone(),
                frequency: task.frequency,
                progress: task.progress,
                is_active: task.is_active,
            },
            execution: ExecutionFacts {
                timestamp: now,
                execution_type: execution_type.to_string(),
                previous_executions: task.execution_history.len(),
            },
            date: DateFacts {
                now,
                day_of_week: now.weekday().num_days_from_sunday(),
                hour: now.hour(),
                minute: now.minute(),
            },
        }
    }
}

/// An allow-listed context path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPath {
    TaskDescription,
    TaskFrequency,
    TaskProgress,
    TaskIsActive,
    ExecutionTimestamp,
    ExecutionType,
    ExecutionPreviousExecutions,
    DateNow,
    DateDayOfWeek,
    DateHour,
    DateMinute,
}

impl ContextPath {
    pub fn parse(path: &str) -> Option<Self> {
        let p = match path {
            "task.description" => Self::TaskDescription,
            "task.frequency" => Self::TaskFrequency,
            "task.progress" => Self::TaskProgress,
            "task.isActive" => Self::TaskIsActive,
            "execution.timestamp" => Self::ExecutionTimestamp,
            "execution.executionType" => Self::ExecutionType,
            "execution.previousExecutions" => Self::ExecutionPreviousExecutions,
            "date.now" => Self::DateNow,
            "date.dayOfWeek" => Self::DateDayOfWeek,
            "date.hour" => Self::DateHour,
            "date.minute" => Self::DateMinute,
            _ => return None,
        };
        Some(p)
    }

    /// Timestamps resolve to Unix seconds so they can take part in comparisons.
    fn resolve(&self, ctx: &RuleContext) -> Value {
        match self {
            Self::TaskDescription => Value::Text(ctx.task.description.clone()),
            Self::TaskFrequency => Value::Text(ctx.task.frequency.as_str().to_string()),
            Self::TaskProgress => Value::Int(i64::from(ctx.task.progress)),
            Self::TaskIsActive => Value::Bool(ctx.task.is_active),
            Self::ExecutionTimestamp => Value::Int(ctx.execution.timestamp.timestamp()),
            Self::ExecutionType => Value::Text(ctx.execution.execution_type.clone()),
            Self::ExecutionPreviousExecutions => {
                Value::Int(i64::try_from(ctx.execution.previous_executions).unwrap_or(i64::MAX))
            }
            Self::DateNow => Value::Int(ctx.date.now.timestamp()),
            Self::DateDayOfWeek => Value::Int(i64::from(ctx.date.day_of_week)),
            Self::DateHour => Value::Int(i64::from(ctx.date.hour)),
            Self::DateMinute => Value::Int(i64::from(ctx.date.minute)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    StrictEq,
    Ne,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn apply(&self, left: i64, right: i64) -> bool {
        match self {
            Self::Eq | Self::StrictEq => left == right,
            Self::Ne | Self::StrictNe => left != right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }
}

// Longest operators first so "===" is not read as "==" followed by "=".
const OPERATORS: [(&str, CompareOp); 8] = [
    ("===", CompareOp::StrictEq),
    ("!==", CompareOp::StrictNe),
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    ("<=", CompareOp::Le),
    (">=", CompareOp::Ge),
    ("<", CompareOp::Lt),
    (">", CompareOp::Gt),
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Bool(bool),
    Path(ContextPath),
    Op(CompareOp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Path(ContextPath),
}

/// Parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(bool),
    Path(ContextPath),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
}

/// Why a condition could not be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty condition")]
    Empty,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("integer out of range: {0}")]
    IntegerOverflow(String),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("unsupported expression shape")]
    Unsupported,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = input.trim_start();

    while let Some(c) = rest.chars().next() {
        if c.is_ascii_digit() {
            let end = rest.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(rest.len());
            let digits = &rest[..end];
            let n = digits
                .parse()
                .map_err(|_| ParseError::IntegerOverflow(digits.to_string()))?;
            tokens.push(Token::Int(n));
            rest = &rest[end..];
        } else if c.is_ascii_alphabetic() || c == '_' {
            let end = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'))
                .unwrap_or(rest.len());
            let ident = &rest[..end];
            let token = match ident {
                "true" => Token::Bool(true),
                "false" => Token::Bool(false),
                _ => Token::Path(
                    ContextPath::parse(ident)
                        .ok_or_else(|| ParseError::UnknownIdentifier(ident.to_string()))?,
                ),
            };
            tokens.push(token);
            rest = &rest[end..];
        } else if let Some((sym, op)) = OPERATORS.iter().find(|(sym, _)| rest.starts_with(sym)) {
            tokens.push(Token::Op(*op));
            rest = &rest[sym.len()..];
        } else {
            return Err(ParseError::UnexpectedChar(c));
        }
        rest = rest.trim_start();
    }
    Ok(tokens)
}

fn operand(token: &Token) -> Option<Operand> {
    match token {
        Token::Int(n) => Some(Operand::Int(*n)),
        Token::Path(p) => Some(Operand::Path(*p)),
        _ => None,
    }
}

/// Parse a condition. Does not run the denylist; see [`evaluate_condition`].
pub fn parse_condition(input: &str) -> std::result::Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    match tokens.as_slice() {
        [] => Err(ParseError::Empty),
        [Token::Bool(b)] => Ok(Expr::Literal(*b)),
        [Token::Path(p)] => Ok(Expr::Path(*p)),
        [l, Token::Op(op), r] => match (operand(l), operand(r)) {
            (Some(left), Some(right)) => Ok(Expr::Compare { left, op: *op, right }),
            _ => Err(ParseError::Unsupported),
        },
        _ => Err(ParseError::Unsupported),
    }
}

fn operand_int(operand: &Operand, ctx: &RuleContext) -> Option<i64> {
    match operand {
        Operand::Int(n) => Some(*n),
        Operand::Path(p) => match p.resolve(ctx) {
            Value::Int(n) => Some(n),
            _ => None,
        },
    }
}

impl Expr {
    pub fn evaluate(&self, ctx: &RuleContext) -> bool {
        match self {
            Expr::Literal(b) => *b,
            Expr::Path(p) => matches!(p.resolve(ctx), Value::Bool(true)),
            Expr::Compare { left, op, right } => {
                match (operand_int(left, ctx), operand_int(right, ctx)) {
                    (Some(l), Some(r)) => op.apply(l, r),
                    _ => false,
                }
            }
        }
    }
}

/// Reject conditions containing injection patterns.
pub fn check_condition_safety(condition: &str) -> Result<()> {
    match DENYLIST.iter().find(|(re, _)| re.is_match(condition)) {
        Some((_, label)) => Err(NotiflowError::UnsafeCondition(format!(
            "{} ({label})",
            condition.trim()
        ))),
        None => Ok(()),
    }
}

/// Evaluate one condition. Errors only for unsafe input; malformed input is `false`.
pub fn evaluate_condition(condition: &str, ctx: &RuleContext) -> Result<bool> {
    check_condition_safety(condition)?;
    match parse_condition(condition) {
        Ok(expr) => Ok(expr.evaluate(ctx)),
        Err(e) => {
            tracing::debug!("Condition '{}' not evaluable ({e}), treating as false", condition.trim());
            Ok(false)
        }
    }
}

/// Result of checking a task's rules for one firing.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvaluation {
    /// Indices into the task's rule list whose condition held.
    pub triggered_rules: Vec<usize>,
    /// False iff a triggered rule's action is `skip`.
    pub should_proceed: bool,
    pub logs: Vec<String>,
}

/// Evaluate every rule in order. One rule's failure never affects the others.
pub fn evaluate_rules(rules: &[ConditionalRule], ctx: &RuleContext) -> RuleEvaluation {
    let mut triggered_rules = Vec::new();
    let mut should_proceed = true;
    let mut logs = Vec::new();

    for (index, rule) in rules.iter().enumerate() {
        match evaluate_condition(&rule.condition, ctx) {
            Ok(true) => {
                triggered_rules.push(index);
                if rule.action == RuleAction::Skip {
                    should_proceed = false;
                }
                logs.push(format!("Rule {index} triggered: {}", rule.condition.trim()));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("⚠️ Rule {index} rejected: {e}");
                logs.push(format!("Rule {index} rejected: {e}"));
            }
        }
    }

    RuleEvaluation {
        triggered_rules,
        should_proceed,
        logs,
    }
}
