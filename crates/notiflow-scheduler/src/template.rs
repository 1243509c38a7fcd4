//! Template compiler — Handlebars templates rendered with the `handlebars` crate.
//!
//! On top of the built-in helpers (`if`, `unless`, `each`, `with`, `lookup`, ...)
//! two helpers are registered:
//! - `{{formatDate value "fmt"}}` (strftime when `fmt` has `%` directives,
//!   otherwise `M/D/YYYY, h:mm:ss AM`)
//! - `{{#ifCond a "op" b}}…{{else}}…{{/ifCond}}` with `== === != !== < <= > >=`
//!
//! [`render`] never fails: parse errors and unknown helpers come back as
//! `"Error in template: …"` so a bad template cannot break a tick.

use std::sync::LazyLock;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, Renderable,
};
use notiflow_core::error::{NotiflowError, Result};
use serde_json::{Map, Value, json};

use crate::schedule::{next_execution, weekday_name};
use crate::tasks::Task;

/// `Date.prototype.toLocaleString()` in en-US.
const LOCALE_FORMAT: &str = "%-m/%-d/%Y, %-I:%M:%S %p";

/// Metadata keys set by the scheduler. User variables never override them.
pub const RESERVED_KEYS: [&str; 10] = [
    "taskName",
    "frequency",
    "executionTime",
    "nextExecution",
    "taskId",
    "executionCount",
    "date",
    "time",
    "day",
    "datetime",
];

static REGISTRY: LazyLock<Handlebars<'static>> = LazyLock::new(registry);

fn registry() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.register_helper("formatDate", Box::new(format_date_helper));
    hb.register_helper("ifCond", Box::new(IfCond));
    hb
}

/// Compile and render, surfacing failures as `NotiflowError::Template`.
pub fn try_render(source: &str, ctx: &Map<String, Value>) -> Result<String> {
    REGISTRY
        .render_template(source, ctx)
        .map_err(|e| NotiflowError::Template(e.to_string()))
}

/// Compile and render in one step. Errors become the rendered text.
pub fn render(source: &str, ctx: &Map<String, Value>) -> String {
    try_render(source, ctx).unwrap_or_else(|e| {
        tracing::warn!("⚠️ Template compilation error: {e}");
        e.to_string()
    })
}

/// Render context for one firing: user variables, then reserved metadata on top.
pub fn render_context(task: &Task, now: &DateTime<FixedOffset>) -> Map<String, Value> {
    let mut ctx = task.variables.clone();
    let next = next_execution(task, now)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    let locale = now.format(LOCALE_FORMAT).to_string();

    let reserved = [
        json!(task.description),
        json!(task.frequency.as_str()),
        json!(locale),
        json!(next),
        json!(task.id),
        json!(task.execution_history.len()),
        json!(now.format("%Y-%m-%d").to_string()),
        json!(now.format("%H:%M").to_string()),
        json!(weekday_name(now.weekday())),
        json!(locale),
    ];
    for (key, value) in RESERVED_KEYS.iter().zip(reserved) {
        ctx.insert((*key).to_string(), value);
    }
    ctx
}

// ── Helpers ────────────────────────────────────────────────────────

fn param(h: &Helper, idx: usize) -> Value {
    h.param(idx).map(|p| p.value().clone()).unwrap_or(Value::Null)
}

fn format_date_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = h.param(1).and_then(|p| p.value().as_str());
    out.write(&format_date(&param(h, 0), format))?;
    Ok(())
}

/// `{{#ifCond left "op" right}}`
struct IfCond;

impl HelperDef for IfCond {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let op = h.param(1).and_then(|p| p.value().as_str()).unwrap_or_default();
        let branch = if compare(&param(h, 0), op, &param(h, 2)) {
            h.template()
        } else {
            h.inverse()
        };
        match branch {
            Some(t) => t.render(r, ctx, rc, out),
            None => Ok(()),
        }
    }
}

// ── Comparison and dates ───────────────────────────────────────────

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => a == b,
        _ => to_number(a) == to_number(b),
    }
}

/// `ifCond` comparison with JavaScript-style loose and strict equality.
/// An unknown operator selects the else branch.
fn compare(left: &Value, op: &str, right: &Value) -> bool {
    let ordering = || match (left, right) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => to_number(left).partial_cmp(&to_number(right)),
    };
    match op {
        "==" => loose_eq(left, right),
        "===" => strict_eq(left, right),
        "!=" => !loose_eq(left, right),
        "!==" => !strict_eq(left, right),
        "<" => ordering().is_some_and(|o| o.is_lt()),
        "<=" => ordering().is_some_and(|o| o.is_le()),
        ">" => ordering().is_some_and(|o| o.is_gt()),
        ">=" => ordering().is_some_and(|o| o.is_ge()),
        _ => false,
    }
}

fn parse_date(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim()).ok().or_else(|| {
            let day = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()?;
            Some(day.and_hms_opt(0, 0, 0)?.and_utc().fixed_offset())
        }),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|d| d.fixed_offset()),
        _ => None,
    }
}

fn format_date(value: &Value, format: Option<&str>) -> String {
    if !truthy(value) {
        return String::new();
    }
    let Some(date) = parse_date(value) else {
        return "Invalid Date".to_string();
    };
    // Unknown strftime directives would make chrono's Display fail.
    let pattern = match format {
        Some(f) if f.contains('%') && !StrftimeItems::new(f).any(|i| matches!(i, Item::Error)) => f,
        _ => LOCALE_FORMAT,
    };
    date.format(pattern).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn test_interpolation_and_escaping() {
        let c = ctx(json!({"name": "Ops & Co", "html": "<b>hi</b>", "n": 3}));
        assert_eq!(render("Hello {{name}}!", &c), "Hello Ops &amp; Co!");
        assert_eq!(render("{{html}} / {{{html}}}", &c), "&lt;b&gt;hi&lt;/b&gt; / <b>hi</b>");
        assert_eq!(render("{{ n }} items", &c), "3 items");
        assert_eq!(render("[{{missing}}]", &c), "[]");
    }

    #[test]
    fn test_nested_paths_and_comments() {
        let c = ctx(json!({"user": {"name": "Ana"}}));
        assert_eq!(render("{{user.name}}", &c), "Ana");
        assert_eq!(render("a{{! note }}b{{!-- {{x}} --}}c", &c), "abc");
    }

    #[test]
    fn test_builtin_helpers() {
        let c = ctx(json!({"items": ["a", "b"], "user": {"name": "Ana"}, "a": false, "b": true}));
        assert_eq!(render("{{#each items}}[{{this}}]{{/each}}", &c), "[a][b]");
        assert_eq!(render("{{#if a}}A{{else if b}}B{{else}}C{{/if}}", &c), "B");
        assert_eq!(render("{{#with user}}{{name}}{{/with}}", &c), "Ana");
        assert_eq!(render("{{lookup items 1}}", &c), "b");
    }

    #[test]
    fn test_if_cond_operators() {
        let c = ctx(json!({"count": 5, "label": "5", "status": "open"}));
        let t = |src: &str| render(src, &c);
        assert_eq!(t(r#"{{#ifCond count ">" 3}}many{{else}}few{{/ifCond}}"#), "many");
        assert_eq!(t(r#"{{#ifCond count "<=" 3}}many{{else}}few{{/ifCond}}"#), "few");
        assert_eq!(t(r#"{{#ifCond count "==" label}}loose{{/ifCond}}"#), "loose");
        assert_eq!(t(r#"{{#ifCond count "===" label}}strict{{else}}no{{/ifCond}}"#), "no");
        assert_eq!(t(r#"{{#ifCond count "!==" label}}differs{{/ifCond}}"#), "differs");
        assert_eq!(t(r#"{{#ifCond status "===" "open"}}Open{{/ifCond}}"#), "Open");
        assert_eq!(t(r#"{{#ifCond count "~" 5}}yes{{else}}unknown op{{/ifCond}}"#), "unknown op");
    }

    #[test]
    fn test_if_and_unless() {
        let c = ctx(json!({"urgent": true, "notes": "", "items": []}));
        assert_eq!(render("{{#if urgent}}URGENT {{/if}}msg", &c), "URGENT msg");
        assert_eq!(render("{{#if notes}}n{{else}}none{{/if}}", &c), "none");
        assert_eq!(render("{{#unless items}}empty{{/unless}}", &c), "empty");
        assert_eq!(
            render("{{#if urgent}}{{#ifCond 1 \"<\" 2}}nested{{/ifCond}}{{/if}}", &c),
            "nested"
        );
    }

    #[test]
    fn test_format_date() {
        let c = ctx(json!({"due": "2026-03-02T09:30:00Z", "day": "2026-03-02", "bad": "soon"}));
        assert_eq!(render("{{formatDate due}}", &c), "3/2/2026, 9:30:00 AM");
        assert_eq!(render(r#"{{formatDate due "%Y/%m/%d"}}"#, &c), "2026/03/02");
        assert_eq!(render(r#"{{formatDate day "%d.%m"}}"#, &c), "02.03");
        assert_eq!(render("{{formatDate bad}}", &c), "Invalid Date");
        assert_eq!(render("[{{formatDate missing}}]", &c), "[]");
        assert_eq!(render(r#"{{formatDate due "%Q"}}"#, &c), "3/2/2026, 9:30:00 AM");
    }

    #[test]
    fn test_failures_render_as_error_text() {
        let c = Map::new();
        assert!(render("{{shout name}}", &c).starts_with("Error in template:"));
        assert!(render("Hello {{name", &c).starts_with("Error in template:"));
        assert!(render("{{#if a}}x{{/unless}}", &c).starts_with("Error in template:"));
        assert!(render("{{#if a}}x", &c).starts_with("Error in template:"));
        assert!(matches!(try_render("{{#if a}}x", &c), Err(NotiflowError::Template(_))));
    }

    #[test]
    fn test_render_context_reserved_keys_win() {
        let now = FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        let mut task = Task::daily("t1", "Morning digest", "09:30");
        task.variables.insert("taskName".into(), json!("hijack"));
        task.variables.insert("team".into(), json!("ops"));

        let c = render_context(&task, &now);
        assert_eq!(c["taskName"], json!("Morning digest"));
        assert_eq!(c["team"], json!("ops"));
        assert_eq!(c["frequency"], json!("daily"));
        assert_eq!(c["date"], json!("2026-03-02"));
        assert_eq!(c["time"], json!("09:30"));
        assert_eq!(c["day"], json!("Monday"));
        assert_eq!(c["executionCount"], json!(0));
        assert_eq!(c["nextExecution"], json!("2026-03-03T09:30:00+00:00"));
        assert_eq!(
            render("{{taskName}} for {{team}} on {{day}}", &c),
            "Morning digest for ops on Monday"
        );
    }
}
