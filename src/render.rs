//! Human and JSON rendering of results and errors, plus exit codes.

use awskit_core::{ErrorKind, Operation, OperationResult, ToolkitError};
use serde_json::{json, Value};

/// Configuration or usage problem detected before dispatch.
pub const EXIT_USAGE: i32 = 64;

/// Process exit code for a failed operation.
pub fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Permanent => 2,
        ErrorKind::Transient | ErrorKind::RetryExhausted => 3,
        ErrorKind::Auth | ErrorKind::AuthExpired => 4,
        ErrorKind::Cancelled => 130,
    }
}

/// Fields tried in order to name a listed item.
const LABEL_FIELDS: &[&str] = &[
    "instance_id",
    "db_instance_id",
    "snapshot_id",
    "function_name",
    "user_name",
    "role_name",
    "alarm_name",
    "metric_name",
    "access_key_id",
    "key",
    "name",
];

/// Fields tried in order to show an item's state.
const STATE_FIELDS: &[&str] = &["state", "status", "state_value"];

fn first_string<'a>(item: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .find_map(|f| item.get(*f).and_then(Value::as_str).filter(|s| !s.is_empty()))
}

fn item_line(item: &Value) -> String {
    match first_string(item, LABEL_FIELDS) {
        Some(label) => match first_string(item, STATE_FIELDS) {
            Some(state) => format!("  {:<40} {}", label, state),
            None => format!("  {}", label),
        },
        None => format!("  {}", item),
    }
}

/// Render a successful result.
pub fn result(result: &OperationResult, as_json: bool) -> String {
    if as_json {
        let mut out = json!({
            "operation": result.operation,
            "payload": result.payload,
            "calls": result.calls,
            "pages": result.pages,
        });
        if let Some(ref cursor) = result.cursor {
            out["cursor"] = json!(cursor);
        }
        if let Some(ref state) = result.state {
            out["state"] = json!(state);
        }
        if result.replayed {
            out["replayed"] = json!(true);
        }
        return serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string());
    }

    let mut lines = Vec::new();
    match &result.payload {
        Value::Array(items) => {
            lines.push(format!("{}: {} item(s)", result.operation, items.len()));
            lines.extend(items.iter().map(item_line));
        }
        other => {
            lines.push(format!("{}:", result.operation));
            lines.push(serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()));
        }
    }
    if let Some(ref state) = result.state {
        lines.push(format!("state: {}", state));
    }
    if let Some(ref cursor) = result.cursor {
        lines.push(format!("next cursor: {}", cursor));
    }
    if result.replayed {
        lines.push("(replayed from an earlier execution with the same idempotency key)".to_string());
    }
    lines.join("\n")
}

/// Render a failure. Each kind reads differently.
pub fn error(err: &ToolkitError, as_json: bool) -> String {
    if as_json {
        let mut body = serde_json::to_value(err).unwrap_or_else(|_| json!({ "message": err.message }));
        body["hint"] = json!(err.kind.hint());
        let out = json!({ "error": body });
        return serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string());
    }

    let op = err.operation.as_deref().unwrap_or("awskit");
    let headline = match err.kind {
        ErrorKind::Permanent => format!("{} failed and will not succeed without changes", op),
        ErrorKind::RetryExhausted => format!("{} kept failing; try again later", op),
        ErrorKind::Transient => format!("{} hit a temporary failure", op),
        ErrorKind::Auth => format!("{}: no usable credentials", op),
        ErrorKind::AuthExpired => format!("{}: credentials expired and could not be refreshed", op),
        ErrorKind::Cancelled => format!("{} cancelled", op),
    };

    let mut lines = vec![format!("error: {}", headline), format!("  [{}] {}", err.code, err.message)];
    if err.attempts > 0 {
        lines.push(format!("  attempts: {}", err.attempts));
    }
    if let Some(last) = err.last_kind {
        let cause = if err.throttled { "throttling" } else { last.as_str() };
        lines.push(format!("  last failure: {}", cause));
    }
    if let Some(status) = err.status_code {
        lines.push(format!("  http status: {}", status));
    }
    if let Some(ref id) = err.request_id {
        lines.push(format!("  request id: {}", id));
    }
    lines.join("\n")
}

/// Render the operation registry.
pub fn operations(as_json: bool) -> String {
    let all = Operation::all();
    if as_json {
        let items: Vec<Value> = all
            .iter()
            .map(|op| {
                let d = op.descriptor();
                json!({
                    "service": op.service().name(),
                    "operation": d.name,
                    "provider_call": d.provider_call,
                    "listing": d.listing,
                    "mutating": d.mutating,
                    "required": d.required,
                    "expected_states": d.expected_states,
                })
            })
            .collect();
        return serde_json::to_string_pretty(&items).unwrap_or_default();
    }

    all.iter()
        .map(|op| {
            let d = op.descriptor();
            let mut flags = Vec::new();
            if d.listing {
                flags.push("listing");
            }
            if d.mutating {
                flags.push("mutating");
            }
            let required = if d.required.is_empty() {
                String::new()
            } else {
                format!(" ({})", d.required.join(", "))
            };
            format!("{:<36} {:<24} {}{}", op.label(), d.provider_call, flags.join(","), required)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
