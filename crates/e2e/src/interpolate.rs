//! `${...}` variable interpolation
//!
//! References resolve against the context (`${VAR}`, `${id.VAR}`) or a
//! built-in: `${uid}` or `${short_id}` (fresh short id), `${timestamp}` (epoch millis) and
//! `${session_id}`. Unknown references are left as written.

use serde_json::Value;
use tracing::warn;

use tidyrun_common::short_id;

use crate::context::ExecutionContext;

pub fn interpolate(template: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let reference = after[..end].trim();
        match resolve(reference, ctx) {
            Some(value) => out.push_str(&value),
            None => {
                warn!(reference, "Unresolved variable reference");
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve(reference: &str, ctx: &ExecutionContext) -> Option<String> {
    if let Some(value) = ctx.lookup(reference) {
        return Some(value.to_string());
    }
    match reference {
        "uid" | "short_id" => Some(short_id()),
        "timestamp" => Some(chrono::Utc::now().timestamp_millis().to_string()),
        "session_id" => Some(ctx.session_id().to_string()),
        _ => None,
    }
}

/// Interpolate every string inside a JSON value.
pub fn interpolate_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Truthiness of an interpolated `when` condition.
///
/// Empty strings, `false`, `0`, `no` and unresolved references are false.
pub fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty()
        || v.contains("${")
        || v.eq_ignore_ascii_case("false")
        || v == "0"
        || v.eq_ignore_ascii_case("no"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;
    use tidyrun_common::SessionId;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(SessionId::from("sess_1"));
        ctx.set_var("NAME", "alice");
        ctx.push_scope("login");
        ctx.set_var("TOKEN", "t-1");
        ctx.pop_scope();
        ctx
    }

    #[test]
    fn resolves_plain_scoped_and_session() {
        let out = interpolate("${NAME}/${login.TOKEN}/${session_id}", &ctx());
        assert_eq!(out, "alice/t-1/sess_1");
    }

    #[test]
    fn unknown_reference_is_left_verbatim() {
        assert_eq!(interpolate("hi ${MISSING} ${NAME}", &ctx()), "hi ${MISSING} alice");
    }

    #[test]
    fn unterminated_reference_is_kept() {
        assert_eq!(interpolate("a ${NAME", &ctx()), "a ${NAME");
    }

    #[test]
    fn uid_is_fresh_each_time() {
        let a = interpolate("${uid}", &ctx());
        let b = interpolate("${uid}", &ctx());
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn context_variable_shadows_builtin() {
        let mut c = ctx();
        c.set_var("uid", "fixed");
        assert_eq!(interpolate("${uid}", &c), "fixed");
    }

    #[test]
    fn nested_json_values() {
        let v = interpolate_value(&json!({"a": ["${NAME}", 1], "b": {"c": "${login.TOKEN}"}}), &ctx());
        assert_eq!(v, json!({"a": ["alice", 1], "b": {"c": "t-1"}}));
    }

    #[test_case("true", true)]
    #[test_case("yes", true)]
    #[test_case("", false)]
    #[test_case("false", false)]
    #[test_case("0", false)]
    #[test_case("${UNSET}", false)]
    fn truthiness(value: &str, expected: bool) {
        assert_eq!(is_truthy(value), expected);
    }
}
