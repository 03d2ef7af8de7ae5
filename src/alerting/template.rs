//! `{placeholder}` substitution from an alert's data map.
//!
//! Unknown placeholders are left untouched so a typo shows up in the
//! delivered text instead of silently vanishing.

use serde_json::{Map, Value};

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => {
                let text = format!("{:.2}", f);
                text.trim_end_matches('0').trim_end_matches('.').to_string()
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn substitute<F>(template: &str, data: &Map<String, Value>, mut quote: F) -> String
where
    F: FnMut(String) -> String,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match data.get(key) {
                    Some(value) if is_key(key) => out.push_str(&quote(value_text(value))),
                    _ => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Substitute placeholders verbatim
pub fn render(template: &str, data: &Map<String, Value>) -> String {
    substitute(template, data, |s| s)
}

/// Substitute placeholders as single-quoted shell words
pub fn render_shell(template: &str, data: &Map<String, Value>) -> String {
    substitute(template, data, |s| shell_quote(&s))
}

/// Single-quote a value for `sh -c`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Map<String, Value> {
        json!({
            "rule_name": "High CPU usage",
            "metric": "cpu_usage",
            "value": 85.333333,
            "threshold": 80.0,
            "duration": 300,
            "host": "it's-me"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_render_known_placeholders() {
        let text = render("{rule_name}: {metric}={value} > {threshold} over {duration}s", &data());
        assert_eq!(text, "High CPU usage: cpu_usage=85.33 > 80 over 300s");
    }

    #[test]
    fn test_unknown_and_unbalanced_placeholders_kept() {
        assert_eq!(render("{missing} {metric}", &data()), "{missing} cpu_usage");
        assert_eq!(render("json {\"a\": 1} {", &data()), "json {\"a\": 1} {");
    }

    #[test]
    fn test_render_shell_quotes_values() {
        let cmd = render_shell("notify --host {host} --metric {metric}", &data());
        assert_eq!(cmd, r"notify --host 'it'\''s-me' --metric 'cpu_usage'");
    }
}
