use serde_json::{Map, Value};

use crate::types::ArmMode;

pub const ENDPOINT_PANEL_STATUS: &str = "panelCondGet";
pub const ENDPOINT_DEVICE_LIST: &str = "deviceListGet";
pub const ENDPOINT_PANEL_SET: &str = "panelCondPost";

/// Where the panel keeps its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventLogEndpoint {
    /// Plain history log.
    Logs,
    /// Reported (CID) events, which carry the `new_event`/`cid_event` fields
    /// the triggered state is derived from.
    #[default]
    ReportedEvents,
}

impl EventLogEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLogEndpoint::Logs => "logsGet",
            EventLogEndpoint::ReportedEvents => "reportEventListGet",
        }
    }
}

const DEVICE_ROWS_KEY: &str = "senrows";
const EVENT_ROWS_KEYS: &[&str] = &["logrows", "events"];

pub fn base_url(scheme: &str, host: &str) -> String {
    format!("{scheme}://{host}/action")
}

pub fn referer(scheme: &str, host: &str) -> String {
    format!("{scheme}://{host}/")
}

pub fn set_mode_form(mode: ArmMode, area: u32) -> Vec<(&'static str, String)> {
    vec![("area", area.to_string()), ("mode", mode.code().to_string())]
}

/// Panel status arrives either flat or wrapped in `{"updates": {...}}`.
pub fn panel_payload(body: &Value) -> &Value {
    match body.get("updates") {
        Some(updates) if updates.is_object() => updates,
        _ => body,
    }
}

/// Device rows. A missing key means no devices; a key of the wrong shape is
/// reported so the caller can fail the fetch.
pub fn device_rows(body: &Value) -> Result<&[Value], String> {
    rows_under(body, &[DEVICE_ROWS_KEY])
}

pub fn event_rows(body: &Value) -> Result<&[Value], String> {
    rows_under(body, EVENT_ROWS_KEYS)
}

fn rows_under<'a>(body: &'a Value, keys: &[&str]) -> Result<&'a [Value], String> {
    let obj: &Map<String, Value> = body
        .as_object()
        .ok_or_else(|| format!("expected JSON object, got {}", type_name(body)))?;
    for key in keys {
        match obj.get(*key) {
            Some(Value::Array(rows)) => return Ok(rows),
            Some(Value::Null) | None => continue,
            Some(other) => {
                return Err(format!("\"{key}\" is {}, expected array", type_name(other)));
            }
        }
    }
    Ok(&[])
}

/// `{"result": 1}` or `{"result": "1"}`.
pub fn is_success_result(body: &Value) -> bool {
    match body.get("result") {
        Some(Value::Number(n)) => n.as_u64() == Some(1) || n.as_f64() == Some(1.0),
        Some(Value::String(s)) => s.trim() == "1",
        _ => false,
    }
}

/// Best-effort identifier of a raw row for log messages.
pub fn row_label(row: &Value) -> String {
    match row.get("id").or_else(|| row.get("uid")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn panel_payload_unwraps_updates() {
        let nested = json!({"updates": {"mode_a1": "Arm"}});
        assert_eq!(panel_payload(&nested)["mode_a1"], "Arm");
        let flat = json!({"mode_a1": "Home"});
        assert_eq!(panel_payload(&flat)["mode_a1"], "Home");
    }

    #[test]
    fn event_rows_accepts_either_key() {
        let a = json!({"logrows": [{"time": "1"}]});
        let b = json!({"events": [{"time": "1"}, {"time": "2"}]});
        assert_eq!(event_rows(&a).unwrap().len(), 1);
        assert_eq!(event_rows(&b).unwrap().len(), 2);
        assert!(event_rows(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn device_rows_rejects_wrong_shape() {
        assert!(device_rows(&json!({"senrows": "nope"})).is_err());
        assert!(device_rows(&json!([1, 2])).is_err());
        assert!(device_rows(&json!({"other": 1})).unwrap().is_empty());
    }

    #[test]
    fn success_result_variants() {
        assert!(is_success_result(&json!({"result": 1})));
        assert!(is_success_result(&json!({"result": "1"})));
        assert!(!is_success_result(&json!({"result": 0})));
        assert!(!is_success_result(&json!({"result": "error"})));
        assert!(!is_success_result(&json!({})));
        assert!(!is_success_result(&json!([1])));
    }

    #[test]
    fn set_mode_form_values_are_strings() {
        let form = set_mode_form(ArmMode::ArmHome, 1);
        assert_eq!(form, vec![("area", "1".to_string()), ("mode", "2".to_string())]);
    }

    #[test]
    fn urls() {
        assert_eq!(base_url("http", "10.0.0.5"), "http://10.0.0.5/action");
        assert_eq!(referer("https", "panel.lan"), "https://panel.lan/");
    }
}
