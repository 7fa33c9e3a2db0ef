//! Conversion between canonical documents (string ids, RFC 3339 dates) and
//! the store-native representation (`{"$oid": ..}`, `{"$date": millis}`).

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

const OID: &str = "$oid";
const DATE: &str = "$date";

pub fn oid(id: &str) -> Value {
    json!({ OID: id })
}

pub fn date(at: DateTime<Utc>) -> Value {
    json!({ DATE: at.timestamp_millis() })
}

pub fn now() -> Value {
    date(Utc::now())
}

/// True for a native id or date wrapper.
pub fn is_native(value: &Value) -> bool {
    match value {
        Value::Object(map) if map.len() == 1 => {
            map.get(OID).map_or(false, Value::is_string) || map.get(DATE).map_or(false, Value::is_i64)
        }
        _ => false,
    }
}

/// Id as a plain string, whichever representation it is in.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get(OID).and_then(Value::as_str).map(str::to_string),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Native form of an id, whichever representation it is in.
pub fn native_id(value: &Value) -> Option<Value> {
    id_string(value).map(|id| oid(&id))
}

/// Millisecond timestamp of a native date wrapper.
pub fn date_millis(value: &Value) -> Option<i64> {
    value.as_object()?.get(DATE)?.as_i64()
}

fn is_date_key(key: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^date([A-Z]|$)").expect("date key pattern is valid"));
    key == "birthday" || pattern.is_match(key)
}

/// Canonical to native: `_id` strings become `$oid`, date-named RFC 3339
/// strings become `$date`. Everything else is walked recursively.
pub fn to_native(value: Value) -> Value {
    if is_native(&value) {
        return value;
    }
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(to_native).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let converted = match v {
                    Value::String(s) if key == super::ID && !s.is_empty() => oid(&s),
                    Value::String(s) if is_date_key(&key) && !s.is_empty() => match DateTime::parse_from_rfc3339(&s) {
                        Ok(at) => date(at.with_timezone(&Utc)),
                        Err(_) => Value::String(s),
                    },
                    other => to_native(other),
                };
                out.insert(key, converted);
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Native to canonical, the inverse of [`to_native`].
pub fn to_canonical(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(to_canonical).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(id)) = map.get(OID) {
                    return Value::String(id.clone());
                }
                if let Some(millis) = map.get(DATE).and_then(Value::as_i64) {
                    if let Some(at) = Utc.timestamp_millis_opt(millis).single() {
                        return Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true));
                    }
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, to_canonical(v))).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_to_native_converts_ids_and_dates() {
        let doc = json!({
            "_id": "abc",
            "dateCreate": "2024-03-01T10:00:00.000Z",
            "birthday": "",
            "dateless": "2024-03-01T10:00:00Z",
            "parent": {"_id": "p1", "_type": "object"},
            "children": [{"_id": "c1", "_type": "object"}]
        });
        let native = to_native(doc);
        assert_eq!(native["_id"], json!({"$oid": "abc"}));
        assert_eq!(native["dateCreate"], json!({"$date": 1709287200000i64}));
        assert_eq!(native["birthday"], json!(""));
        assert_eq!(native["dateless"], json!("2024-03-01T10:00:00Z"));
        assert_eq!(native["parent"]["_id"], json!({"$oid": "p1"}));
        assert_eq!(native["children"][0]["_id"], json!({"$oid": "c1"}));
    }

    #[test]
    fn test_round_trip_to_canonical() {
        let doc = json!({"_id": "abc", "dateUpdate": "2024-03-01T10:00:00.000Z", "n": 3});
        assert_eq!(to_canonical(to_native(doc.clone())), doc);
        assert_eq!(to_native(to_native(doc.clone())), to_native(doc));
    }

    #[test]
    fn test_id_string() {
        assert_eq!(id_string(&oid("x")), Some("x".into()));
        assert_eq!(id_string(&json!("y")), Some("y".into()));
        assert_eq!(id_string(&json!("")), None);
        assert_eq!(native_id(&json!("z")), Some(oid("z")));
    }
}
