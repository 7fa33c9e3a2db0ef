use crate::error::{Error, Issue, Result};
use crate::schema::{FieldSchema, FieldType, Format, I18nMode};
use crate::session::Lang;
use chrono::DateTime;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::OnceLock;

/// Settings of one validation pass.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub lang: Lang,
    pub default_lang: String,
    /// When false, issues are discarded and only the filtering and
    /// coercion of the pass apply.
    pub strict: bool,
}

impl ValidationContext {
    pub fn new(lang: Lang, default_lang: impl Into<String>) -> Self {
        ValidationContext {
            lang,
            default_lang: default_lang.into(),
            strict: true,
        }
    }

    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }
}

impl Default for ValidationContext {
    fn default() -> Self {
        ValidationContext::new(Lang::One("en".into()), "en")
    }
}

/// Validate a value against a schema.
///
/// Undeclared properties of closed objects are removed, missing properties
/// with a default are filled in, scalars are coerced to the declared type
/// where the conversion is lossless, and locale-keyed text is wrapped or
/// collapsed according to the field's `i18n` mode. Returns the transformed
/// value, or `Error::Validation` listing every issue in document order.
pub fn validate(schema: &FieldSchema, value: Value, context: &ValidationContext) -> Result<Value> {
    let mut issues = Vec::new();
    let out = check(schema, value, "", "", context, &mut issues);
    if issues.is_empty() || !context.strict {
        Ok(out)
    } else {
        Err(Error::Validation(issues))
    }
}

fn check(
    schema: &FieldSchema,
    value: Value,
    path: &str,
    key: &str,
    ctx: &ValidationContext,
    issues: &mut Vec<Issue>,
) -> Value {
    if value.is_null() {
        return value;
    }
    if let Some(mode) = schema.i18n {
        return i18n(schema, mode, value, path, key, ctx, issues);
    }

    let value = coerce(schema.field_type, value);
    if !type_matches(schema.field_type, &value) {
        let expected = match schema.field_type {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        issues.push(issue(schema, path, key, "type", format!("should be {expected}")));
        return value;
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(&value) {
            issues.push(issue(schema, path, key, "enum", "should be equal to one of the allowed values".into()));
        }
    }

    match value {
        Value::Object(map) => Value::Object(check_object(schema, map, path, ctx, issues)),
        Value::Array(items) => match &schema.items {
            Some(item_schema) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| check(item_schema, item, &join(path, &i.to_string()), key, ctx, issues))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        Value::String(s) => {
            check_string(schema, &s, path, key, issues);
            Value::String(s)
        }
        Value::Number(n) => {
            check_number(schema, &n, path, key, issues);
            Value::Number(n)
        }
        other => other,
    }
}

fn check_object(
    schema: &FieldSchema,
    mut map: Map<String, Value>,
    path: &str,
    ctx: &ValidationContext,
    issues: &mut Vec<Issue>,
) -> Map<String, Value> {
    if !schema.allows_additional() {
        map.retain(|k, _| schema.properties.contains_key(k));
    }
    for (name, property) in &schema.properties {
        if !map.contains_key(name) {
            if let Some(default) = &property.default {
                map.insert(name.clone(), default.clone());
            }
        }
    }
    for name in &schema.required {
        if !map.contains_key(name) {
            let message = schema
                .properties
                .get(name)
                .and_then(|p| custom_message(p, "required", name))
                .unwrap_or_else(|| format!("should have required property '{name}'"));
            issues.push(Issue::new(join(path, name), "required", message));
        }
    }

    let mut out = Map::with_capacity(map.len());
    for (name, value) in map {
        let checked = match schema.properties.get(&name) {
            Some(property) => check(property, value, &join(path, &name), &name, ctx, issues),
            None => value,
        };
        out.insert(name, checked);
    }
    out
}

fn check_string(schema: &FieldSchema, s: &str, path: &str, key: &str, issues: &mut Vec<Issue>) {
    let len = s.chars().count();
    if let Some(min) = schema.min_length {
        if len < min {
            issues.push(issue(schema, path, key, "minLength", format!("should NOT be shorter than {min} characters")));
        }
    }
    if let Some(max) = schema.max_length {
        if len > max {
            issues.push(issue(schema, path, key, "maxLength", format!("should NOT be longer than {max} characters")));
        }
    }
    if let Some(pattern) = &schema.pattern {
        if !Regex::new(pattern).map_or(false, |re| re.is_match(s)) {
            issues.push(issue(schema, path, key, "pattern", format!("should match pattern \"{pattern}\"")));
        }
    }
    if let Some(format) = schema.format {
        let (ok, name) = match format {
            Format::DateTime => (DateTime::parse_from_rfc3339(s).is_ok(), "date-time"),
            Format::Email => (email_pattern().is_match(s), "email"),
        };
        if !ok {
            issues.push(issue(schema, path, key, "format", format!("should match format \"{name}\"")));
        }
    }
}

fn check_number(schema: &FieldSchema, n: &Number, path: &str, key: &str, issues: &mut Vec<Issue>) {
    let Some(n) = n.as_f64() else { return };
    if let Some(min) = schema.minimum {
        if n < min {
            issues.push(issue(schema, path, key, "minimum", format!("should be >= {min}")));
        }
    }
    if let Some(max) = schema.maximum {
        if n > max {
            issues.push(issue(schema, path, key, "maximum", format!("should be <= {max}")));
        }
    }
}

/// `in`: plain text becomes `{lang: text}`. `out`: `{lang: text}` collapses
/// to the requested language unless every language was asked for.
fn i18n(
    schema: &FieldSchema,
    mode: I18nMode,
    value: Value,
    path: &str,
    key: &str,
    ctx: &ValidationContext,
    issues: &mut Vec<Issue>,
) -> Value {
    match (mode, value) {
        (I18nMode::In, Value::String(text)) => {
            let mut map = Map::new();
            map.insert(ctx.lang.write_lang(&ctx.default_lang).to_string(), Value::String(text));
            Value::Object(map)
        }
        (I18nMode::In, Value::Object(map)) => {
            let text_schema = FieldSchema {
                i18n: None,
                field_type: FieldType::String,
                ..schema.clone()
            };
            let checked = map
                .into_iter()
                .map(|(lang, text)| {
                    let text = check(&text_schema, text, &join(path, &lang), key, ctx, issues);
                    (lang, text)
                })
                .collect();
            Value::Object(checked)
        }
        (I18nMode::In, other) => {
            issues.push(issue(schema, path, key, "type", "should be string,object".into()));
            other
        }
        (I18nMode::Out, Value::Object(map)) => match &ctx.lang {
            Lang::All => Value::Object(map),
            Lang::One(lang) => map
                .get(lang)
                .or_else(|| map.get(&ctx.default_lang))
                .or_else(|| map.values().next())
                .cloned()
                .unwrap_or(Value::Null),
        },
        (I18nMode::Out, other) => other,
    }
}

fn coerce(field_type: FieldType, value: Value) -> Value {
    match (field_type, value) {
        (FieldType::String, Value::Number(n)) => Value::String(n.to_string()),
        (FieldType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (FieldType::Number | FieldType::Integer, Value::String(s)) => match parse_number(s.trim()) {
            Some(n) => Value::Number(n),
            None => Value::String(s),
        },
        (FieldType::Number | FieldType::Integer, Value::Bool(b)) => Value::from(b as i64),
        (FieldType::Integer, Value::Number(n)) => match n.as_f64() {
            Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::from(f as i64)
            }
            _ => Value::Number(n),
        },
        (FieldType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(1) => Value::Bool(true),
            Some(0) => Value::Bool(false),
            _ => Value::Number(n),
        },
        (_, value) => value,
    }
}

fn parse_number(s: &str) -> Option<Number> {
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Any => true,
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
    }
}

fn issue(schema: &FieldSchema, path: &str, key: &str, rule: &str, default: String) -> Issue {
    let message = custom_message(schema, rule, key).unwrap_or(default);
    Issue::new(path, rule, message)
}

fn custom_message(schema: &FieldSchema, rule: &str, key: &str) -> Option<String> {
    schema.messages.get(rule).map(|m| m.replace("{key}", key))
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn user_schema() -> FieldSchema {
        serde_yaml::from_str(
            r#"
type: object
required: [email, name]
properties:
  name: { type: string, minLength: 2, maxLength: 10 }
  email:
    type: string
    format: email
    messages:
      required: "{key} is mandatory"
  age: { type: integer, minimum: 0 }
  role: { type: string, enum: [member, admin], default: member }
  active: { type: boolean }
  code: { type: string, pattern: "^[A-Z]{3}$" }
  title: { type: string, i18n: in }
  tags: { type: array, items: { type: string } }
  profile:
    type: object
    properties:
      city: { type: string }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_document_with_defaults_and_coercion() {
        let out = validate(
            &user_schema(),
            json!({"name": "Alice", "email": "a@x.io", "age": "31", "active": "true", "title": "Hi"}),
            &ValidationContext::default(),
        )
        .unwrap();
        assert_eq!(
            out,
            json!({
                "name": "Alice",
                "email": "a@x.io",
                "age": 31,
                "active": true,
                "role": "member",
                "title": {"en": "Hi"}
            })
        );
    }

    #[test]
    fn test_required_with_custom_message() {
        let err = validate(&user_schema(), json!({"name": "Alice"}), &ValidationContext::default()).unwrap_err();
        let issues = err.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0], Issue::new("email", "required", "email is mandatory"));
    }

    #[test]
    fn test_collects_issues_in_order() {
        let err = validate(
            &user_schema(),
            json!({
                "name": "A",
                "email": "nope",
                "age": -1,
                "role": "root",
                "code": "abc",
                "tags": ["x", {"y": 1}]
            }),
            &ValidationContext::default(),
        )
        .unwrap_err();
        let rules: Vec<(&str, &str)> = err
            .issues()
            .iter()
            .map(|i| (i.path.as_str(), i.rule.as_str()))
            .collect();
        assert_eq!(
            rules,
            vec![
                ("age", "minimum"),
                ("code", "pattern"),
                ("email", "format"),
                ("name", "minLength"),
                ("role", "enum"),
                ("tags.1", "type"),
            ]
        );
        assert_eq!(err.issues()[3].message, "should NOT be shorter than 2 characters");
    }

    #[test]
    fn test_removes_undeclared_properties() {
        let out = validate(
            &user_schema(),
            json!({"name": "Bob", "email": "b@x.io", "secret": 1, "profile": {"city": "Oslo", "zip": 1}}),
            &ValidationContext::default(),
        )
        .unwrap();
        assert_eq!(out.get("secret"), None);
        assert_eq!(out["profile"], json!({"city": "Oslo"}));
    }

    #[test]
    fn test_i18n_out_and_lenient() {
        let view: FieldSchema = serde_yaml::from_str(
            "type: object\nproperties:\n  title: { type: string, i18n: out }\n  n: { type: integer }\n",
        )
        .unwrap();
        let doc = json!({"title": {"en": "Hello", "ru": "Привет"}, "n": "x"});

        let ru = ValidationContext::new(Lang::One("ru".into()), "en").lenient();
        assert_eq!(validate(&view, doc.clone(), &ru).unwrap()["title"], json!("Привет"));

        let de = ValidationContext::new(Lang::One("de".into()), "en").lenient();
        assert_eq!(validate(&view, doc.clone(), &de).unwrap()["title"], json!("Hello"));

        let all = ValidationContext::new(Lang::All, "en").lenient();
        assert_eq!(validate(&view, doc.clone(), &all).unwrap()["title"], json!({"en": "Hello", "ru": "Привет"}));

        assert!(validate(&view, doc, &ValidationContext::default()).is_err());
    }
}
