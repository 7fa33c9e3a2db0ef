use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// A single schema violation reported by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub rule: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Issue {
            path: path.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Incorrect data: {}", describe(.0))]
    Validation(Vec<Issue>),

    #[error("Not unique: {}", describe(.0))]
    ValidationUnique(Vec<Issue>),

    #[error("Not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    #[error("Incorrect fields format: {0}")]
    ParseFields(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{0}")]
    DuplicateKey(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(collection: &str, id: impl ToString) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// Issues carried by `Validation` and `ValidationUnique`, empty otherwise.
    pub fn issues(&self) -> &[Issue] {
        match self {
            Error::Validation(issues) | Error::ValidationUnique(issues) => issues,
            _ => &[],
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Rewrite a raw duplicate-key error from the store into `ValidationUnique`,
    /// naming the field of the violated index. Other errors pass through.
    pub fn convert(self) -> Self {
        match self {
            Error::DuplicateKey(message) => match duplicate_field(&message) {
                Some(field) => Error::ValidationUnique(vec![Issue::new(field, "unique", "Not unique")]),
                None => Error::DuplicateKey(message),
            },
            other => other,
        }
    }
}

fn duplicate_field(message: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)index: (?:.*\.)?\$?(?:([_a-z0-9]*)(?:_\d*)|([_a-z0-9]*))\s*dup key")
            .expect("duplicate key pattern is valid")
    });
    let caps = pattern.captures(message)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
        .filter(|field| !field.is_empty())
}

fn describe(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|i| format!("{} ({}): {}", i.path, i.rule, i.message))
        .collect::<Vec<_>>()
        .join("; ")
}
