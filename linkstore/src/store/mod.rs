//! Document store adapter: the primitive find/insert/update/delete surface the
//! collection engine is written against, plus two backends.

pub mod filter;
pub mod memory;
pub mod sqlite;
pub mod update;

pub use filter::Filter;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use update::{Update, UpdateOp};

use crate::document::{self, codec, ID};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One sort key; `-name` in a sort string means descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(path: impl Into<String>) -> Self {
        SortKey { path: path.into(), descending: false }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        SortKey { path: path.into(), descending: true }
    }
}

/// Parse `"-order,name"` into sort keys.
pub fn parse_sort(input: &str) -> Vec<SortKey> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty() && *part != "-" && *part != "+")
        .map(|part| match part.strip_prefix('-') {
            Some(path) => SortKey::desc(path.trim()),
            None => SortKey::asc(part.trim_start_matches('+').trim()),
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(sort: Vec<SortKey>) -> Self {
        FindOptions { sort, ..Default::default() }
    }
}

/// Index declared on a collection. Only unique indexes constrain writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Query document; only documents matching it are covered.
    #[serde(default)]
    pub partial: Option<Value>,
}

impl IndexSpec {
    pub fn unique(fields: &[&str]) -> Self {
        IndexSpec {
            name: default_index_name(fields),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: true,
            partial: None,
        }
    }
}

/// `email_1`, `a_1_b_1`
pub fn default_index_name<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| format!("{}_1", f.as_ref()))
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

/// Primitive document store. Each call is independent; implementations hold
/// their internal lock only for the duration of one call.
pub trait DocumentStore: Send + Sync {
    /// Declare indexes on a collection, replacing indexes with the same name.
    fn define(&self, collection: &str, indexes: &[IndexSpec]) -> Result<()>;

    fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>>;

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let options = FindOptions { limit: Some(1), ..Default::default() };
        Ok(self.find(collection, filter, &options)?.into_iter().next())
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Insert a document carrying `_id`. Duplicate ids and unique-index
    /// violations fail with [`Error::DuplicateKey`].
    fn insert_one(&self, collection: &str, document: Value) -> Result<()>;

    fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult>;

    fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult>;

    /// Remove the first matching document. Returns the number removed.
    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Remove every document of a collection.
    fn clear(&self, collection: &str) -> Result<()>;
}

// ── Shared helpers for in-process backends ─────────────────────────

/// Filter, sort, skip and limit an iterator of documents.
pub(crate) fn select<'a>(
    documents: impl Iterator<Item = &'a Value>,
    filter: &Filter,
    options: &FindOptions,
) -> Vec<Value> {
    let mut matched: Vec<&Value> = documents.filter(|d| filter.matches(d)).collect();
    if !options.sort.is_empty() {
        matched.sort_by(|a, b| {
            for key in &options.sort {
                let ord = filter::sort_cmp(document::get_path(a, &key.path), document::get_path(b, &key.path));
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    matched
        .into_iter()
        .skip(options.skip)
        .take(options.limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

/// Id of a stored document as a plain string.
pub(crate) fn document_id(document: &Value) -> Result<String> {
    document
        .get(ID)
        .and_then(codec::id_string)
        .ok_or_else(|| Error::Store(format!("document without {ID}: {document}")))
}

/// Check `candidate` against the other documents of the collection for a
/// duplicate `_id` and for unique-index violations.
pub(crate) fn check_unique<'a>(
    collection: &str,
    indexes: &[IndexSpec],
    others: impl Iterator<Item = &'a Value> + Clone,
    candidate: &Value,
) -> Result<()> {
    let id = document_id(candidate)?;
    if others.clone().any(|other| document_id(other).map_or(false, |o| o == id)) {
        return Err(duplicate(collection, "_id_", &[(ID, Value::String(id))]));
    }
    for index in indexes.iter().filter(|i| i.unique) {
        let partial = index.partial.as_ref().map(Filter::from_query).transpose()?;
        if partial.as_ref().map_or(false, |p| !p.matches(candidate)) {
            continue;
        }
        let key = index_key(index, candidate);
        let clash = others.clone().any(|other| {
            partial.as_ref().map_or(true, |p| p.matches(other))
                && index_key(index, other)
                    .iter()
                    .zip(&key)
                    .all(|(a, b)| filter::values_equal(a, b))
        });
        if clash {
            let pairs: Vec<(&str, Value)> = index
                .fields
                .iter()
                .map(String::as_str)
                .zip(key.into_iter())
                .collect();
            return Err(duplicate(collection, &index.name, &pairs));
        }
    }
    Ok(())
}

fn index_key(index: &IndexSpec, document: &Value) -> Vec<Value> {
    index
        .fields
        .iter()
        .map(|field| document::get_path(document, field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn duplicate(collection: &str, index: &str, pairs: &[(&str, Value)]) -> Error {
    let key = pairs
        .iter()
        .map(|(field, value)| format!("{field}: {}", codec::to_canonical(value.clone())))
        .collect::<Vec<_>>()
        .join(", ");
    Error::DuplicateKey(format!(
        "E11000 duplicate key error collection: {collection} index: {index} dup key: {{ {key} }}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sort() {
        assert_eq!(
            parse_sort("-order, name,+age"),
            vec![SortKey::desc("order"), SortKey::asc("name"), SortKey::asc("age")]
        );
        assert!(parse_sort("").is_empty());
    }

    #[test]
    fn test_select_sorts_and_pages() {
        let docs = vec![
            json!({"_id": "a", "order": 2}),
            json!({"_id": "b", "order": 1}),
            json!({"_id": "c", "order": 3}),
        ];
        let options = FindOptions {
            sort: vec![SortKey::desc("order")],
            skip: 1,
            limit: Some(1),
        };
        let out = select(docs.iter(), &Filter::All, &options);
        assert_eq!(out, vec![json!({"_id": "a", "order": 2})]);
    }

    #[test]
    fn test_check_unique_reports_index() {
        let existing = vec![json!({"_id": {"$oid": "1"}, "email": "a@x.io"})];
        let index = IndexSpec::unique(&["email"]);
        let err = check_unique("user", &[index.clone()], existing.iter(), &json!({"_id": {"$oid": "2"}, "email": "a@x.io"}))
            .unwrap_err();
        match &err {
            Error::DuplicateKey(message) => {
                assert!(message.starts_with("E11000 duplicate key error collection: user index: email_1 dup key"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.convert().issues()[0].path, "email");

        check_unique("user", &[index], existing.iter(), &json!({"_id": {"$oid": "2"}, "email": "b@x.io"})).unwrap();
    }

    #[test]
    fn test_check_unique_partial_and_id() {
        let existing = vec![json!({"_id": {"$oid": "1"}})];
        let index = IndexSpec {
            name: "_key_1".into(),
            fields: vec!["_key".into()],
            unique: true,
            partial: Some(json!({"_key": {"$exists": true}})),
        };
        check_unique("page", &[index.clone()], existing.iter(), &json!({"_id": {"$oid": "2"}})).unwrap();

        let err = check_unique("page", &[index], existing.iter(), &json!({"_id": "1"})).unwrap_err();
        assert_eq!(err.convert().issues()[0].path, "_id");
    }
}
