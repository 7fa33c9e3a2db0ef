//! Record of relation-sync notifications that failed after the primary
//! write was committed.

use crate::document::{codec, ID};
use crate::error::Result;
use crate::store::{DocumentStore, Filter, FindOptions, SortKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RECORD_TYPE: &str = "link-failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkOperation {
    Add,
    Update,
    Delete,
}

impl LinkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkOperation::Add => "add",
            LinkOperation::Update => "update",
            LinkOperation::Delete => "delete",
        }
    }
}

/// One failed notification: `object` changed its relation at `path`, and
/// the mirror on `target` could not be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkFailure {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_type")]
    pub record_type: String,
    pub target_type: String,
    pub target_id: String,
    pub object_type: String,
    pub object_id: String,
    pub path: String,
    pub operation: LinkOperation,
    pub error: String,
    pub date_create: DateTime<Utc>,
}

impl LinkFailure {
    pub fn new(
        operation: LinkOperation,
        object: (&str, &str),
        path: &str,
        target: (&str, &str),
        error: &crate::error::Error,
    ) -> Self {
        LinkFailure {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            record_type: RECORD_TYPE.to_string(),
            target_type: target.0.to_string(),
            target_id: target.1.to_string(),
            object_type: object.0.to_string(),
            object_id: object.1.to_string(),
            path: path.to_string(),
            operation,
            error: error.to_string(),
            date_create: Utc::now(),
        }
    }
}

/// Journal collection handle.
pub struct Journal<'a> {
    store: &'a dyn DocumentStore,
    collection: &'a str,
}

impl<'a> Journal<'a> {
    pub fn new(store: &'a dyn DocumentStore, collection: &'a str) -> Self {
        Journal { store, collection }
    }

    pub fn record(&self, failure: &LinkFailure) -> Result<()> {
        let mut document = serde_json::to_value(failure)?;
        document[ID] = codec::oid(&failure.id);
        self.store.insert_one(self.collection, document)
    }

    /// Every pending record, oldest first.
    pub fn list(&self) -> Result<Vec<LinkFailure>> {
        let documents = self.store.find(
            self.collection,
            &Filter::All,
            &FindOptions::sorted(vec![SortKey::asc("dateCreate"), SortKey::asc(ID)]),
        )?;
        documents
            .into_iter()
            .map(|mut document| {
                if let Some(id) = document.get(ID).and_then(codec::id_string) {
                    document[ID] = id.into();
                }
                Ok(serde_json::from_value(document)?)
            })
            .collect()
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.store.delete_one(self.collection, &Filter::id(id))?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        self.store.count(self.collection, &Filter::All)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_list_remove() {
        let store = MemoryStore::new();
        let journal = Journal::new(&store, "_journal");
        let failure = LinkFailure::new(
            LinkOperation::Add,
            ("node", "a"),
            "parent",
            ("node", "b"),
            &Error::Store("boom".into()),
        );
        journal.record(&failure).unwrap();
        assert_eq!(journal.len().unwrap(), 1);

        let listed = journal.list().unwrap();
        assert_eq!(listed, vec![failure.clone()]);
        assert_eq!(listed[0].error, "Store error: boom");

        journal.remove(&failure.id).unwrap();
        assert!(journal.is_empty().unwrap());
    }
}
