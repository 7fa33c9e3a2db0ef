use crate::error::Result;
use crate::schema::AutoIdStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime settings of a [`Storage`](crate::Storage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Language used when the session does not ask for one the schema knows.
    pub default_lang: String,
    pub languages: Vec<String>,
    /// Default page size of `get_list`.
    pub list_limit: usize,
    /// Concurrent relation loads per nesting level during projection.
    pub max_fanout: usize,
    /// Collection holding failed relation-sync records.
    pub journal_collection: String,
    pub id_strategy: AutoIdStrategy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            default_lang: "en".into(),
            languages: vec!["en".into()],
            list_limit: 10,
            max_fanout: 4,
            journal_collection: "_link_journal".into(),
            id_strategy: AutoIdStrategy::Ulid,
        }
    }
}

impl StorageConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}
