use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Top-level schema document parsed from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub types: BTreeMap<String, TypeDefinition>,
}

/// Definition of one document type: its model, per-mode patches, indexes
/// and ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeDefinition {
    /// Physical collection; defaults to the type name.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub id: Option<IdConfig>,
    /// Field whose slug is stored as `_key`.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub order: Option<OrderDefinition>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexDefinition>,
    #[serde(default)]
    pub model: FieldSchema,
    #[serde(default)]
    pub schemes: BTreeMap<Mode, SchemaPatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdConfig {
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    #[default]
    Ulid,
    Uuid,
    Nanoid,
}

impl AutoIdStrategy {
    pub fn generate(self) -> String {
        match self {
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            AutoIdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Dense ordering configuration: `order` is unique and contiguous among
/// documents sharing the values at `scope`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderDefinition {
    #[serde(default)]
    pub scope: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Mongo-style query document restricting which documents the index covers.
    #[serde(default)]
    pub partial: Option<Value>,
}

/// Validation mode of a derived schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Create,
    Update,
    View,
    Delete,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Create, Mode::Update, Mode::View, Mode::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Create => "create",
            Mode::Update => "update",
            Mode::View => "view",
            Mode::Delete => "delete",
        }
    }
}

/// Overrides applied by `extend` when deriving a mode schema from the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaPatch {
    #[serde(default)]
    pub title: Option<String>,
    /// Top-level properties to drop.
    #[serde(default)]
    pub unset: Vec<String>,
    /// When present, only these top-level properties are kept.
    #[serde(default)]
    pub leave: Option<Vec<String>>,
    /// Replaces the top-level `required` list.
    #[serde(default)]
    pub required: Option<Vec<String>>,
    /// Properties added or replaced.
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSchema>,
}

/// One node of a field schema tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Undeclared properties are silently removed when false. Defaults to
    /// true for objects without declared properties and for relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<RelDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i18n: Option<I18nMode>,
    /// Custom issue messages by rule; `{key}` is replaced with the field name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub messages: BTreeMap<String, String>,
}

impl FieldSchema {
    pub fn of(field_type: FieldType) -> Self {
        FieldSchema {
            field_type,
            ..Default::default()
        }
    }

    pub fn allows_additional(&self) -> bool {
        self.additional_properties
            .unwrap_or(self.properties.is_empty() || self.rel.is_some())
    }
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    DateTime,
    Email,
}

/// Locale handling: `in` wraps a plain string into `{lang: text}` on write,
/// `out` collapses `{lang: text}` to the session language on view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum I18nMode {
    In,
    Out,
}

/// Relation metadata declared on a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelDefinition {
    /// Accepted target types; empty means the caller supplies `_type`.
    #[serde(rename = "type", default, deserialize_with = "one_or_many")]
    pub types: Vec<String>,
    /// Path on the target type where this relation is mirrored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
    /// Field selector of target fields snapshotted into the stub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<String>,
    /// Field selector of target fields flattened into `stub.search`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Tree name; marks a parent relation whose breadcrumb is maintained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<String>,
    /// Keep the mirror when the referencing side drops the relation.
    #[serde(default)]
    pub remember: bool,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
