//! Compiled per-type schemas: derived mode schemas, relation map, indexes and
//! the tree directory.

use super::types::{
    FieldSchema, FieldType, Format, I18nMode, Mode, RelDefinition, SchemaDefinition, SchemaPatch,
    TypeDefinition,
};
use crate::document::{DATE_CREATE, DATE_UPDATE, ID, IS_DELETED, KEY, ORDER, TYPE};
use crate::error::{Error, Result};
use crate::store::{default_index_name, IndexSpec};
use crate::validation::{self, ValidationContext};
use crate::view::fields::{parse_fields, FieldSelector};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Cardinality of a relation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// Declared directly on an object field.
    One,
    /// Declared as `items` of an array.
    Many,
}

/// Relation metadata of one path, computed at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSpec {
    pub path: String,
    pub types: Vec<String>,
    pub inverse: Option<String>,
    pub copy: Option<FieldSelector>,
    pub search: Option<FieldSelector>,
    pub tree: Option<String>,
    pub size: Size,
    pub remember: bool,
}

impl RelationSpec {
    pub fn accepts(&self, type_name: &str) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| t == type_name)
    }
}

pub type RelationMap = BTreeMap<String, RelationSpec>;

/// One registered type.
#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub name: String,
    pub collection: String,
    pub definition: TypeDefinition,
    pub modes: BTreeMap<Mode, FieldSchema>,
    pub relations: RelationMap,
    pub indexes: Vec<IndexSpec>,
}

impl TypeSchema {
    pub fn mode(&self, mode: Mode) -> &FieldSchema {
        // every mode is derived in `compile`
        &self.modes[&mode]
    }

    pub fn is_ordered(&self) -> bool {
        self.definition.order.is_some()
    }

    pub fn order_scope(&self) -> &[String] {
        self.definition
            .order
            .as_ref()
            .map_or(&[], |o| o.scope.as_slice())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, TypeSchema>,
    /// tree name -> type -> relation path
    trees: BTreeMap<String, BTreeMap<String, String>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definition(definition: &SchemaDefinition) -> Result<Self> {
        let mut registry = SchemaRegistry::new();
        for (name, def) in &definition.types {
            registry.register(name, def.clone())?;
        }
        Ok(registry)
    }

    /// Compile and add a type. Re-registering a name replaces it.
    pub fn register(&mut self, name: &str, definition: TypeDefinition) -> Result<()> {
        let compiled = compile(name, definition)?;
        for paths in self.trees.values_mut() {
            paths.remove(name);
        }
        for spec in compiled.relations.values() {
            if let Some(tree) = &spec.tree {
                if spec.size != Size::One {
                    return Err(Error::Schema(format!("{name}.{}: tree relations must be singular", spec.path)));
                }
                self.trees
                    .entry(tree.clone())
                    .or_default()
                    .insert(name.to_string(), spec.path.clone());
            }
        }
        log::debug!(
            "registered type {name}: {} relation paths, {} indexes",
            compiled.relations.len(),
            compiled.indexes.len()
        );
        self.types.insert(name.to_string(), compiled);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TypeSchema> {
        self.types
            .get(name)
            .ok_or_else(|| Error::Schema(format!("unknown type '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeSchema> {
        self.types.values()
    }

    /// Schema by reference `"<type>.<mode>"`.
    pub fn schema(&self, schema_ref: &str) -> Result<&FieldSchema> {
        let (name, mode) = schema_ref
            .rsplit_once('.')
            .ok_or_else(|| Error::Schema(format!("bad schema reference '{schema_ref}'")))?;
        let mode = Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == mode)
            .ok_or_else(|| Error::Schema(format!("unknown mode in '{schema_ref}'")))?;
        Ok(self.get(name)?.mode(mode))
    }

    /// Validate `value` against `"<type>.<mode>"`, returning the coerced value.
    pub fn validate(&self, schema_ref: &str, value: Value, context: &ValidationContext) -> Result<Value> {
        validation::validate(self.schema(schema_ref)?, value, context)
    }

    pub fn relations(&self, name: &str) -> Result<&RelationMap> {
        Ok(&self.get(name)?.relations)
    }

    /// Types participating in a tree, with the relation path of each.
    pub fn tree(&self, tree: &str) -> Option<&BTreeMap<String, String>> {
        self.trees.get(tree)
    }
}

/// Derive a schema from `base` with a patch applied to its top level.
pub fn extend(base: &FieldSchema, patch: &SchemaPatch) -> FieldSchema {
    let mut result = base.clone();
    if let Some(title) = &patch.title {
        result.title = Some(title.clone());
    }
    for name in &patch.unset {
        result.properties.remove(name);
    }
    if let Some(leave) = &patch.leave {
        result.properties.retain(|name, _| leave.contains(name));
    }
    for (name, field) in &patch.properties {
        result.properties.insert(name.clone(), field.clone());
    }
    if let Some(required) = &patch.required {
        result.required = required.clone();
    }
    let properties = &result.properties;
    result.required.retain(|name| properties.contains_key(name));
    result
}

/// Keep only structural keywords and switch locale handling to output.
pub fn clear_rules_view(schema: &FieldSchema) -> FieldSchema {
    FieldSchema {
        field_type: schema.field_type,
        title: schema.title.clone(),
        description: schema.description.clone(),
        properties: schema
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), clear_rules_view(v)))
            .collect(),
        additional_properties: schema.additional_properties,
        items: schema.items.as_ref().map(|i| Box::new(clear_rules_view(i))),
        rel: schema.rel.clone(),
        i18n: schema.i18n.map(|_| I18nMode::Out),
        ..Default::default()
    }
}

/// Drop defaults at every level so a partial update never fills them in.
pub fn clear_rules_update(schema: &FieldSchema) -> FieldSchema {
    let mut result = schema.clone();
    result.default = None;
    result.properties = schema
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), clear_rules_update(v)))
        .collect();
    result.items = schema.items.as_ref().map(|i| Box::new(clear_rules_update(i)));
    result
}

/// Visit every relation declared in a schema with its dotted path.
pub fn walk_relations(schema: &FieldSchema, path: &str, visit: &mut dyn FnMut(&str, &RelDefinition, Size)) {
    if let Some(rel) = &schema.rel {
        visit(path, rel, Size::One);
        return;
    }
    if schema.field_type == FieldType::Array {
        if let Some(rel) = schema.items.as_ref().and_then(|i| i.rel.as_ref()) {
            visit(path, rel, Size::Many);
            return;
        }
    }
    for (name, property) in &schema.properties {
        let child = if path.is_empty() {
            name.clone()
        } else {
            format!("{path}.{name}")
        };
        walk_relations(property, &child, visit);
    }
}

fn system_properties(definition: &TypeDefinition) -> BTreeMap<String, FieldSchema> {
    let date = || FieldSchema {
        format: Some(Format::DateTime),
        ..FieldSchema::of(FieldType::String)
    };
    let mut props = BTreeMap::new();
    props.insert(ID.to_string(), FieldSchema::of(FieldType::String));
    props.insert(TYPE.to_string(), FieldSchema::of(FieldType::String));
    props.insert(DATE_CREATE.to_string(), date());
    props.insert(DATE_UPDATE.to_string(), date());
    props.insert(
        IS_DELETED.to_string(),
        FieldSchema {
            default: Some(json!(false)),
            ..FieldSchema::of(FieldType::Boolean)
        },
    );
    if definition.key.is_some() {
        props.insert(KEY.to_string(), FieldSchema::of(FieldType::String));
    }
    if definition.order.is_some() {
        props.insert(
            ORDER.to_string(),
            FieldSchema {
                minimum: Some(1.0),
                ..FieldSchema::of(FieldType::Integer)
            },
        );
    }
    props
}

fn default_patch(mode: Mode) -> SchemaPatch {
    let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    match mode {
        Mode::Create => SchemaPatch {
            unset: names(&[ID, TYPE, DATE_CREATE, DATE_UPDATE, IS_DELETED, KEY]),
            ..Default::default()
        },
        Mode::Update => SchemaPatch {
            unset: names(&[ID, TYPE, DATE_CREATE, DATE_UPDATE, KEY]),
            required: Some(Vec::new()),
            ..Default::default()
        },
        Mode::View => SchemaPatch {
            required: Some(Vec::new()),
            ..Default::default()
        },
        Mode::Delete => SchemaPatch {
            leave: Some(names(&[IS_DELETED])),
            required: Some(names(&[IS_DELETED])),
            ..Default::default()
        },
    }
}

fn compile(name: &str, definition: TypeDefinition) -> Result<TypeSchema> {
    let mut model = definition.model.clone();
    if model.field_type == FieldType::Any {
        model.field_type = FieldType::Object;
    }
    for (key, field) in system_properties(&definition) {
        model.properties.entry(key).or_insert(field);
    }

    let mut modes = BTreeMap::new();
    for mode in Mode::ALL {
        let mut schema = extend(&model, &default_patch(mode));
        if let Some(patch) = definition.schemes.get(&mode) {
            schema = extend(&schema, patch);
        }
        schema = match mode {
            Mode::View => clear_rules_view(&schema),
            Mode::Update => clear_rules_update(&schema),
            _ => schema,
        };
        modes.insert(mode, schema);
    }

    let mut relations = RelationMap::new();
    let mut failure = None;
    walk_relations(&model, "", &mut |path, rel, size| {
        if failure.is_some() {
            return;
        }
        match relation_spec(path, rel, size) {
            Ok(spec) => {
                relations.insert(path.to_string(), spec);
            }
            Err(e) => failure = Some(e),
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }

    let mut indexes: Vec<IndexSpec> = definition
        .indexes
        .values()
        .map(|index| IndexSpec {
            name: default_index_name(&index.fields),
            fields: index.fields.clone(),
            unique: index.unique,
            partial: index.partial.clone(),
        })
        .collect();
    if definition.key.is_some() {
        indexes.push(IndexSpec {
            name: default_index_name(&[KEY]),
            fields: vec![KEY.to_string()],
            unique: true,
            partial: Some(json!({ KEY: {"$exists": true} })),
        });
    }

    Ok(TypeSchema {
        name: name.to_string(),
        collection: definition.collection.clone().unwrap_or_else(|| name.to_string()),
        definition,
        modes,
        relations,
        indexes,
    })
}

fn relation_spec(path: &str, rel: &RelDefinition, size: Size) -> Result<RelationSpec> {
    let selector = |text: &Option<String>, what: &str| -> Result<Option<FieldSelector>> {
        match text {
            Some(text) => parse_fields(text)
                .map_err(|e| Error::Schema(format!("{path}: bad {what} selector: {e}"))),
            None => Ok(None),
        }
    };
    Ok(RelationSpec {
        path: path.to_string(),
        types: rel.types.clone(),
        inverse: rel.inverse.clone(),
        copy: selector(&rel.copy, "copy")?,
        search: selector(&rel.search, "search")?,
        tree: rel.tree.clone(),
        size,
        remember: rel.remember,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;

    const SCHEMA: &str = r#"
types:
  node:
    order:
      scope: [parent]
    key: name
    model:
      type: object
      required: [name]
      properties:
        name: { type: string, default: "untitled" }
        password: { type: string }
        parent:
          type: object
          rel: { type: node, inverse: children, tree: nodes, copy: "name" }
        children:
          type: array
          items:
            type: object
            rel: { type: node, inverse: parent, copy: "name", search: "name" }
        meta:
          type: object
          properties:
            owner:
              type: object
              rel: { type: [node, page] }
    schemes:
      view:
        unset: [password]
  page:
    model:
      type: object
      properties:
        title: { type: string }
"#;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_definition(&parse_schema_str(SCHEMA).unwrap()).unwrap()
    }

    #[test]
    fn test_find_links() {
        let registry = registry();
        let relations = registry.relations("node").unwrap();
        assert_eq!(relations.len(), 3);
        assert_eq!(relations["parent"].size, Size::One);
        assert_eq!(relations["parent"].tree.as_deref(), Some("nodes"));
        assert_eq!(relations["children"].size, Size::Many);
        assert_eq!(relations["children"].inverse.as_deref(), Some("parent"));
        assert!(relations["children"].search.as_ref().unwrap().contains("name"));
        assert!(relations["meta.owner"].accepts("page"));
        assert!(!relations["meta.owner"].accepts("user"));
        assert_eq!(registry.tree("nodes").unwrap()["node"], "parent");
    }

    #[test]
    fn test_mode_derivation() {
        let registry = registry();
        let create = registry.schema("node.create").unwrap();
        assert!(!create.properties.contains_key("_id"));
        assert!(!create.properties.contains_key("isDeleted"));
        assert!(create.properties.contains_key("order"));
        assert_eq!(create.required, vec!["name".to_string()]);

        let update = registry.schema("node.update").unwrap();
        assert!(update.required.is_empty());
        assert_eq!(update.properties["name"].default, None);

        let view = registry.schema("node.view").unwrap();
        assert!(!view.properties.contains_key("password"));
        assert!(view.properties.contains_key("_id"));
        assert_eq!(view.properties["name"].default, None);

        let delete = registry.schema("node.delete").unwrap();
        assert_eq!(delete.properties.keys().collect::<Vec<_>>(), vec!["isDeleted"]);
        assert_eq!(delete.required, vec!["isDeleted".to_string()]);
    }

    #[test]
    fn test_indexes_and_collection() {
        let registry = registry();
        let node = registry.get("node").unwrap();
        assert_eq!(node.collection, "node");
        assert_eq!(node.indexes.len(), 1);
        assert_eq!(node.indexes[0].name, "_key_1");
        assert_eq!(node.order_scope(), &["parent".to_string()]);
    }

    #[test]
    fn test_extend_patch() {
        let base = FieldSchema {
            required: vec!["a".into(), "b".into()],
            properties: [("a", FieldType::String), ("b", FieldType::Number)]
                .into_iter()
                .map(|(k, t)| (k.to_string(), FieldSchema::of(t)))
                .collect(),
            ..FieldSchema::of(FieldType::Object)
        };
        let patch = SchemaPatch {
            unset: vec!["b".into()],
            properties: [("c".to_string(), FieldSchema::of(FieldType::Boolean))].into_iter().collect(),
            ..Default::default()
        };
        let out = extend(&base, &patch);
        assert_eq!(out.properties.keys().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(out.required, vec!["a".to_string()]);
    }

    #[test]
    fn test_unknown_schema_reference() {
        let registry = registry();
        assert!(matches!(registry.schema("node.bogus"), Err(Error::Schema(_))));
        assert!(matches!(registry.schema("ghost.view"), Err(Error::Schema(_))));
    }
}
