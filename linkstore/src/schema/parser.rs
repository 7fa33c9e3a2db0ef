use super::types::SchemaDefinition;
use crate::error::{Error, Result};
use std::path::Path;

/// Parse a schema YAML file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    check_definition(&schema)?;
    Ok(schema)
}

/// Reject definitions that cannot be registered: unknown relation targets,
/// index or order fields naming undeclared properties.
fn check_definition(schema: &SchemaDefinition) -> Result<()> {
    for (name, def) in &schema.types {
        for (index_name, index) in &def.indexes {
            if index.fields.is_empty() {
                return Err(Error::Schema(format!("{name}: index '{index_name}' has no fields")));
            }
        }
        if let Some(order) = &def.order {
            for path in &order.scope {
                let root = path.split('.').next().unwrap_or(path);
                if !def.model.properties.contains_key(root) {
                    return Err(Error::Schema(format!("{name}: order scope '{path}' is not a declared field")));
                }
            }
        }
        if let Some(key) = &def.key {
            if !def.model.properties.contains_key(key) {
                return Err(Error::Schema(format!("{name}: key field '{key}' is not declared")));
            }
        }
        let mut rels = Vec::new();
        super::registry::walk_relations(&def.model, "", &mut |path, rel, _| rels.push((path.to_string(), rel.clone())));
        for (path, rel) in rels {
            for target in &rel.types {
                if !schema.types.contains_key(target) {
                    return Err(Error::Schema(format!("{name}.{path}: unknown relation type '{target}'")));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, Mode};

    const SCHEMA: &str = r#"
types:
  user:
    key: username
    indexes:
      email:
        fields: [email]
        unique: true
    model:
      type: object
      required: [email]
      properties:
        username: { type: string }
        email: { type: string, format: email }
        friend:
          type: object
          rel: { type: user, inverse: friend }
        posts:
          type: array
          items:
            type: object
            rel: { type: [post], inverse: author, copy: "title" }
    schemes:
      view:
        unset: [email]
  post:
    order:
      scope: [author]
    model:
      type: object
      properties:
        title: { type: string, minLength: 1 }
        author:
          type: object
          rel: { type: user, inverse: posts }
"#;

    #[test]
    fn test_parse_schema_str() {
        let schema = parse_schema_str(SCHEMA).unwrap();
        let user = &schema.types["user"];
        assert_eq!(user.key.as_deref(), Some("username"));
        assert!(user.indexes["email"].unique);
        assert_eq!(user.model.field_type, FieldType::Object);
        let posts = &user.model.properties["posts"];
        let rel = posts.items.as_ref().unwrap().rel.as_ref().unwrap();
        assert_eq!(rel.types, vec!["post".to_string()]);
        assert_eq!(rel.copy.as_deref(), Some("title"));
        assert_eq!(user.schemes[&Mode::View].unset, vec!["email".to_string()]);
        assert_eq!(schema.types["post"].model.properties["title"].min_length, Some(1));
    }

    #[test]
    fn test_unknown_relation_type_rejected() {
        let yaml = "types:\n  a:\n    model:\n      type: object\n      properties:\n        b:\n          type: object\n          rel: { type: missing }\n";
        let err = parse_schema_str(yaml).unwrap_err();
        assert!(matches!(err, Error::Schema(m) if m.contains("missing")));
    }

    #[test]
    fn test_parse_schema_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("schema.yaml");
        std::fs::write(&path, SCHEMA).unwrap();
        let schema = parse_schema(&path).unwrap();
        assert_eq!(schema.types.len(), 2);
    }
}
