//! Schema and storages shared by the unit tests.

use crate::collection::{Hooks, Operation};
use crate::config::StorageConfig;
use crate::error::{Error, Issue};
use crate::session::Session;
use crate::storage::{Storage, StorageBuilder};
use crate::store::SqliteStore;
use serde_json::{json, Value};

pub const SCHEMA: &str = r#"
types:
  user:
    indexes:
      email: { fields: [email], unique: true }
    model:
      type: object
      required: [name, email]
      properties:
        name: { type: string }
        email: { type: string, format: email }
        age: { type: integer }
        role: { type: string }
        password: { type: string }
        profile:
          type: object
          properties:
            city: { type: string }
            phone: { type: string }
        posts:
          type: array
          items:
            type: object
            rel: { type: post, inverse: author, copy: "title" }
        reviews:
          type: array
          items:
            type: object
            rel: { type: review, inverse: reviewer, remember: true }
    schemes:
      view:
        unset: [password]
  post:
    model:
      type: object
      required: [title]
      properties:
        title: { type: string }
        body: { type: string }
        author:
          type: object
          rel: { type: user, inverse: posts, copy: "name" }
        tags:
          type: array
          items:
            type: object
            rel: { type: tag, search: "title" }
  tag:
    key: title
    model:
      type: object
      properties:
        title: { type: string }
  person:
    model:
      type: object
      properties:
        name: { type: string }
        partner:
          type: object
          rel: { type: person, inverse: partner, copy: "name" }
  node:
    order:
      scope: [parent]
    model:
      type: object
      properties:
        name: { type: string }
        parent:
          type: object
          rel: { type: node, inverse: children, tree: nodes, copy: "name" }
        children:
          type: array
          items:
            type: object
            rel: { type: node, inverse: parent, copy: "name" }
  category:
    model:
      type: object
      properties:
        name: { type: string }
        parent:
          type: object
          rel: { type: category, tree: catalog, copy: "name" }
  item:
    model:
      type: object
      properties:
        name: { type: string }
        category:
          type: object
          rel: { type: category, tree: catalog, copy: "name" }
  review:
    model:
      type: object
      properties:
        text: { type: string }
        reviewer:
          type: object
          rel: { type: user, inverse: reviews }
  note:
    model:
      type: object
      required: [text]
      properties:
        text: { type: string }
        caption: { type: string, i18n: in }
        author: { type: string }
        revision: { type: integer }
"#;

/// Session of a signed-in test user.
pub fn session() -> Session {
    Session::with_user(json!({"name": "tester"}))
}

/// `_id` strings of the items of a relation array.
pub fn ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["_id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn note_hooks() -> Hooks {
    Hooks::new()
        .on_authorize(|operation, session| match (operation, &session.user) {
            (Operation::Read, _) | (_, Some(_)) => Ok(()),
            _ => Err(Error::Forbidden("sign in to write notes".into())),
        })
        .on_validate(|_, object| match object.get("text").and_then(Value::as_str) {
            Some(text) if text.contains("spam") => Err(Error::Validation(vec![Issue::new("text", "spam", "looks like spam")])),
            _ => Ok(()),
        })
        .on_prepare(|context, object| {
            if context.is_new {
                let author = context.session.user.as_ref().and_then(|u| u.get("name")).cloned();
                object["author"] = author.unwrap_or(Value::Null);
            } else {
                let revision = context
                    .previous
                    .and_then(|p| p.get("revision"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                object["revision"] = json!(revision + 1);
            }
            Ok(())
        })
}

pub fn builder() -> StorageBuilder {
    let config = StorageConfig {
        languages: vec!["en".into(), "ru".into()],
        ..Default::default()
    };
    Storage::builder()
        .config(config)
        .schema_yaml(SCHEMA)
        .unwrap()
        .hooks("note", note_hooks())
}

pub fn memory_storage() -> Storage {
    builder().build().unwrap()
}

pub fn sqlite_storage() -> Storage {
    builder().store(SqliteStore::open_in_memory().unwrap()).build().unwrap()
}
