pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod journal;
pub mod schema;
pub mod session;
pub mod storage;
pub mod store;
pub mod validation;
pub mod view;

#[cfg(test)]
pub(crate) mod fixtures;

pub use collection::{Collection, Hooks, LinkContext, ListQuery, ListResult, Operation, RelationProtocol, WriteContext};
pub use config::StorageConfig;
pub use error::{Error, Issue, Result};
pub use journal::{LinkFailure, LinkOperation};
pub use schema::{SchemaDefinition, SchemaRegistry};
pub use session::{Lang, Session};
pub use storage::{ReconcileReport, Storage, StorageBuilder};
pub use store::{DocumentStore, Filter, MemoryStore, SqliteStore, Update, UpdateOp};
pub use view::{parse_fields, FieldSelector, Projector, ViewMode, ViewOptions};
