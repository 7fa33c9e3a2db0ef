use crate::collection::{Collection, Hooks, RelationProtocol};
use crate::config::StorageConfig;
use crate::document::{codec, get_path, ID, TYPE};
use crate::error::{Error, Result};
use crate::journal::{Journal, LinkFailure, LinkOperation};
use crate::schema::{parse_schema_str, SchemaDefinition, SchemaRegistry, TypeDefinition};
use crate::store::{DocumentStore, Filter, MemoryStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Entry point: a schema registry over a document store, handing out
/// [`Collection`] handles by type name.
pub struct Storage {
    store: Arc<dyn DocumentStore>,
    registry: SchemaRegistry,
    config: StorageConfig,
    hooks: HashMap<String, Hooks>,
    no_hooks: Hooks,
}

/// Outcome of [`Storage::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Journal records looked at.
    pub replayed: usize,
    /// Records whose mirrors are now in sync, removed from the journal.
    pub repaired: usize,
    /// Records still failing, left in the journal.
    pub remaining: usize,
}

impl Storage {
    pub fn builder() -> StorageBuilder {
        StorageBuilder::default()
    }

    /// Collection handle for a registered type.
    pub fn get(&self, type_name: &str) -> Result<Collection<'_>> {
        let schema = self.registry.get(type_name)?;
        let hooks = self.hooks.get(type_name).unwrap_or(&self.no_hooks);
        Ok(Collection::new(self, schema, hooks))
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The underlying store, for maintenance and tests.
    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn journal(&self) -> Journal<'_> {
        Journal::new(self.store.as_ref(), &self.config.journal_collection)
    }

    /// Replay failed relation-sync notifications from the journal.
    ///
    /// Adds and updates are retried by re-running the sync of the owning
    /// document; deletes are retried directly unless the owner points at the
    /// target again. Repaired records are removed.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let journal = self.journal();
        let mut report = ReconcileReport::default();
        for failure in journal.list()? {
            report.replayed += 1;
            match self.replay(&failure) {
                Ok(()) => {
                    journal.remove(&failure.id)?;
                    report.repaired += 1;
                }
                Err(e) => {
                    log::warn!("link failure {} still failing: {e}", failure.id);
                    report.remaining += 1;
                }
            }
        }
        log::info!(
            "reconciled {} link failures: {} repaired, {} remaining",
            report.replayed,
            report.repaired,
            report.remaining
        );
        Ok(report)
    }

    fn replay(&self, failure: &LinkFailure) -> Result<()> {
        let owner = self.get(&failure.object_type)?;
        let object = owner.raw_one(&Filter::id(&failure.object_id))?;
        match (failure.operation, object) {
            (LinkOperation::Delete, object) => {
                let relinked = object.as_ref().map_or(false, |o| points_at(o, &failure.path, &failure.target_id));
                if relinked {
                    return Ok(());
                }
                let stub = |type_name: &str, id: &str| json!({ ID: codec::oid(id), TYPE: type_name });
                self.get(&failure.target_type)?.on_foreign_delete(
                    &stub(&failure.object_type, &failure.object_id),
                    &failure.path,
                    &stub(&failure.target_type, &failure.target_id),
                )
            }
            (_, None) => Ok(()),
            (_, Some(object)) => match owner.collect_links(&object, None).into_iter().next() {
                None => Ok(()),
                Some(again) => Err(Error::Store(again.error)),
            },
        }
    }
}

/// True when the relation at `path` of `document` references `id`.
fn points_at(document: &Value, path: &str, id: &str) -> bool {
    let matches = |v: &Value| v.get(ID).and_then(codec::id_string).as_deref() == Some(id);
    match get_path(document, path) {
        Some(Value::Array(items)) => items.iter().any(matches),
        Some(value) => matches(value),
        None => false,
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("types", &self.registry.type_names().collect::<Vec<_>>())
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct StorageBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    definition: SchemaDefinition,
    config: StorageConfig,
    hooks: HashMap<String, Hooks>,
}

impl StorageBuilder {
    pub fn store(mut self, store: impl DocumentStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    /// Add every type of a schema definition.
    pub fn schema(mut self, definition: SchemaDefinition) -> Self {
        self.definition.types.extend(definition.types);
        self
    }

    pub fn schema_yaml(self, yaml: &str) -> Result<Self> {
        Ok(self.schema(parse_schema_str(yaml)?))
    }

    pub fn register(mut self, name: impl Into<String>, definition: TypeDefinition) -> Self {
        self.definition.types.insert(name.into(), definition);
        self
    }

    pub fn hooks(mut self, type_name: impl Into<String>, hooks: Hooks) -> Self {
        self.hooks.insert(type_name.into(), hooks);
        self
    }

    /// Compile the schema and declare every index on the store.
    pub fn build(self) -> Result<Storage> {
        let registry = SchemaRegistry::from_definition(&self.definition)?;
        if let Some(unknown) = self.hooks.keys().find(|name| !registry.contains(name)) {
            return Err(Error::Schema(format!("hooks given for unknown type '{unknown}'")));
        }
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        for schema in registry.types() {
            store.define(&schema.collection, &schema.indexes)?;
        }
        store.define(&self.config.journal_collection, &[])?;
        log::info!(
            "storage ready with {} types: {}",
            self.definition.types.len(),
            registry.type_names().collect::<Vec<_>>().join(", ")
        );
        Ok(Storage {
            store,
            registry,
            config: self.config,
            hooks: self.hooks,
            no_hooks: Hooks::default(),
        })
    }
}
