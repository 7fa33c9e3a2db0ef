//! Collection engine: validated, hook-aware CRUD over one type, followed by
//! order maintenance and relation sync.

pub mod hooks;
pub mod links;
pub(crate) mod order;
pub(crate) mod tree;

pub use hooks::{Hooks, LinkContext, Operation, WriteContext};
pub use links::RelationProtocol;

use crate::document::{codec, flatten_for_set, DATE_CREATE, DATE_UPDATE, ID, IS_DELETED, KEY, ORDER, TYPE};
use crate::error::{Error, Issue, Result};
use crate::schema::{Mode, TypeSchema};
use crate::session::Session;
use crate::storage::Storage;
use crate::store::{document_id, parse_sort, DocumentStore, Filter, FindOptions, SortKey, Update};
use crate::validation::{self, ValidationContext};
use crate::view::{FieldSelector, Projector, ViewOptions};
use order::Allocator;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Parameters of [`Collection::get_list`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    /// Falls back to `list_limit` from the config.
    pub limit: Option<usize>,
    pub include_deleted: bool,
    pub count: bool,
}

impl ListQuery {
    pub fn new(filter: Filter) -> Self {
        ListQuery { filter, ..Default::default() }
    }

    /// Sort from a `"-order,name"` style string.
    pub fn sort(mut self, sort: &str) -> Self {
        self.sort = parse_sort(sort);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResult {
    pub items: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Handle to one type's collection, borrowed from a [`Storage`].
#[derive(Debug, Clone, Copy)]
pub struct Collection<'a> {
    storage: &'a Storage,
    schema: &'a TypeSchema,
    hooks: &'a Hooks,
}

impl<'a> Collection<'a> {
    pub(crate) fn new(storage: &'a Storage, schema: &'a TypeSchema, hooks: &'a Hooks) -> Self {
        Collection { storage, schema, hooks }
    }

    pub fn type_name(&self) -> &'a str {
        &self.schema.name
    }

    /// Name of the backing store collection.
    pub fn name(&self) -> &'a str {
        &self.schema.collection
    }

    pub fn schema(&self) -> &'a TypeSchema {
        self.schema
    }

    fn store(&self) -> &'a dyn DocumentStore {
        self.storage.store()
    }

    /// Restrict a filter to documents of this type.
    fn scoped(&self, filter: &Filter) -> Filter {
        filter.clone().and(Filter::eq(TYPE, self.type_name()))
    }

    fn allocator(&self) -> Allocator<'a> {
        Allocator {
            store: self.store(),
            collection: self.name(),
            schema: self.schema,
        }
    }

    fn not_found(&self, filter: &Filter) -> Error {
        let id = match filter {
            Filter::Eq(path, value) if path == ID => codec::id_string(value).unwrap_or_default(),
            other => format!("{other:?}"),
        };
        Error::not_found(self.name(), id)
    }

    pub(crate) fn validation_context(&self, session: &Session) -> ValidationContext {
        let config = self.storage.config();
        ValidationContext::new(session.lang(&config.languages, &config.default_lang), config.default_lang.clone())
    }

    fn authorize(&self, operation: Operation, session: &Session) -> Result<()> {
        match &self.hooks.authorize {
            Some(hook) => hook(operation, session),
            None => Ok(()),
        }
    }

    /// Stored document by filter, without projection.
    pub(crate) fn raw_one(&self, filter: &Filter) -> Result<Option<Value>> {
        self.store().find_one(self.name(), &self.scoped(filter))
    }

    fn reread(&self, id: &str) -> Result<Value> {
        let filter = Filter::id(id);
        self.raw_one(&filter)?.ok_or_else(|| self.not_found(&filter))
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// One document. Soft-deleted documents are reported missing when a view
    /// is applied and the selector does not ask for `isDeleted`.
    pub fn get_one(&self, filter: &Filter, options: &ViewOptions) -> Result<Value> {
        self.authorize(Operation::Read, &options.session)?;
        let document = self.raw_one(filter)?.ok_or_else(|| self.not_found(filter))?;
        if options.mode.is_on() && !options.selects(IS_DELETED) && document.get(IS_DELETED) == Some(&Value::Bool(true)) {
            return Err(self.not_found(filter));
        }
        self.view(document, options)
    }

    /// Like [`get_one`](Self::get_one) but `None` when nothing matches.
    pub fn find_one(&self, filter: &Filter, options: &ViewOptions) -> Result<Option<Value>> {
        self.authorize(Operation::Read, &options.session)?;
        match self.raw_one(filter)? {
            Some(document) => self.view(document, options).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_list(&self, query: &ListQuery, options: &ViewOptions) -> Result<ListResult> {
        self.authorize(Operation::Read, &options.session)?;
        let mut filter = self.scoped(&query.filter);
        if !query.include_deleted {
            filter = filter.and(Filter::Or(vec![
                Filter::eq(IS_DELETED, false),
                Filter::Exists(IS_DELETED.into(), false),
            ]));
        }
        let find = FindOptions {
            sort: query.sort.clone(),
            skip: query.skip,
            limit: Some(query.limit.unwrap_or(self.storage.config().list_limit)),
        };
        let documents = self.store().find(self.name(), &filter, &find)?;
        let count = match query.count {
            true => Some(self.store().count(self.name(), &filter)?),
            false => None,
        };
        Ok(ListResult {
            items: self.view_list(documents, options)?,
            count,
        })
    }

    /// Shape a stored document for output.
    pub fn view(&self, document: Value, options: &ViewOptions) -> Result<Value> {
        let mut document = document;
        if options.mode.types || options.mode.schema {
            document = codec::to_canonical(document);
        }
        if options.mode.schema {
            let context = self.validation_context(&options.session).lenient();
            document = validation::validate(self.schema.mode(Mode::View), document, &context)?;
        }
        if options.mode.fields {
            document = Projector::new(self.storage).load_by_fields(&document, options.fields.as_ref(), &options.session);
        }
        Ok(document)
    }

    pub fn view_list(&self, documents: Vec<Value>, options: &ViewOptions) -> Result<Vec<Value>> {
        documents.into_iter().map(|d| self.view(d, options)).collect()
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Structural validation, relation resolution and the `validate` hook.
    fn check(&self, mode: Mode, body: Value, context: &WriteContext<'_>) -> Result<Value> {
        let mut object = validation::validate(self.schema.mode(mode), body, &self.validation_context(context.session))?;
        if !object.is_object() {
            return Err(Error::Validation(vec![Issue::new("", "type", "should be object")]));
        }
        self.resolve_links(&mut object, context.session)?;
        if let Some(hook) = &self.hooks.validate {
            hook(context, &mut object)?;
        }
        Ok(object)
    }

    fn apply_key(&self, object: &mut Map<String, Value>) {
        let Some(field) = &self.schema.definition.key else {
            return;
        };
        let source = match object.get(field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(texts)) => texts.values().find_map(|v| v.as_str().map(str::to_string)),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        if let Some(source) = source.filter(|s| !s.trim().is_empty()) {
            object.insert(KEY.into(), Value::String(slug::slugify(source)));
        }
    }

    /// Remove a requested `order` from the body; the allocator places it.
    fn take_order(&self, object: &mut Value) -> Option<i64> {
        if !self.schema.is_ordered() {
            return None;
        }
        object.as_object_mut()?.remove(ORDER)?.as_i64()
    }

    pub fn create_one(&self, body: Value, session: &Session, fields: Option<&FieldSelector>) -> Result<Value> {
        self.authorize(Operation::Create, session)?;
        let context = WriteContext {
            operation: Operation::Create,
            session,
            is_new: true,
            previous: None,
        };
        let mut object = self.check(Mode::Create, body, &context)?;
        let requested = self.take_order(&mut object);

        let strategy = self
            .schema
            .definition
            .id
            .as_ref()
            .and_then(|id| id.auto)
            .unwrap_or(self.storage.config().id_strategy);
        let id = strategy.generate();
        if let Value::Object(map) = &mut object {
            let now = codec::now();
            map.insert(ID.into(), codec::oid(&id));
            map.insert(TYPE.into(), Value::from(self.type_name()));
            map.insert(DATE_CREATE.into(), now.clone());
            map.insert(DATE_UPDATE.into(), now);
            map.insert(IS_DELETED.into(), Value::Bool(false));
            self.apply_key(map);
        }
        if let Some(hook) = &self.hooks.prepare {
            hook(&context, &mut object)?;
        }
        let object = codec::to_native(object);

        self.store().insert_one(self.name(), object.clone()).map_err(Error::convert)?;
        log::debug!("{}: created {id}", self.type_name());

        let mut current = object;
        if self.schema.is_ordered() {
            self.allocator().place_new(&id, &current, requested)?;
            current = self.reread(&id)?;
        }
        self.save_links(&current, None);
        self.view(current, &ViewOptions::new(session).select(fields.cloned()))
    }

    /// Validate, prepare and persist a partial update, then reorder and sync
    /// relations. Returns the stored document.
    fn apply_update(
        &self,
        id: &str,
        body: Value,
        session: &Session,
        mode: Mode,
        operation: Operation,
        previous: Option<Value>,
    ) -> Result<Value> {
        self.authorize(operation, session)?;
        let filter = Filter::id(id);
        let previous = match previous {
            Some(previous) => previous,
            None => self.raw_one(&filter)?.ok_or_else(|| self.not_found(&filter))?,
        };
        let context = WriteContext {
            operation,
            session,
            is_new: false,
            previous: Some(&previous),
        };
        let mut object = self.check(mode, body, &context)?;
        let requested = self.take_order(&mut object);
        if let Value::Object(map) = &mut object {
            map.insert(DATE_UPDATE.into(), codec::now());
            self.apply_key(map);
        }
        if let Some(hook) = &self.hooks.prepare {
            hook(&context, &mut object)?;
        }
        let object = codec::to_native(object);

        let update = match &object {
            Value::Object(map) => flatten_for_set(map)
                .into_iter()
                .fold(Update::new(), |update, (path, value)| update.set(path, value)),
            _ => Update::new(),
        };
        let result = self
            .store()
            .update_one(self.name(), &self.scoped(&filter), &update)
            .map_err(Error::convert)?;
        if result.matched == 0 {
            return Err(self.not_found(&filter));
        }
        log::debug!("{}: updated {id}", self.type_name());

        let mut current = self.reread(id)?;
        if self.schema.is_ordered() && self.allocator().reorder(id, &current, &previous, requested)?.is_some() {
            current = self.reread(id)?;
        }
        self.save_links(&current, Some(&previous));
        Ok(current)
    }

    pub fn update_one(&self, id: &str, body: Value, session: &Session, fields: Option<&FieldSelector>) -> Result<Value> {
        let current = self.apply_update(id, body, session, Mode::Update, Operation::Update, None)?;
        self.view(current, &ViewOptions::new(session).select(fields.cloned()))
    }

    /// Update every matching document one by one. Returns how many were updated.
    pub fn update_many(&self, filter: &Filter, body: Value, session: &Session) -> Result<u64> {
        let documents = self.store().find(self.name(), &self.scoped(filter), &FindOptions::default())?;
        let mut updated = 0;
        for document in documents {
            let id = document_id(&document)?;
            self.apply_update(&id, body.clone(), session, Mode::Update, Operation::Update, Some(document))?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Update the first match, or create from `body` when nothing matches.
    pub fn upsert_one(&self, filter: &Filter, body: Value, session: &Session, fields: Option<&FieldSelector>) -> Result<Value> {
        match self.raw_one(filter)? {
            None => self.create_one(body, session, fields),
            Some(previous) => {
                let id = document_id(&previous)?;
                let current = self.apply_update(&id, body, session, Mode::Update, Operation::Update, Some(previous))?;
                self.view(current, &ViewOptions::new(session).select(fields.cloned()))
            }
        }
    }

    /// Soft delete: flips `isDeleted` through the `delete` schema.
    pub fn delete_one(&self, id: &str, session: &Session) -> Result<Value> {
        let current = self.apply_update(id, json!({ IS_DELETED: true }), session, Mode::Delete, Operation::Delete, None)?;
        let mut fields = FieldSelector::of(&[crate::view::ALL]);
        fields.insert(IS_DELETED, crate::view::Selection::All);
        self.view(current, &ViewOptions::new(session).select(Some(fields)))
    }

    /// Soft delete every matching document. Returns how many were marked.
    pub fn delete_many(&self, filter: &Filter, session: &Session) -> Result<u64> {
        let filter = self.scoped(filter).and(Filter::Ne(IS_DELETED.into(), Value::Bool(true)));
        let documents = self.store().find(self.name(), &filter, &FindOptions::default())?;
        let mut deleted = 0;
        for document in documents {
            let id = document_id(&document)?;
            self.apply_update(&id, json!({ IS_DELETED: true }), session, Mode::Delete, Operation::Delete, Some(document))?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Physically remove a document. Mirrors on related documents are left as
    /// they are; the order scope is compacted.
    pub fn destroy_one(&self, id: &str, session: &Session) -> Result<()> {
        self.authorize(Operation::Destroy, session)?;
        let filter = Filter::id(id);
        let previous = self.raw_one(&filter)?.ok_or_else(|| self.not_found(&filter))?;
        if self.store().delete_one(self.name(), &self.scoped(&filter))? == 0 {
            return Err(self.not_found(&filter));
        }
        if let Some(old) = previous.get(ORDER).and_then(Value::as_i64).filter(|_| self.schema.is_ordered()) {
            self.allocator().compact(id, &previous, old)?;
        }
        log::debug!("{}: destroyed {id}", self.type_name());
        Ok(())
    }
}
