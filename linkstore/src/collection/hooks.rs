//! Per-type extension points, composed onto a collection at build time.

use crate::error::Result;
use crate::session::Session;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Destroy,
}

/// State of one write, handed to `validate` and `prepare` hooks.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext<'a> {
    pub operation: Operation,
    pub session: &'a Session,
    /// True on create; never persisted.
    pub is_new: bool,
    /// Stored document before this write, in native form.
    pub previous: Option<&'a Value>,
}

/// Input of a `link_prepare` hook.
#[derive(Debug, Clone, Copy)]
pub struct LinkContext<'a> {
    /// Relation path on the side that stores the stub.
    pub path: &'a str,
    /// Document the stub points at.
    pub object: &'a Value,
    /// True when building a mirror stub on the referenced side.
    pub foreign: bool,
}

pub type AuthorizeHook = Arc<dyn Fn(Operation, &Session) -> Result<()> + Send + Sync>;
pub type WriteHook = Arc<dyn Fn(&WriteContext<'_>, &mut Value) -> Result<()> + Send + Sync>;
pub type LinkPrepareHook = Arc<dyn Fn(&LinkContext<'_>) -> Result<Map<String, Value>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub authorize: Option<AuthorizeHook>,
    pub validate: Option<WriteHook>,
    pub prepare: Option<WriteHook>,
    /// Keyed by relation path.
    pub link_prepare: BTreeMap<String, LinkPrepareHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_authorize(mut self, hook: impl Fn(Operation, &Session) -> Result<()> + Send + Sync + 'static) -> Self {
        self.authorize = Some(Arc::new(hook));
        self
    }

    pub fn on_validate(mut self, hook: impl Fn(&WriteContext<'_>, &mut Value) -> Result<()> + Send + Sync + 'static) -> Self {
        self.validate = Some(Arc::new(hook));
        self
    }

    pub fn on_prepare(mut self, hook: impl Fn(&WriteContext<'_>, &mut Value) -> Result<()> + Send + Sync + 'static) -> Self {
        self.prepare = Some(Arc::new(hook));
        self
    }

    pub fn on_link_prepare(
        mut self,
        path: impl Into<String>,
        hook: impl Fn(&LinkContext<'_>) -> Result<Map<String, Value>> + Send + Sync + 'static,
    ) -> Self {
        self.link_prepare.insert(path.into(), Arc::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("authorize", &self.authorize.is_some())
            .field("validate", &self.validate.is_some())
            .field("prepare", &self.prepare.is_some())
            .field("link_prepare", &self.link_prepare.keys().collect::<Vec<_>>())
            .finish()
    }
}
