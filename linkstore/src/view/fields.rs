//! Field selection expressions: `name, profile(city, age), *`.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const ALL: &str = "*";

/// What is wanted under one selected key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The key itself, without a sub-selection.
    All,
    Nested(FieldSelector),
}

/// Nested mapping of wanted field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector(BTreeMap<String, Selection>);

impl FieldSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector naming the given top-level keys.
    pub fn of(keys: &[&str]) -> Self {
        FieldSelector(keys.iter().map(|k| (k.to_string(), Selection::All)).collect())
    }

    pub fn insert(&mut self, key: impl Into<String>, selection: Selection) {
        self.0.insert(key.into(), selection);
    }

    pub fn get(&self, key: &str) -> Option<&Selection> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// True when `*` is selected at this level.
    pub fn is_wildcard(&self) -> bool {
        self.0.contains_key(ALL)
    }

    /// True when nothing but `_id` is requested.
    pub fn only_id(&self) -> bool {
        self.0.keys().all(|k| k == crate::document::ID)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Selection)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{name: 1, profile: {city: 1}}` form.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, s)| {
                let v = match s {
                    Selection::All => Value::from(1),
                    Selection::Nested(inner) => inner.to_value(),
                };
                (k.clone(), v)
            })
            .collect();
        Value::Object(map)
    }
}

impl std::str::FromStr for FieldSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_fields(s)?.ok_or_else(|| Error::ParseFields("empty field list".into()))
    }
}

/// Parse a selection expression. Blank input means "no projection".
pub fn parse_fields(input: &str) -> Result<Option<FieldSelector>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let selector = parser.list()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(parser.error("unexpected character"));
    }
    Ok(Some(selector))
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn list(&mut self) -> Result<FieldSelector> {
        let mut selector = FieldSelector::new();
        loop {
            let name = self.name()?;
            self.skip_ws();
            let selection = if self.peek() == Some('(') {
                self.pos += 1;
                let inner = self.list()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Selection::Nested(inner)
            } else {
                Selection::All
            };
            selector.insert(name, selection);
            self.skip_ws();
            if self.peek() == Some(',') {
                self.pos += 1;
            } else {
                return Ok(selector);
            }
        }
    }

    fn name(&mut self) -> Result<String> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'' | '`')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().map_or(false, |c| c != q) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated quote"));
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                if name.is_empty() {
                    return Err(self.error("empty field name"));
                }
                Ok(name)
            }
            _ => {
                let start = self.pos;
                while self
                    .peek()
                    .map_or(false, |c| !c.is_whitespace() && !matches!(c, ',' | '(' | ')' | '"' | '\'' | '`'))
                {
                    self.pos += 1;
                }
                if start == self.pos {
                    return Err(self.error("expected field name"));
                }
                Ok(self.chars[start..self.pos].iter().collect())
            }
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn error(&self, what: &str) -> Error {
        let source: String = self.chars.iter().collect();
        Error::ParseFields(format!("{what} at position {} in \"{source}\"", self.pos))
    }
}
