//! The document AST this crate consumes.
//!
//! The core never parses a GraphQL document — that's the job of an external collaborator (a
//! real parser, or a hand-built AST in tests). What lives here is just the read-only tree shape
//! the writer and reader walk: fields (with optional alias, arguments, sub-selection), inline
//! fragments, and named fragment spreads, plus the fragment-definition map they're resolved
//! against.
//!
//! Names are `Arc<str>` rather than `String` so that selection sets built once (a parsed query)
//! can be cloned cheaply into every [`crate::watch::Watcher`] that reads them.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value as JsonValue;

/// A GraphQL name: a field, argument, fragment, or enum-value identifier.
pub type Name = Arc<str>;

/// The runtime variable environment a document is executed against: `$varName -> value`.
pub type Variables = JsonMap<serde_json_bytes::ByteString, JsonValue>;

pub(crate) fn lookup_variable<'v>(variables: &'v Variables, name: &str) -> Option<&'v JsonValue> {
    variables.get(name)
}

/// A literal argument value, as it appears in a document AST.
///
/// This mirrors a GraphQL value node. `Unsupported` stands in for whatever kind of value-node an
/// external AST producer might hand us that this crate's field-key encoder doesn't know how to
/// canonicalize (see [`crate::error::CacheError::UnsupportedArgumentKind`]); a hand-built AST
/// never needs to produce it.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Enum(Name),
    List(Vec<Value>),
    Object(IndexMap<Name, Value>),
    Variable(Name),
    /// A value-node kind this crate does not recognize, named for diagnostics.
    Unsupported(&'static str),
}

/// One selection within a selection set.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(FieldNode),
    InlineFragment(InlineFragmentNode),
    FragmentSpread(FragmentSpreadNode),
}

/// A selection set: an ordered, sharable list of selections.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SelectionSet(Arc<Vec<Selection>>);

impl SelectionSet {
    pub fn new(selections: Vec<Selection>) -> Self {
        Self(Arc::new(selections))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Selection> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a SelectionSet {
    type Item = &'a Selection;
    type IntoIter = std::slice::Iter<'a, Selection>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Selection> for SelectionSet {
    fn from_iter<T: IntoIterator<Item = Selection>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldNode {
    pub name: Name,
    pub alias: Option<Name>,
    pub arguments: IndexMap<Name, Value>,
    /// `None` for a leaf (scalar or opaque JSON) field; `Some` for a composite field.
    pub selection_set: Option<SelectionSet>,
}

impl FieldNode {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: IndexMap::new(),
            selection_set: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<Name>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_argument(mut self, name: impl Into<Name>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    pub fn with_selection_set(mut self, selection_set: SelectionSet) -> Self {
        self.selection_set = Some(selection_set);
        self
    }

    /// The key used to place this field's value in a reassembled response tree: the alias if
    /// present, else the field name. This is *not* the store's field key (see
    /// [`crate::field_key`]) — the alias never participates in storage identity.
    pub fn response_key(&self) -> &Name {
        self.alias.as_ref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragmentNode {
    pub type_condition: Option<Name>,
    pub selection_set: SelectionSet,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentSpreadNode {
    pub fragment_name: Name,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentDefinition {
    pub name: Name,
    pub type_condition: Name,
    pub selection_set: SelectionSet,
}

/// The fragment-definition map a document's named fragment spreads are resolved against.
pub type FragmentMap = IndexMap<Name, Arc<FragmentDefinition>>;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Enum(name) => write!(f, "{name}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Variable(name) => write!(f, "${name}"),
            Value::Unsupported(kind) => write!(f, "<unsupported:{kind}>"),
        }
    }
}
