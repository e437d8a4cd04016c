//! The flat, keyed store and the value taxonomy its objects are built from.
//!
//! Normalized data lives in two layers: an [`EntityId`] names an object-shaped piece of the
//! response (either a real, application-assigned identity or a synthetic one minted by the
//! writer), and a [`StoreObject`] is that object's fields keyed by [`FieldKey`]. Every field value
//! is one of four shapes ([`StoreValue`]) — nothing else is representable, by construction.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json_bytes::Value as JsonValue;

use crate::field_key::FieldKey;

/// The identity of a normalized entity: `Type:id` for a real identity, `$<n>` for a synthetic one
/// minted by the writer for an object `identify` could not name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct EntityId(Arc<str>);

impl EntityId {
    /// Builds a real entity id from an `identify`-returned id string and the object's concrete
    /// type name. The caller-supplied `id` must not already begin with `$`; that prefix is
    /// reserved for synthetic ids (enforced by the writer, not here).
    pub fn real(type_name: &str, id: &str) -> Self {
        Self(Arc::from(format!("{type_name}:{id}")))
    }

    /// Mints a synthetic id from a stable path token (e.g. `Query.todos.0`): writing the same
    /// selection at the same position twice, before an object ever gains a real identity, yields
    /// the same synthetic id both times, so a re-fetch overwrites the earlier synthetic record
    /// instead of leaking a new one next to it.
    pub fn synthetic(path: impl fmt::Display) -> Self {
        Self(Arc::from(format!("${path}")))
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with('$')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(Arc::from(raw))
    }
}

/// One element of a [`StoreValue::ReferenceList`], allowing dangling elements (which survive a
/// child's identity falling out of the store, or a list slot whose value was explicitly `null`)
/// without collapsing the list's shape.
#[derive(Clone, Debug, PartialEq)]
pub enum ListItem {
    /// `generated` mirrors [`StoreValue::Reference`]'s: true when `id` was minted by the writer
    /// rather than returned by `identify`.
    Reference(EntityId, bool),
    Scalar(JsonValue),
    Null,
    /// A nested list, for list-of-list fields.
    List(Vec<ListItem>),
}

/// The value taxonomy every stored field belongs to. This is the closed set invariant I1 refers
/// to: a [`crate::writer::Writer`] never produces anything outside these shapes, and a
/// [`crate::reader::Reader`] never needs to handle anything else.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreValue {
    /// A leaf value with no sub-selection: string, number, bool, null, or an array of those.
    Scalar(JsonValue),
    /// An opaque JSON object stored verbatim because the field that produced it has no
    /// sub-selection to normalize it against (and so nothing underneath it is addressable).
    JsonBlob(JsonValue),
    /// A pointer to another normalized entity. `generated` is true when `id` is a synthetic,
    /// writer-minted id rather than one `identify` returned.
    Reference(EntityId, bool),
    /// A list field whose value is itself a list (of references, scalars, or nested lists).
    ReferenceList(Vec<ListItem>),
}

/// A normalized entity's fields, in first-write order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreObject {
    fields: IndexMap<FieldKey, Arc<StoreValue>>,
}

impl StoreObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FieldKey) -> Option<&Arc<StoreValue>> {
        self.fields.get(key)
    }

    /// Sets a field's value, returning the previous one if the key was already present.
    ///
    /// The value arrives pre-wrapped in `Arc` so a write that doesn't touch this field leaves its
    /// `Arc` untouched: cloning a [`StoreObject`] (and so a [`Store`]) only deep-clones the fields
    /// that actually changed.
    pub fn set(&mut self, key: FieldKey, value: Arc<StoreValue>) -> Option<Arc<StoreValue>> {
        self.fields.insert(key, value)
    }

    pub fn remove(&mut self, key: &FieldKey) -> Option<Arc<StoreValue>> {
        self.fields.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &Arc<StoreValue>)> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// A flat map from entity id to its normalized fields: the base of truth the writer populates and
/// the reader denormalizes out of.
///
/// A plain `Store` is itself a valid base layer for the optimistic stack (see
/// [`crate::optimistic`]): the writer does not distinguish "the base store" from "one layer's
/// diff," it only ever sees a `&mut Store` to write into and zero or more `&Store` to read
/// underneath it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Store {
    objects: IndexMap<EntityId, StoreObject>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntityId) -> Option<&StoreObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.objects.contains_key(id)
    }

    /// Returns a mutable handle to the object at `id`, creating an empty one if absent.
    pub fn entry(&mut self, id: EntityId) -> &mut StoreObject {
        self.objects.entry(id).or_default()
    }

    /// Removes an entity entirely, returning its fields if it was present.
    pub fn remove(&mut self, id: &EntityId) -> Option<StoreObject> {
        self.objects.shift_remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &StoreObject)> {
        self.objects.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.objects.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store({} entities)", self.objects.len())
    }
}
