//! Dependency tracking and change notification for registered reads.
//!
//! A [`Broadcaster`] remembers, per watch, which entities the last read actually touched. After a
//! write, the cache hands the broadcaster the set of entities that write affected; the
//! broadcaster returns the watches whose dependency set intersects it. This is strictly an
//! over-approximation at entity granularity (not per-field) — a write to a field a watch never
//! read, on an entity it did read, still marks it dirty. Tightening that to field-level deps would
//! cut needless re-reads at the cost of a second index; entity-level keeps the common case (most
//! entities are read in full or not at all) simple.
//!
//! There is no embedded scheduler or async runtime here. [`Broadcaster::dirty`] is a synchronous
//! function returning a plain `Vec`; the host decides when to call it and what "queue a
//! microtask" means in its own runtime, if anything.

use std::cell::RefCell;
use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json_bytes::Value as JsonValue;

use crate::document::FragmentMap;
use crate::document::Variables;
use crate::field_key::FieldKey;
use crate::reader::StoreView;
use crate::value::EntityId;
use crate::value::StoreValue;

/// A handle to a registered watch, returned by [`crate::cache::Cache::watch`] and required to
/// unregister it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub struct WatchToken(u64);

pub(crate) struct WatchEntry {
    pub root_id: String,
    pub selection_set: crate::document::SelectionSet,
    pub fragments: FragmentMap,
    pub variables: Variables,
    dependencies: HashSet<EntityId>,
    last_data: Option<JsonValue>,
}

/// The registry of active watches and their tracked dependencies.
#[derive(Default)]
pub struct Broadcaster {
    next_token: u64,
    watches: IndexMap<u64, WatchEntry>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(
        &mut self,
        root_id: impl Into<String>,
        selection_set: crate::document::SelectionSet,
        fragments: FragmentMap,
        variables: Variables,
    ) -> WatchToken {
        let token = self.next_token;
        self.next_token += 1;
        self.watches.insert(
            token,
            WatchEntry {
                root_id: root_id.into(),
                selection_set,
                fragments,
                variables,
                dependencies: HashSet::new(),
                last_data: None,
            },
        );
        WatchToken(token)
    }

    /// Unregisters a watch. Returns `false` if the token was already unregistered.
    pub fn unwatch(&mut self, token: WatchToken) -> bool {
        self.watches.shift_remove(&token.0).is_some()
    }

    pub(crate) fn entry(&self, token: WatchToken) -> Option<&WatchEntry> {
        self.watches.get(&token.0)
    }

    /// Records the dependency set and observed data of the most recent read for `token`.
    pub(crate) fn record_read(&mut self, token: WatchToken, dependencies: HashSet<EntityId>, data: JsonValue) {
        if let Some(entry) = self.watches.get_mut(&token.0) {
            entry.dependencies = dependencies;
            entry.last_data = Some(data);
        }
    }

    pub(crate) fn last_data(&self, token: WatchToken) -> Option<&JsonValue> {
        self.watches.get(&token.0).and_then(|entry| entry.last_data.as_ref())
    }

    /// Every currently-registered token whose last-read dependency set intersects `touched`.
    pub fn dirty(&self, touched: &HashSet<EntityId>) -> Vec<WatchToken> {
        self.watches
            .iter()
            .filter(|(_, entry)| entry.dependencies.iter().any(|id| touched.contains(id)))
            .map(|(token, _)| WatchToken(*token))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }
}

/// Wraps a [`StoreView`], recording every entity id a read touches. [`crate::cache::Cache`] reads
/// through one of these whenever it (re-)evaluates a watch, then hands the recorded set to
/// [`Broadcaster::record_read`].
pub struct TrackingView<'a> {
    inner: &'a dyn StoreView,
    touched: RefCell<HashSet<EntityId>>,
}

impl<'a> TrackingView<'a> {
    pub fn new(inner: &'a dyn StoreView) -> Self {
        Self {
            inner,
            touched: RefCell::new(HashSet::new()),
        }
    }

    pub fn into_dependencies(self) -> HashSet<EntityId> {
        self.touched.into_inner()
    }
}

impl StoreView for TrackingView<'_> {
    fn get_field(&self, entity_id: &EntityId, key: &FieldKey) -> Option<StoreValue> {
        self.touched.borrow_mut().insert(entity_id.clone());
        self.inner.get_field(entity_id, key)
    }

    fn has_entity(&self, entity_id: &EntityId) -> bool {
        self.touched.borrow_mut().insert(entity_id.clone());
        self.inner.has_entity(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FieldNode;
    use crate::document::Selection;
    use crate::document::SelectionSet;
    use crate::value::Store;

    #[test]
    fn a_watch_with_no_recorded_dependencies_is_never_dirty() {
        let mut broadcaster = Broadcaster::new();
        let token = broadcaster.watch(
            "ROOT_QUERY",
            SelectionSet::new(vec![Selection::Field(FieldNode::new("name"))]),
            FragmentMap::new(),
            Variables::new(),
        );

        let mut touched = HashSet::new();
        touched.insert(EntityId::from("ROOT_QUERY"));
        assert!(broadcaster.dirty(&touched).is_empty());
        let _ = token;
    }

    #[test]
    fn dirty_fires_once_a_dependency_is_recorded() {
        let mut broadcaster = Broadcaster::new();
        let token = broadcaster.watch(
            "ROOT_QUERY",
            SelectionSet::new(vec![Selection::Field(FieldNode::new("name"))]),
            FragmentMap::new(),
            Variables::new(),
        );

        let mut deps = HashSet::new();
        deps.insert(EntityId::from("ROOT_QUERY"));
        broadcaster.record_read(token, deps, JsonValue::from("Ada"));

        let mut touched = HashSet::new();
        touched.insert(EntityId::from("ROOT_QUERY"));
        assert_eq!(broadcaster.dirty(&touched), vec![token]);

        let mut unrelated = HashSet::new();
        unrelated.insert(EntityId::from("Other:1"));
        assert!(broadcaster.dirty(&unrelated).is_empty());
    }

    #[test]
    fn unwatch_removes_the_token_from_future_dirty_checks() {
        let mut broadcaster = Broadcaster::new();
        let token = broadcaster.watch(
            "ROOT_QUERY",
            SelectionSet::new(vec![]),
            FragmentMap::new(),
            Variables::new(),
        );
        let mut deps = HashSet::new();
        deps.insert(EntityId::from("ROOT_QUERY"));
        broadcaster.record_read(token, deps, JsonValue::Null);

        assert!(broadcaster.unwatch(token));
        let mut touched = HashSet::new();
        touched.insert(EntityId::from("ROOT_QUERY"));
        assert!(broadcaster.dirty(&touched).is_empty());
    }

    #[test]
    fn tracking_view_records_every_entity_touched() {
        let store = Store::new();
        let view = TrackingView::new(&store);
        let key = crate::field_key::field_key(&FieldNode::new("name"), &Variables::new()).unwrap();
        let _ = view.get_field(&EntityId::from("ROOT_QUERY"), &key);
        let _ = view.has_entity(&EntityId::from("User:1"));

        let deps = view.into_dependencies();
        assert!(deps.contains(&EntityId::from("ROOT_QUERY")));
        assert!(deps.contains(&EntityId::from("User:1")));
    }
}
