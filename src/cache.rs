//! The public façade: the one type an external collaborator (a client, a test, a link) actually
//! holds. [`Cache`] wires together the five pieces the rest of this crate builds in isolation — a
//! base [`Store`], an [`OptimisticStack`] layered over it, a [`Writer`]/[`Reader`] pair, and a
//! [`Broadcaster`] — into the read/write/watch/optimistic/snapshot surface described at the
//! core's boundary.
//!
//! Nothing below this module's API is meant to be driven directly by a host; `write`/`read`/
//! `watch`/`record_optimistic`/`extract` are the whole contract.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json_bytes::Value as JsonValue;

use crate::document::FragmentMap;
use crate::document::SelectionSet;
use crate::document::Variables;
use crate::error::CacheError;
use crate::optimistic::OptimisticStack;
use crate::optimistic::Recipe;
use crate::reader::ReadOutcome;
use crate::reader::Reader;
use crate::reader::StoreView;
use crate::snapshot;
use crate::value::EntityId;
use crate::value::Store;
use crate::watch::Broadcaster;
use crate::watch::TrackingView;
use crate::watch::WatchToken;
use crate::writer::Identify;
use crate::writer::ROOT_QUERY_ID;
use crate::writer::Writer;

/// A registered watch's callback. Invoked with a fresh [`ReadOutcome`] only when the reassembled
/// `data` actually differs from the previous notification (see [`Broadcaster::dirty`]).
pub type WatchCallback = Box<dyn FnMut(ReadOutcome) + Send>;

/// A normalized GraphQL result cache: flat store, optimistic overlay stack, and watch registry.
///
/// One `Cache` is one independent instance — there is no process-wide singleton state here (see
/// §9's note on the watcher registry); a host embedding more than one cache just constructs more
/// than one of these.
pub struct Cache {
    base: Store,
    optimistic: OptimisticStack,
    writer: Writer,
    reader: Reader,
    broadcaster: Broadcaster,
    callbacks: HashMap<WatchToken, WatchCallback>,
}

impl Cache {
    pub fn new(identify: Arc<dyn Identify>, possible_types: Arc<HashMap<String, Vec<String>>>) -> Self {
        Self {
            base: Store::new(),
            optimistic: OptimisticStack::new(),
            writer: Writer::new(identify, possible_types.clone()),
            reader: Reader::new(possible_types),
            broadcaster: Broadcaster::new(),
            callbacks: HashMap::new(),
        }
    }

    /// A cache with no `identify` at all: every composite object gets a synthetic, path-derived
    /// id. Useful for tests and for schemas with no entity-typed data.
    pub fn without_identity() -> Self {
        Self::new(Arc::new(crate::writer::NeverIdentify), Arc::new(HashMap::new()))
    }

    fn view(&self) -> crate::optimistic::EffectiveView<'_> {
        self.optimistic.view(&self.base)
    }

    /// Normalizes `data` into the store, rooted at `root_id` (defaults to [`ROOT_QUERY_ID`] for a
    /// query; pass [`crate::writer::ROOT_MUTATION_ID`] for a mutation response). Notifies every
    /// watch whose dependencies this write touched.
    pub fn write(
        &mut self,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        data: &JsonValue,
        variables: &Variables,
        root_id: &str,
    ) -> Result<(), CacheError> {
        let touched = self
            .writer
            .write_result(&mut self.base, &[], root_id, selection_set, fragments, data, variables)?;
        self.notify(&touched)
    }

    /// Reassembles `selection_set` starting at `root_id`, reading through the optimistic stack if
    /// any layers are currently recorded.
    pub fn read(
        &self,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
        root_id: &str,
    ) -> Result<ReadOutcome, CacheError> {
        let view = self.view();
        self.reader.read(&view, root_id, selection_set, fragments, variables)
    }

    /// Reads a selection set directly against an arbitrary, already-identified entity.
    pub fn read_fragment(
        &self,
        entity_id: &EntityId,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
    ) -> Result<ReadOutcome, CacheError> {
        let view = self.view();
        self.reader
            .read_entity(&view, entity_id, selection_set, fragments, variables)
    }

    /// Writes a selection set directly against an arbitrary, already-identified entity, with no
    /// enclosing operation root.
    pub fn write_fragment(
        &mut self,
        entity_id: &EntityId,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        data: &JsonValue,
        variables: &Variables,
    ) -> Result<(), CacheError> {
        let touched = self
            .writer
            .write_fragment(&mut self.base, &[], entity_id, selection_set, fragments, data, variables)?;
        self.notify(&touched)
    }

    /// Registers a live read: `callback` fires once immediately with the current data, then again
    /// every time a write touches one of this read's dependencies *and* the reassembled data
    /// actually changes. Returns a token; drop it by calling [`Cache::unwatch`] (the "unsubscribe"
    /// function of the external interface).
    pub fn watch(
        &mut self,
        selection_set: SelectionSet,
        fragments: FragmentMap,
        variables: Variables,
        root_id: impl Into<String>,
        mut callback: WatchCallback,
    ) -> Result<WatchToken, CacheError> {
        let root_id = root_id.into();
        let token = self
            .broadcaster
            .watch(root_id.clone(), selection_set.clone(), fragments.clone(), variables.clone());

        let view = self.view();
        let tracking = TrackingView::new(&view);
        let outcome = self
            .reader
            .read(&tracking, &root_id, &selection_set, &fragments, &variables)?;
        let dependencies = tracking.into_dependencies();
        self.broadcaster.record_read(token, dependencies, outcome.data.clone());

        callback(outcome);
        self.callbacks.insert(token, callback);
        Ok(token)
    }

    /// Unregisters a watch. Returns `false` if the token was already unregistered.
    pub fn unwatch(&mut self, token: WatchToken) -> bool {
        self.callbacks.remove(&token);
        self.broadcaster.unwatch(token)
    }

    /// Re-evaluates every watch whose dependency set intersects `touched`, firing callbacks for
    /// the ones whose reassembled data actually changed.
    fn notify(&mut self, touched: &HashSet<EntityId>) -> Result<(), CacheError> {
        if self.broadcaster.is_empty() {
            return Ok(());
        }
        for token in self.broadcaster.dirty(touched) {
            let Some(entry) = self.broadcaster.entry(token) else {
                continue;
            };
            let root_id = entry.root_id.clone();
            let selection_set = entry.selection_set.clone();
            let fragments = entry.fragments.clone();
            let variables = entry.variables.clone();

            let (outcome, dependencies) = {
                let view = self.view();
                let tracking = TrackingView::new(&view);
                let outcome = self
                    .reader
                    .read(&tracking, &root_id, &selection_set, &fragments, &variables)?;
                let dependencies = tracking.into_dependencies();
                (outcome, dependencies)
            };

            let changed = self.broadcaster.last_data(token) != Some(&outcome.data);
            self.broadcaster.record_read(token, dependencies, outcome.data.clone());

            if changed {
                if let Some(callback) = self.callbacks.get_mut(&token) {
                    callback(outcome);
                }
            }
        }
        Ok(())
    }

    /// Pushes an arbitrary recorded write as a new optimistic layer, tagged with `mutation_id`.
    /// `recipe` is replayed verbatim on every rebase (see [`OptimisticStack::remove`]): it must be
    /// a pure function of the layers beneath it at replay time.
    pub fn record_optimistic(&mut self, mutation_id: impl Into<String>, recipe: Recipe) -> Result<(), CacheError> {
        self.optimistic.record(&self.base, mutation_id.into(), recipe)?;
        let touched = self.all_entity_ids();
        self.notify(&touched)
    }

    /// Convenience over [`Cache::record_optimistic`] for the common case: a GraphQL mutation's
    /// `optimisticResponse`, normalized exactly as a real response would be.
    pub fn record_optimistic_response(
        &mut self,
        mutation_id: impl Into<String>,
        selection_set: SelectionSet,
        fragments: FragmentMap,
        data: JsonValue,
        variables: Variables,
        root_id: impl Into<String>,
    ) -> Result<(), CacheError> {
        let writer = self.writer.clone();
        let root_id = root_id.into();
        let recipe: Recipe = Arc::new(move |diff: &mut Store, lower: &[&Store]| {
            writer
                .write_result(diff, lower, &root_id, &selection_set, &fragments, &data, &variables)
                .map(|_touched| ())
        });
        self.record_optimistic(mutation_id, recipe)
    }

    /// Removes a layer (the mutation errored, or the caller is cancelling it) and rebases every
    /// layer that was stacked above it. A no-op if `mutation_id` is not currently recorded.
    pub fn remove_optimistic(&mut self, mutation_id: &str) -> Result<bool, CacheError> {
        let removed = self.optimistic.remove(&self.base, mutation_id)?;
        if removed {
            let touched = self.all_entity_ids();
            self.notify(&touched)?;
        }
        Ok(removed)
    }

    /// Commits a layer's diff into the base store (the authoritative server response has already
    /// landed there, or is about to be written by the caller just before calling this) and rebases
    /// layers above it.
    pub fn commit_optimistic(&mut self, mutation_id: &str) -> Result<bool, CacheError> {
        let committed = self.optimistic.commit(&mut self.base, mutation_id)?;
        if committed {
            let touched = self.all_entity_ids();
            self.notify(&touched)?;
        }
        Ok(committed)
    }

    /// Every entity id currently visible in the base store or any optimistic layer. Used as the
    /// conservative `touched` set for operations (optimistic push/remove/commit, restore) that can
    /// shift many entities' effective values at once without the writer's narrower per-write set.
    fn all_entity_ids(&self) -> HashSet<EntityId> {
        self.view().entity_ids()
    }

    /// Serializes the store to a wire-stable snapshot. When `include_optimistic` is `true`, the
    /// snapshot reflects the effective store (base plus every recorded layer, most recent
    /// winning); otherwise it reflects only the base, exactly as if no mutation were in flight.
    pub fn extract(&self, include_optimistic: bool) -> JsonValue {
        if !include_optimistic || self.optimistic.is_empty() {
            return snapshot::extract(&self.base);
        }
        snapshot::extract(&self.effective_store())
    }

    /// Materializes the current effective store (base plus every optimistic layer, oldest to
    /// newest) into a plain [`Store`] for serialization. Not used on the hot read path — reads go
    /// through [`crate::optimistic::EffectiveView`] instead, which needs no such materialization.
    fn effective_store(&self) -> Store {
        let mut merged = self.base.clone();
        for (entity_id, object) in self.optimistic.view(&self.base).layered_entities() {
            let entry = merged.entry(entity_id.clone());
            for (key, value) in object.iter() {
                entry.set(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Replaces the base store wholesale from a snapshot produced by [`Cache::extract`], dropping
    /// any in-flight optimistic layers (there is nothing left underneath them to rebase against)
    /// and notifying every watch.
    pub fn restore(&mut self, snapshot: &JsonValue) -> Result<(), CacheError> {
        let mut touched: HashSet<EntityId> = self.all_entity_ids();
        let restored = snapshot::restore(snapshot)?;
        touched.extend(restored.ids().cloned());
        self.base = restored;
        self.optimistic = OptimisticStack::new();
        self.notify(&touched)
    }

    /// The number of entities currently in the base store (ignoring optimistic layers).
    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::without_identity()
    }
}

/// Convenience for the common case of writing/reading an entire operation rooted at the query
/// root rather than an arbitrary fragment entity.
pub fn query_root() -> &'static str {
    ROOT_QUERY_ID
}
