//! The optimistic layer stack: speculative writes stacked above the base store, reconciled
//! (committed) or discarded independently of one another.
//!
//! Layers are **not commutative**. Each layer's diff is the result of running its write *as of
//! when it was recorded*, against whatever was beneath it at that moment. Removing a layer out of
//! order therefore does not simply delete its diff and leave the others alone — every layer above
//! the removed one is replayed from scratch against the now-different stack underneath it, in the
//! original order those layers were first pushed. A recipe that reads existing data (an increment,
//! an append) can come out different after a rebase than it did the first time, and that is
//! working as intended: the whole point of rebasing is to re-derive "what would this mutation's
//! effect have been, had the removed one never happened."

use std::sync::Arc;

use crate::error::CacheError;
use crate::field_key::FieldKey;
use crate::reader::StoreView;
use crate::value::EntityId;
use crate::value::Store;
use crate::value::StoreValue;

/// A recorded write, re-runnable against whatever now sits beneath its layer. Takes the layer's
/// own (empty, on first run) diff store to write into, and the stack of stores beneath it to read
/// through — exactly [`crate::writer::Writer`]'s `target`/`lower` split.
pub type Recipe = Arc<dyn Fn(&mut Store, &[&Store]) -> Result<(), CacheError> + Send + Sync>;

struct OptimisticLayer {
    id: String,
    recipe: Recipe,
    diff: Store,
}

/// An ordered stack of optimistic layers above a caller-owned base [`Store`].
///
/// The stack does not own the base; every operation takes it by reference so a single base store
/// can be shared with the non-optimistic read/write path without copying.
#[derive(Default)]
pub struct OptimisticStack {
    layers: Vec<OptimisticLayer>,
}

impl OptimisticStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.layers.iter().any(|layer| layer.id == id)
    }

    /// Pushes a new layer on top of the stack, running its recipe against the base plus every
    /// layer already recorded.
    #[tracing::instrument(skip(self, base, recipe))]
    pub fn record(&mut self, base: &Store, id: String, recipe: Recipe) -> Result<(), CacheError> {
        if self.contains(&id) {
            crate::bail!("layer id \"{id}\" is already recorded");
        }
        let diff = Self::run(base, &self.layers, &recipe)?;
        self.layers.push(OptimisticLayer { id, recipe, diff });
        Ok(())
    }

    /// Removes a layer by id and rebases everything that was stacked above it.
    ///
    /// Returns `Ok(false)` if no layer with that id was found (a no-op, not an error — the caller
    /// may be racing a commit).
    #[tracing::instrument(skip(self, base))]
    pub fn remove(&mut self, base: &Store, id: &str) -> Result<bool, CacheError> {
        let Some(index) = self.layers.iter().position(|layer| layer.id == id) else {
            return Ok(false);
        };
        self.layers.remove(index);
        self.rebase_from(base, index)?;
        Ok(true)
    }

    /// Commits a layer into `base` (merging its diff's fields, overwriting whatever was there),
    /// removes it from the stack, and rebases everything above it against the now-updated base.
    ///
    /// Returns `Ok(false)` if no layer with that id was found.
    #[tracing::instrument(skip(self, base))]
    pub fn commit(&mut self, base: &mut Store, id: &str) -> Result<bool, CacheError> {
        let Some(index) = self.layers.iter().position(|layer| layer.id == id) else {
            return Ok(false);
        };
        let layer = self.layers.remove(index);
        for (entity_id, object) in layer.diff.iter() {
            let entry = base.entry(entity_id.clone());
            for (key, value) in object.iter() {
                entry.set(key.clone(), value.clone());
            }
        }
        self.rebase_from(base, index)
            .map(|()| true)
    }

    /// Re-runs every layer from `from_index` onward, in original push order, against the stack as
    /// it now stands beneath each one.
    fn rebase_from(&mut self, base: &Store, from_index: usize) -> Result<(), CacheError> {
        for index in from_index..self.layers.len() {
            let recipe = self.layers[index].recipe.clone();
            let new_diff = Self::run(base, &self.layers[..index], &recipe)?;
            self.layers[index].diff = new_diff;
        }
        Ok(())
    }

    /// Runs `recipe` into a fresh diff, reading through `layers_beneath` (oldest first, as kept
    /// in the stack) and then `base` — newest layer first, matching
    /// [`crate::writer::effective_get`]'s top-down scan order.
    fn run(base: &Store, layers_beneath: &[OptimisticLayer], recipe: &Recipe) -> Result<Store, CacheError> {
        let mut lower: Vec<&Store> = layers_beneath.iter().rev().map(|layer| &layer.diff).collect();
        lower.push(base);
        let mut diff = Store::new();
        recipe(&mut diff, &lower)?;
        Ok(diff)
    }

    /// An [`EffectiveView`] over the current stack plus `base`, suitable for reading the net
    /// effect of every recorded layer.
    pub fn view<'a>(&'a self, base: &'a Store) -> EffectiveView<'a> {
        EffectiveView {
            base,
            layers: self.layers.iter().map(|layer| &layer.diff).collect(),
        }
    }
}

/// A read-only, top-down view over the optimistic stack: the most recently recorded layer that
/// has a field wins, falling through to the base if none do.
pub struct EffectiveView<'a> {
    base: &'a Store,
    layers: Vec<&'a Store>,
}

impl StoreView for EffectiveView<'_> {
    fn get_field(&self, entity_id: &EntityId, key: &FieldKey) -> Option<StoreValue> {
        for layer in self.layers.iter().rev() {
            if let Some(object) = layer.get(entity_id) {
                if let Some(value) = object.get(key) {
                    return Some(value.as_ref().clone());
                }
            }
        }
        self.base
            .get(entity_id)
            .and_then(|object| object.get(key))
            .map(|value| value.as_ref().clone())
    }

    fn has_entity(&self, entity_id: &EntityId) -> bool {
        self.layers.iter().any(|layer| layer.contains(entity_id)) || self.base.contains(entity_id)
    }
}

impl EffectiveView<'_> {
    /// Every entity id visible anywhere in this view: the base plus every layer, deduplicated.
    pub fn entity_ids(&self) -> std::collections::HashSet<EntityId> {
        let mut ids: std::collections::HashSet<EntityId> = self.base.ids().cloned().collect();
        for layer in &self.layers {
            ids.extend(layer.ids().cloned());
        }
        ids
    }

    /// Every layer's entities, oldest (first pushed) to newest, for materializing the effective
    /// store into a plain [`Store`] (see [`crate::cache::Cache::extract`]). Applying these diffs
    /// over a clone of the base in this order reproduces exactly what [`StoreView::get_field`]
    /// would return for each field.
    pub fn layered_entities(&self) -> impl Iterator<Item = (&EntityId, &crate::value::StoreObject)> {
        self.layers.iter().flat_map(|layer| layer.iter())
    }
}
