//! The normalizer: turns a response tree into flat, keyed store entries.
//!
//! [`Writer`] is parameterized over a *target* store (what it mutates) and zero or more *lower*
//! layers (what it reads through, but never writes to). A plain write against the base store
//! passes no lower layers; an optimistic write passes the layers beneath the one being recorded.
//! This is the same code path either way — the writer does not know it is running "optimistically"
//! any more than a function knows it is being called from a closure.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value as JsonValue;

use crate::document::FieldNode;
use crate::document::FragmentMap;
use crate::document::Selection;
use crate::document::SelectionSet;
use crate::document::Variables;
use crate::error::CacheError;
use crate::field_key::FieldKey;
use crate::field_key::field_key;
use crate::reconcile::fold_synthetic_into_real;
use crate::value::EntityId;
use crate::value::ListItem;
use crate::value::Store;
use crate::value::StoreValue;

/// The entity id of the root query object. Not an entity type in its own right — just a fixed
/// anchor every read and write against the top-level operation hangs off of.
pub const ROOT_QUERY_ID: &str = "ROOT_QUERY";

/// The entity id of the root mutation object, used when normalizing a mutation response so its
/// root fields don't collide with `ROOT_QUERY_ID`'s.
pub const ROOT_MUTATION_ID: &str = "ROOT_MUTATION";

/// Derives a stable identity for a normalized object from its runtime value, or declines to (in
/// which case the writer mints a synthetic, path-derived one).
///
/// An id this returns must never begin with `$` — that prefix is reserved for synthetic ids — and
/// the writer rejects one that does with [`CacheError::IdentityViolation`] rather than silently
/// colliding with its own namespace.
pub trait Identify: Send + Sync {
    fn identify(&self, object: &JsonValue) -> Option<String>;
}

impl<F> Identify for F
where
    F: Fn(&JsonValue) -> Option<String> + Send + Sync,
{
    fn identify(&self, object: &JsonValue) -> Option<String> {
        self(object)
    }
}

/// An `identify` that never names anything; every object is written under a synthetic, path-keyed
/// id. Useful for tests and for callers with no entity-typed data at all.
pub struct NeverIdentify;

impl Identify for NeverIdentify {
    fn identify(&self, _object: &JsonValue) -> Option<String> {
        None
    }
}

/// Normalizes response trees into a [`Store`].
///
/// Cheap to clone: both fields are already `Arc`-wrapped, so a [`crate::cache::Cache`] can hand a
/// clone into an optimistic [`crate::optimistic::Recipe`] closure without borrowing itself.
#[derive(Clone)]
pub struct Writer {
    identify: Arc<dyn Identify>,
    possible_types: Arc<HashMap<String, Vec<String>>>,
}

impl Writer {
    pub fn new(identify: Arc<dyn Identify>, possible_types: Arc<HashMap<String, Vec<String>>>) -> Self {
        Self {
            identify,
            possible_types,
        }
    }

    /// Writes a full operation result into `store`, rooted at `root_id` (see
    /// [`ROOT_QUERY_ID`]/[`ROOT_MUTATION_ID`]). Returns every entity id the write touched, for the
    /// dependency tracker (see [`crate::watch`]) to compare against each watcher's read set.
    #[tracing::instrument(skip(self, store, lower, fragments, data, variables))]
    pub fn write_result(
        &self,
        store: &mut Store,
        lower: &[&Store],
        root_id: &str,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        data: &JsonValue,
        variables: &Variables,
    ) -> Result<HashSet<EntityId>, CacheError> {
        let JsonValue::Object(object) = data else {
            crate::bail!("write_result expects an object at the root, got {data:?}");
        };
        let mut touched = HashSet::new();
        self.write_selection_set(
            store,
            lower,
            &EntityId::from(root_id),
            root_id,
            selection_set,
            fragments,
            object,
            variables,
            &mut touched,
        )?;
        Ok(touched)
    }

    /// Writes a selection set directly against an already-identified entity — the path used for
    /// standalone fragment writes (`cache.write_fragment`), where there is no enclosing operation.
    #[tracing::instrument(skip(self, store, lower, fragments, data, variables))]
    pub fn write_fragment(
        &self,
        store: &mut Store,
        lower: &[&Store],
        entity_id: &EntityId,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        data: &JsonValue,
        variables: &Variables,
    ) -> Result<HashSet<EntityId>, CacheError> {
        let JsonValue::Object(object) = data else {
            crate::bail!("write_fragment expects an object, got {data:?}");
        };
        let mut touched = HashSet::new();
        self.write_selection_set(
            store,
            lower,
            entity_id,
            entity_id.as_str(),
            selection_set,
            fragments,
            object,
            variables,
            &mut touched,
        )?;
        Ok(touched)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_selection_set(
        &self,
        store: &mut Store,
        lower: &[&Store],
        entity_id: &EntityId,
        path: &str,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        object: &JsonMap<serde_json_bytes::ByteString, JsonValue>,
        variables: &Variables,
        touched: &mut HashSet<EntityId>,
    ) -> Result<(), CacheError> {
        touched.insert(entity_id.clone());

        let typename = object
            .get("__typename")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    self.write_field(
                        store, lower, entity_id, path, field, fragments, object, variables, touched,
                    )?;
                }
                Selection::InlineFragment(inline) => {
                    if self.applies(inline.type_condition.as_deref(), typename.as_deref()) {
                        self.write_selection_set(
                            store,
                            lower,
                            entity_id,
                            path,
                            &inline.selection_set,
                            fragments,
                            object,
                            variables,
                            touched,
                        )?;
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let definition = fragments.get(&spread.fragment_name).ok_or_else(|| {
                        CacheError::MissingFragment {
                            name: spread.fragment_name.to_string(),
                        }
                    })?;
                    if self.applies(Some(&definition.type_condition), typename.as_deref()) {
                        self.write_selection_set(
                            store,
                            lower,
                            entity_id,
                            path,
                            &definition.selection_set,
                            fragments,
                            object,
                            variables,
                            touched,
                        )?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether a type condition applies to the object currently being written.
    ///
    /// When the object's `__typename` is unknown (absent from the selection), this resolves
    /// conservatively in favor of writing the fragment's fields rather than silently dropping
    /// data the caller may need — the alternative (skipping) risks losing writes for callers who
    /// never select `__typename` at all.
    fn applies(&self, type_condition: Option<&str>, typename: Option<&str>) -> bool {
        let Some(condition) = type_condition else {
            return true;
        };
        let Some(typename) = typename else {
            return true;
        };
        if condition == typename {
            return true;
        }
        self.possible_types
            .get(condition)
            .is_some_and(|members| members.iter().any(|member| member == typename))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_field(
        &self,
        store: &mut Store,
        lower: &[&Store],
        entity_id: &EntityId,
        path: &str,
        field: &FieldNode,
        fragments: &FragmentMap,
        object: &JsonMap<serde_json_bytes::ByteString, JsonValue>,
        variables: &Variables,
        touched: &mut HashSet<EntityId>,
    ) -> Result<(), CacheError> {
        let Some(raw_value) = object.get(field.response_key().as_ref()) else {
            // Partial data: this selection wasn't fulfilled by this particular response. Leave
            // whatever the store already has for this field untouched.
            return Ok(());
        };

        let key = field_key(field, variables)?;
        let field_path = format!("{path}.{key}");

        let store_value = match &field.selection_set {
            None => match raw_value {
                JsonValue::Object(_) => StoreValue::JsonBlob(raw_value.clone()),
                _ => StoreValue::Scalar(raw_value.clone()),
            },
            Some(child_selection) => match raw_value {
                JsonValue::Null => StoreValue::Scalar(JsonValue::Null),
                JsonValue::Array(items) => StoreValue::ReferenceList(self.write_list(
                    store,
                    lower,
                    &field_path,
                    child_selection,
                    fragments,
                    items,
                    variables,
                    touched,
                )?),
                JsonValue::Object(child_object) => {
                    let child_id = self.write_child_object(
                        store,
                        lower,
                        &field_path,
                        child_selection,
                        fragments,
                        child_object,
                        variables,
                        touched,
                    )?;
                    self.check_no_identity_regression(store, lower, entity_id, &key, &child_id, &field_path)?;
                    let generated = child_id.is_synthetic();
                    StoreValue::Reference(child_id, generated)
                }
                other => crate::bail!(
                    "field {} has a sub-selection but its value ({:?}) is not an object, list, or null",
                    field.name,
                    other
                ),
            },
        };

        store.entry(entity_id.clone()).set(key, Arc::new(store_value));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_list(
        &self,
        store: &mut Store,
        lower: &[&Store],
        path: &str,
        child_selection: &SelectionSet,
        fragments: &FragmentMap,
        items: &[JsonValue],
        variables: &Variables,
        touched: &mut HashSet<EntityId>,
    ) -> Result<Vec<ListItem>, CacheError> {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let item_path = format!("{path}.{index}");
                self.write_list_item(
                    store,
                    lower,
                    &item_path,
                    child_selection,
                    fragments,
                    item,
                    variables,
                    touched,
                )
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn write_list_item(
        &self,
        store: &mut Store,
        lower: &[&Store],
        path: &str,
        child_selection: &SelectionSet,
        fragments: &FragmentMap,
        item: &JsonValue,
        variables: &Variables,
        touched: &mut HashSet<EntityId>,
    ) -> Result<ListItem, CacheError> {
        match item {
            JsonValue::Null => Ok(ListItem::Null),
            JsonValue::Array(nested) => Ok(ListItem::List(self.write_list(
                store,
                lower,
                path,
                child_selection,
                fragments,
                nested,
                variables,
                touched,
            )?)),
            JsonValue::Object(object) => {
                let child_id = self.write_child_object(
                    store,
                    lower,
                    path,
                    child_selection,
                    fragments,
                    object,
                    variables,
                    touched,
                )?;
                let generated = child_id.is_synthetic();
                Ok(ListItem::Reference(child_id, generated))
            }
            scalar => Ok(ListItem::Scalar(scalar.clone())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, store, lower, fragments, object, variables, touched))]
    fn write_child_object(
        &self,
        store: &mut Store,
        lower: &[&Store],
        path: &str,
        child_selection: &SelectionSet,
        fragments: &FragmentMap,
        object: &JsonMap<serde_json_bytes::ByteString, JsonValue>,
        variables: &Variables,
        touched: &mut HashSet<EntityId>,
    ) -> Result<EntityId, CacheError> {
        let identified = self.identify.identify(&JsonValue::Object(object.clone()));

        let entity_id = match identified {
            Some(id) if id.starts_with('$') => {
                return Err(CacheError::IdentityViolation { id });
            }
            Some(id) => {
                let real_id = EntityId::from(id.as_str());
                let synthetic_id = EntityId::synthetic(path);
                fold_synthetic_into_real(store, lower, &synthetic_id, &real_id);
                touched.insert(synthetic_id);
                real_id
            }
            None => EntityId::synthetic(path),
        };

        self.write_selection_set(
            store,
            lower,
            &entity_id,
            path,
            child_selection,
            fragments,
            object,
            variables,
            touched,
        )?;
        Ok(entity_id)
    }

    /// Rejects a write that would replace an existing *real* reference with a freshly generated
    /// *synthetic* one at the same field — almost always a sign the caller stopped supplying an id
    /// for something it used to identify, which silently fragments what was one cached entity into
    /// two.
    fn check_no_identity_regression(
        &self,
        store: &Store,
        lower: &[&Store],
        entity_id: &EntityId,
        key: &FieldKey,
        new_value: &EntityId,
        path: &str,
    ) -> Result<(), CacheError> {
        if !new_value.is_synthetic() {
            return Ok(());
        }
        if let Some(StoreValue::Reference(existing, _)) = effective_get(store, lower, entity_id, key) {
            if !existing.is_synthetic() {
                return Err(CacheError::IdentityOverwrite {
                    existing_id: existing.to_string(),
                    path: path.to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Reads a field's value by scanning `target` first, then `lower` layers top-down, returning the
/// first one that has it. This is the one read primitive both the writer (identity-regression
/// checks) and the optimistic stack (effective view composition, see [`crate::optimistic`]) share.
pub fn effective_get(target: &Store, lower: &[&Store], entity_id: &EntityId, key: &FieldKey) -> Option<StoreValue> {
    if let Some(object) = target.get(entity_id) {
        if let Some(value) = object.get(key) {
            return Some(value.as_ref().clone());
        }
    }
    for layer in lower {
        if let Some(object) = layer.get(entity_id) {
            if let Some(value) = object.get(key) {
                return Some(value.as_ref().clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::document::FieldNode;
    use crate::document::InlineFragmentNode;
    use crate::document::Selection;
    use crate::document::SelectionSet;

    fn writer_with_id_field() -> Writer {
        Writer::new(
            Arc::new(|object: &JsonValue| -> Option<String> {
                let typename = object.get("__typename")?.as_str()?;
                let id = object.get("id")?.as_str()?;
                Some(format!("{typename}:{id}"))
            }),
            Arc::new(HashMap::new()),
        )
    }

    fn selection(fields: Vec<Selection>) -> SelectionSet {
        SelectionSet::new(fields)
    }

    #[test]
    fn scalar_field_is_stored_directly() {
        let writer = Writer::new(Arc::new(NeverIdentify), Arc::new(HashMap::new()));
        let mut store = Store::new();
        let selection_set = selection(vec![Selection::Field(FieldNode::new("name"))]);
        let data = json!({ "name": "Ada" });
        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &data,
                &Variables::new(),
            )
            .unwrap();

        let root = store.get(&EntityId::from(ROOT_QUERY_ID)).unwrap();
        let key = field_key(&FieldNode::new("name"), &Variables::new()).unwrap();
        assert_eq!(
            root.get(&key).unwrap().as_ref(),
            &StoreValue::Scalar(JsonValue::from("Ada"))
        );
    }

    #[test]
    fn identified_child_is_written_under_a_real_entity_id() {
        let writer = writer_with_id_field();
        let mut store = Store::new();
        let selection_set = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(selection(vec![
                Selection::Field(FieldNode::new("__typename")),
                Selection::Field(FieldNode::new("id")),
                Selection::Field(FieldNode::new("name")),
            ])),
        )]);
        let data = json!({ "me": { "__typename": "User", "id": "1", "name": "Ada" } });
        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &data,
                &Variables::new(),
            )
            .unwrap();

        assert!(store.contains(&EntityId::real("User", "1")));
    }

    #[test]
    fn unidentified_child_gets_a_stable_synthetic_id_across_writes() {
        let writer = Writer::new(Arc::new(NeverIdentify), Arc::new(HashMap::new()));
        let selection_set = selection(vec![Selection::Field(
            FieldNode::new("viewer")
                .with_selection_set(selection(vec![Selection::Field(FieldNode::new("name"))])),
        )]);

        let mut store = Store::new();
        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &json!({ "viewer": { "name": "Ada" } }),
                &Variables::new(),
            )
            .unwrap();
        let ids_after_first: Vec<_> = store.ids().cloned().collect();

        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &json!({ "viewer": { "name": "Grace" } }),
                &Variables::new(),
            )
            .unwrap();
        let ids_after_second: Vec<_> = store.ids().cloned().collect();

        assert_eq!(ids_after_first, ids_after_second);
    }

    #[test]
    fn gaining_an_identity_folds_the_synthetic_record_forward() {
        let never = Writer::new(Arc::new(NeverIdentify), Arc::new(HashMap::new()));
        let with_id = writer_with_id_field();

        let selection_without_id = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(selection(vec![Selection::Field(FieldNode::new(
                "name",
            ))])),
        )]);
        let selection_with_id = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(selection(vec![
                Selection::Field(FieldNode::new("__typename")),
                Selection::Field(FieldNode::new("id")),
            ])),
        )]);

        let mut store = Store::new();
        never
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_without_id,
                &FragmentMap::new(),
                &json!({ "me": { "name": "Ada" } }),
                &Variables::new(),
            )
            .unwrap();

        with_id
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_with_id,
                &FragmentMap::new(),
                &json!({ "me": { "__typename": "User", "id": "1" } }),
                &Variables::new(),
            )
            .unwrap();

        let user = store.get(&EntityId::real("User", "1")).unwrap();
        let name_key = field_key(&FieldNode::new("name"), &Variables::new()).unwrap();
        assert_eq!(
            user.get(&name_key).unwrap().as_ref(),
            &StoreValue::Scalar(JsonValue::from("Ada"))
        );
    }

    #[test]
    fn regressing_from_a_real_to_a_synthetic_reference_is_rejected() {
        let with_id = writer_with_id_field();
        let never = Writer::new(Arc::new(NeverIdentify), Arc::new(HashMap::new()));
        let selection_set = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(selection(vec![
                Selection::Field(FieldNode::new("__typename")),
                Selection::Field(FieldNode::new("id")),
            ])),
        )]);
        let selection_without_id = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(selection(vec![Selection::Field(FieldNode::new(
                "name",
            ))])),
        )]);

        let mut store = Store::new();
        with_id
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &json!({ "me": { "__typename": "User", "id": "1" } }),
                &Variables::new(),
            )
            .unwrap();

        let result = never.write_result(
            &mut store,
            &[],
            ROOT_QUERY_ID,
            &selection_without_id,
            &FragmentMap::new(),
            &json!({ "me": { "name": "Ada" } }),
            &Variables::new(),
        );

        assert!(matches!(result, Err(CacheError::IdentityOverwrite { .. })));
    }

    #[test]
    fn identify_returning_a_dollar_prefixed_id_is_rejected() {
        let writer = Writer::new(
            Arc::new(|_: &JsonValue| Some("$not-allowed".to_owned())),
            Arc::new(HashMap::new()),
        );
        let mut store = Store::new();
        let selection_set = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(selection(vec![Selection::Field(FieldNode::new(
                "name",
            ))])),
        )]);

        let result = writer.write_result(
            &mut store,
            &[],
            ROOT_QUERY_ID,
            &selection_set,
            &FragmentMap::new(),
            &json!({ "me": { "name": "Ada" } }),
            &Variables::new(),
        );

        assert!(matches!(result, Err(CacheError::IdentityViolation { .. })));
    }

    #[test]
    fn inline_fragment_with_non_matching_type_condition_is_skipped() {
        let writer = Writer::new(Arc::new(NeverIdentify), Arc::new(HashMap::new()));
        let selection_set = selection(vec![
            Selection::Field(FieldNode::new("__typename")),
            Selection::InlineFragment(InlineFragmentNode {
                type_condition: Some(crate::document::Name::from("Dog")),
                selection_set: selection(vec![Selection::Field(FieldNode::new("bark"))]),
            }),
        ]);
        let mut store = Store::new();
        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &json!({ "__typename": "Cat", "bark": "should not be written" }),
                &Variables::new(),
            )
            .unwrap();

        let root = store.get(&EntityId::from(ROOT_QUERY_ID)).unwrap();
        let bark_key = field_key(&FieldNode::new("bark"), &Variables::new()).unwrap();
        assert!(root.get(&bark_key).is_none());
    }
}
