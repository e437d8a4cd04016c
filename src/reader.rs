//! The denormalizer: reassembles a response tree by walking a selection set against a store.
//!
//! Reading is deliberately view-agnostic: [`StoreView`] is the one interface the reader depends
//! on, and both a plain [`Store`] and a layered optimistic view (see
//! [`crate::optimistic::EffectiveView`]) implement it. The reader has no idea whether the data it
//! is looking at came from one store or three stacked diffs.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value as JsonValue;

use crate::document::FragmentMap;
use crate::document::Name;
use crate::document::Selection;
use crate::document::SelectionSet;
use crate::document::Variables;
use crate::error::CacheError;
use crate::field_key::field_key;
use crate::value::EntityId;
use crate::value::ListItem;
use crate::value::Store;
use crate::value::StoreValue;

/// The maximum fragment-spread nesting the reader will follow before concluding the fragment map
/// contains a cycle. Legitimate documents never come close to this; it exists purely as a
/// backstop against a hand-built [`FragmentMap`] that spreads a fragment into itself.
const MAX_FRAGMENT_DEPTH: usize = 64;

/// One step of a path into a response tree, used to report where data was missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

pub type Path = Vec<PathSegment>;

/// The result of reading a selection set out of a store.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadOutcome {
    /// The reassembled response tree. Always an object (or `null` if the root entity itself is
    /// absent from the store).
    pub data: JsonValue,
    /// Every path at which the store had nothing for a selected field. Empty iff `complete`.
    pub missing: Vec<Path>,
    /// Whether every selected field resolved to stored data. A caller typically treats an
    /// incomplete read as a cache miss even though `data` is populated as far as it could go.
    pub complete: bool,
}

/// Anything the reader can pull a single field's value from, keyed by entity id. Implemented by
/// [`Store`] directly and by [`crate::optimistic::EffectiveView`] for layered reads.
pub trait StoreView {
    fn get_field(&self, entity_id: &EntityId, key: &crate::field_key::FieldKey) -> Option<StoreValue>;
    fn has_entity(&self, entity_id: &EntityId) -> bool;
}

impl StoreView for Store {
    fn get_field(&self, entity_id: &EntityId, key: &crate::field_key::FieldKey) -> Option<StoreValue> {
        self.get(entity_id).and_then(|object| object.get(key)).map(|value| value.as_ref().clone())
    }

    fn has_entity(&self, entity_id: &EntityId) -> bool {
        self.contains(entity_id)
    }
}

/// Denormalizes response trees out of a [`StoreView`].
pub struct Reader {
    possible_types: Arc<HashMap<String, Vec<String>>>,
}

impl Reader {
    pub const fn new(possible_types: Arc<HashMap<String, Vec<String>>>) -> Self {
        Self { possible_types }
    }

    /// Reads a full operation's selection set, rooted at `root_id` (see
    /// [`crate::writer::ROOT_QUERY_ID`]/[`crate::writer::ROOT_MUTATION_ID`]).
    #[tracing::instrument(skip(self, view, selection_set, fragments, variables))]
    pub fn read(
        &self,
        view: &dyn StoreView,
        root_id: &str,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
    ) -> Result<ReadOutcome, CacheError> {
        self.read_entity(view, &EntityId::from(root_id), selection_set, fragments, variables)
    }

    /// Reads a selection set directly against an already-identified entity — the counterpart to
    /// [`crate::writer::Writer::write_fragment`].
    pub fn read_entity(
        &self,
        view: &dyn StoreView,
        entity_id: &EntityId,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
    ) -> Result<ReadOutcome, CacheError> {
        if !view.has_entity(entity_id) {
            return Ok(ReadOutcome {
                data: JsonValue::Null,
                missing: vec![Vec::new()],
                complete: false,
            });
        }

        let mut missing = Vec::new();
        let mut expanding = HashSet::new();
        let object = self.read_selection_set(
            view,
            entity_id,
            selection_set,
            fragments,
            variables,
            &mut Vec::new(),
            &mut missing,
            &mut expanding,
            0,
        )?;

        Ok(ReadOutcome {
            complete: missing.is_empty(),
            missing,
            data: JsonValue::Object(object),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn read_selection_set(
        &self,
        view: &dyn StoreView,
        entity_id: &EntityId,
        selection_set: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
        path: &mut Path,
        missing: &mut Vec<Path>,
        expanding: &mut HashSet<Name>,
        depth: usize,
    ) -> Result<JsonMap<serde_json_bytes::ByteString, JsonValue>, CacheError> {
        if depth > MAX_FRAGMENT_DEPTH {
            crate::bail!("fragment nesting exceeded {MAX_FRAGMENT_DEPTH} levels; likely a cycle");
        }

        let mut out = JsonMap::new();

        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    let key = field_key(field, variables)?;
                    path.push(PathSegment::Field(field.response_key().to_string()));

                    let value = view.get_field(entity_id, &key);
                    match value {
                        None => {
                            missing.push(path.clone());
                        }
                        Some(StoreValue::Scalar(scalar)) => {
                            out.insert(field.response_key().as_ref(), scalar);
                        }
                        Some(StoreValue::JsonBlob(blob)) => {
                            out.insert(field.response_key().as_ref(), blob);
                        }
                        Some(StoreValue::Reference(child_id, _generated)) => {
                            let child_selection = field.selection_set.as_ref().ok_or_else(|| {
                                crate::internal_error!(
                                    "field {} stored a reference but has no sub-selection",
                                    field.name
                                )
                            })?;
                            let rendered = self.read_reference(
                                view,
                                &child_id,
                                child_selection,
                                fragments,
                                variables,
                                path,
                                missing,
                                expanding,
                                depth,
                            )?;
                            out.insert(field.response_key().as_ref(), rendered);
                        }
                        Some(StoreValue::ReferenceList(items)) => {
                            let child_selection = field.selection_set.as_ref().ok_or_else(|| {
                                crate::internal_error!(
                                    "field {} stored a reference list but has no sub-selection",
                                    field.name
                                )
                            })?;
                            let rendered = self.read_list(
                                view,
                                &items,
                                child_selection,
                                fragments,
                                variables,
                                path,
                                missing,
                                expanding,
                                depth,
                            )?;
                            out.insert(field.response_key().as_ref(), rendered);
                        }
                    }

                    path.pop();
                }
                Selection::InlineFragment(inline) => {
                    if self.applies(inline.type_condition.as_deref(), view, entity_id) {
                        let nested = self.read_selection_set(
                            view,
                            entity_id,
                            &inline.selection_set,
                            fragments,
                            variables,
                            path,
                            missing,
                            expanding,
                            depth,
                        )?;
                        out.extend(nested);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let definition = fragments.get(&spread.fragment_name).ok_or_else(|| CacheError::MissingFragment {
                        name: spread.fragment_name.to_string(),
                    })?;
                    if !expanding.insert(spread.fragment_name.clone()) {
                        crate::bail!("fragment \"{}\" spreads itself", spread.fragment_name);
                    }
                    let applies = self.applies(Some(&definition.type_condition), view, entity_id);
                    let result = if applies {
                        self.read_selection_set(
                            view,
                            entity_id,
                            &definition.selection_set,
                            fragments,
                            variables,
                            path,
                            missing,
                            expanding,
                            depth + 1,
                        )
                    } else {
                        Ok(JsonMap::new())
                    };
                    expanding.remove(&spread.fragment_name);
                    out.extend(result?);
                }
            }
        }

        Ok(out)
    }

    /// Whether a type condition applies, given the entity's stored `__typename` field (if any was
    /// selected and written). Mirrors [`crate::writer::Writer::applies`]'s conservative stance:
    /// an unknown typename never excludes a fragment.
    fn applies(&self, type_condition: Option<&str>, view: &dyn StoreView, entity_id: &EntityId) -> bool {
        let Some(condition) = type_condition else {
            return true;
        };
        let typename_key = match field_key(
            &crate::document::FieldNode::new("__typename"),
            &Variables::new(),
        ) {
            Ok(key) => key,
            Err(_) => return true,
        };
        let Some(StoreValue::Scalar(JsonValue::String(typename))) = view.get_field(entity_id, &typename_key) else {
            return true;
        };
        if typename.as_str() == condition {
            return true;
        }
        self.possible_types
            .get(condition)
            .is_some_and(|members| members.iter().any(|member| member == typename.as_str()))
    }

    #[allow(clippy::too_many_arguments)]
    fn read_reference(
        &self,
        view: &dyn StoreView,
        child_id: &EntityId,
        child_selection: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
        path: &mut Path,
        missing: &mut Vec<Path>,
        expanding: &mut HashSet<Name>,
        depth: usize,
    ) -> Result<JsonValue, CacheError> {
        if !view.has_entity(child_id) {
            missing.push(path.clone());
            return Ok(JsonValue::Null);
        }
        let object = self.read_selection_set(
            view,
            child_id,
            child_selection,
            fragments,
            variables,
            path,
            missing,
            expanding,
            depth,
        )?;
        Ok(JsonValue::Object(object))
    }

    #[allow(clippy::too_many_arguments)]
    fn read_list(
        &self,
        view: &dyn StoreView,
        items: &[ListItem],
        child_selection: &SelectionSet,
        fragments: &FragmentMap,
        variables: &Variables,
        path: &mut Path,
        missing: &mut Vec<Path>,
        expanding: &mut HashSet<Name>,
        depth: usize,
    ) -> Result<JsonValue, CacheError> {
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            path.push(PathSegment::Index(index));
            let rendered = match item {
                ListItem::Null => JsonValue::Null,
                ListItem::Scalar(value) => value.clone(),
                ListItem::Reference(child_id, _generated) => self.read_reference(
                    view,
                    child_id,
                    child_selection,
                    fragments,
                    variables,
                    path,
                    missing,
                    expanding,
                    depth,
                )?,
                ListItem::List(nested) => self.read_list(
                    view,
                    nested,
                    child_selection,
                    fragments,
                    variables,
                    path,
                    missing,
                    expanding,
                    depth,
                )?,
            };
            out.push(rendered);
            path.pop();
        }
        Ok(JsonValue::Array(out))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use serde_json_bytes::json;

    use super::*;
    use crate::document::FieldNode;
    use crate::writer::NeverIdentify;
    use crate::writer::ROOT_QUERY_ID;
    use crate::writer::Writer;

    fn selection(fields: Vec<Selection>) -> SelectionSet {
        SelectionSet::new(fields)
    }

    #[test]
    fn reads_back_what_was_written() {
        let writer = Writer::new(StdArc::new(NeverIdentify), StdArc::new(HashMap::new()));
        let reader = Reader::new(StdArc::new(HashMap::new()));

        let selection_set = selection(vec![Selection::Field(FieldNode::new("name"))]);
        let mut store = Store::new();
        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &json!({ "name": "Ada" }),
                &Variables::new(),
            )
            .unwrap();

        let outcome = reader
            .read(&store, ROOT_QUERY_ID, &selection_set, &FragmentMap::new(), &Variables::new())
            .unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.data, json!({ "name": "Ada" }));
    }

    #[test]
    fn missing_field_is_reported_and_absent_from_data() {
        let reader = Reader::new(StdArc::new(HashMap::new()));
        let mut store = Store::new();
        store.entry(EntityId::from(ROOT_QUERY_ID));
        let selection_set = selection(vec![Selection::Field(FieldNode::new("name"))]);

        let outcome = reader
            .read(&store, ROOT_QUERY_ID, &selection_set, &FragmentMap::new(), &Variables::new())
            .unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.missing, vec![vec![PathSegment::Field("name".to_owned())]]);
        assert_eq!(outcome.data, json!({}));
    }

    #[test]
    fn dangling_reference_reads_as_null_with_a_missing_path() {
        let identify = StdArc::new(|object: &JsonValue| -> Option<String> {
            let typename = object.get("__typename")?.as_str()?;
            let id = object.get("id")?.as_str()?;
            Some(format!("{typename}:{id}"))
        });
        let writer = Writer::new(identify, StdArc::new(HashMap::new()));
        let reader = Reader::new(StdArc::new(HashMap::new()));

        let child_selection = selection(vec![Selection::Field(FieldNode::new("name"))]);
        let selection_set = selection(vec![Selection::Field(
            FieldNode::new("me").with_selection_set(child_selection),
        )]);

        let mut store = Store::new();
        writer
            .write_result(
                &mut store,
                &[],
                ROOT_QUERY_ID,
                &selection_set,
                &FragmentMap::new(),
                &json!({ "me": { "__typename": "User", "id": "1", "name": "Ada" } }),
                &Variables::new(),
            )
            .unwrap();

        store.remove(&EntityId::real("User", "1"));

        let outcome = reader
            .read(&store, ROOT_QUERY_ID, &selection_set, &FragmentMap::new(), &Variables::new())
            .unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.data, json!({ "me": null }));
        assert_eq!(
            outcome.missing,
            vec![vec![PathSegment::Field("me".to_owned())]]
        );
    }

    #[test]
    fn self_spreading_fragment_is_rejected_instead_of_looping() {
        let reader = Reader::new(StdArc::new(HashMap::new()));
        let mut fragments = FragmentMap::new();
        let cyclical_name: Name = Name::from("Cyclical");
        fragments.insert(
            cyclical_name.clone(),
            StdArc::new(crate::document::FragmentDefinition {
                name: cyclical_name.clone(),
                type_condition: Name::from("Query"),
                selection_set: selection(vec![Selection::FragmentSpread(
                    crate::document::FragmentSpreadNode {
                        fragment_name: cyclical_name.clone(),
                    },
                )]),
            }),
        );
        let selection_set = selection(vec![Selection::FragmentSpread(
            crate::document::FragmentSpreadNode {
                fragment_name: cyclical_name,
            },
        )]);

        let mut store = Store::new();
        store.entry(EntityId::from(ROOT_QUERY_ID));

        let result = reader.read(&store, ROOT_QUERY_ID, &selection_set, &fragments, &Variables::new());
        assert!(result.is_err());
    }
}
