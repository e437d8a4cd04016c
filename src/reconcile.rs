//! Folding a synthetic entity's previously-written fields into the real entity that supersedes
//! it once an object gains an identity.
//!
//! An object is often written once before its `identify` callback can name it (a nested object
//! whose `id` field simply wasn't in that particular selection) and again later, at the same
//! path, once it can. The two writes must land on the same logical entity in the end, not leave
//! an orphaned synthetic record sitting beside the real one holding data nothing ever reads
//! again.
//!
//! A field the current write re-visits is reconciled by the writer's own recursion (it calls back
//! into this module for that nested field too). This module only has to handle fields the
//! synthetic object carries but the new write doesn't touch at all: those are copied over
//! verbatim, and if a carried field is itself a reference to another synthetic entity, that
//! sub-entity is re-rooted under the real parent's own namespace and folded recursively, so it
//! isn't left pinned to a path key built off an identity that no longer exists.

use crate::field_key::FieldKey;
use crate::value::EntityId;
use crate::value::Store;
use crate::value::StoreValue;

/// Folds `synthetic_id`'s fields (if any such entity exists, in `target` or one of `lower`) into
/// `real_id`, removing the synthetic entity from `target` (lower layers are read-only here: an
/// optimistic diff only ever owns its own synthetic placeholders, never a base layer's).
///
/// Fields already present under `real_id` are left alone — the caller always re-applies the
/// current write's fields over `real_id` immediately after this call, so the synthetic values
/// that matter are only the ones this write *doesn't* touch.
pub fn fold_synthetic_into_real(target: &mut Store, lower: &[&Store], synthetic_id: &EntityId, real_id: &EntityId) {
    fold(target, lower, synthetic_id, real_id);
}

fn fold(target: &mut Store, lower: &[&Store], synthetic_id: &EntityId, real_id: &EntityId) {
    debug_assert!(synthetic_id.is_synthetic());

    let synthetic_object = target
        .remove(synthetic_id)
        .or_else(|| lower.iter().find_map(|layer| layer.get(synthetic_id).cloned()));

    let Some(synthetic_object) = synthetic_object else {
        return;
    };

    let mut carried_references = Vec::new();
    {
        let real_entry = target.entry(real_id.clone());
        for (key, value) in synthetic_object.iter() {
            if real_entry.get(key).is_some() {
                continue;
            }
            real_entry.set(key.clone(), value.clone());
            if let StoreValue::Reference(child_id, true) = value.as_ref() {
                carried_references.push((key.clone(), child_id.clone()));
            }
        }
    }

    for (key, child_id) in carried_references {
        let rerooted = child_synthetic_id(real_id, &key);
        if rerooted == child_id {
            continue;
        }
        fold(target, lower, &child_id, &rerooted);
        target
            .entry(real_id.clone())
            .set(key, std::sync::Arc::new(StoreValue::Reference(rerooted, true)));
    }
}

/// Builds the synthetic id a carried-over field's nested object would get if it were written
/// fresh under `parent`, stripping any `$` `parent` already carries so nesting never stacks a
/// second prefix on top of the first.
fn child_synthetic_id(parent: &EntityId, key: &FieldKey) -> EntityId {
    let parent_path = parent.as_str().strip_prefix('$').unwrap_or(parent.as_str());
    EntityId::synthetic(format!("{parent_path}.{key}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json_bytes::Value as JsonValue;

    use super::*;
    use crate::value::StoreValue;

    fn key(name: &str) -> FieldKey {
        crate::field_key::field_key(
            &crate::document::FieldNode::new(name),
            &crate::document::Variables::new(),
        )
        .unwrap()
    }

    #[test]
    fn fields_not_rewritten_survive_the_fold() {
        let mut target = Store::new();
        let synthetic = EntityId::synthetic("Query.me");
        target
            .entry(synthetic.clone())
            .set(key("name"), Arc::new(StoreValue::Scalar(JsonValue::from("Ada"))));

        let real = EntityId::real("User", "1");
        fold_synthetic_into_real(&mut target, &[], &synthetic, &real);

        assert!(!target.contains(&synthetic));
        let merged = target.get(&real).unwrap();
        assert_eq!(
            merged.get(&key("name")).unwrap().as_ref(),
            &StoreValue::Scalar(JsonValue::from("Ada"))
        );
    }

    #[test]
    fn fields_already_present_on_the_real_entity_are_not_clobbered() {
        let mut target = Store::new();
        let synthetic = EntityId::synthetic("Query.me");
        target
            .entry(synthetic.clone())
            .set(key("name"), Arc::new(StoreValue::Scalar(JsonValue::from("stale"))));

        let real = EntityId::real("User", "1");
        target
            .entry(real.clone())
            .set(key("name"), Arc::new(StoreValue::Scalar(JsonValue::from("fresh"))));

        fold_synthetic_into_real(&mut target, &[], &synthetic, &real);

        let merged = target.get(&real).unwrap();
        assert_eq!(
            merged.get(&key("name")).unwrap().as_ref(),
            &StoreValue::Scalar(JsonValue::from("fresh"))
        );
    }

    #[test]
    fn missing_synthetic_entity_is_a_no_op() {
        let mut target = Store::new();
        let real = EntityId::real("User", "1");
        fold_synthetic_into_real(&mut target, &[], &EntityId::synthetic("Query.me"), &real);
        assert!(!target.contains(&real));
    }

    #[test]
    fn a_carried_over_reference_to_a_synthetic_child_is_rerooted_and_folded() {
        let mut target = Store::new();
        let synthetic_child = EntityId::synthetic("Query.me.pet");
        target
            .entry(synthetic_child.clone())
            .set(key("name"), Arc::new(StoreValue::Scalar(JsonValue::from("Rex"))));

        let synthetic_parent = EntityId::synthetic("Query.me");
        target
            .entry(synthetic_parent.clone())
            .set(key("pet"), Arc::new(StoreValue::Reference(synthetic_child.clone(), true)));

        let real = EntityId::real("User", "1");
        fold_synthetic_into_real(&mut target, &[], &synthetic_parent, &real);

        assert!(!target.contains(&synthetic_child));
        let rerooted = child_synthetic_id(&real, &key("pet"));
        let pet = target.get(&rerooted).expect("pet entity re-rooted under the real parent");
        assert_eq!(
            pet.get(&key("name")).unwrap().as_ref(),
            &StoreValue::Scalar(JsonValue::from("Rex"))
        );

        let merged = target.get(&real).unwrap();
        assert_eq!(
            merged.get(&key("pet")).unwrap().as_ref(),
            &StoreValue::Reference(rerooted, true)
        );
    }

    #[test]
    fn a_carried_over_real_reference_is_copied_without_rerooting() {
        let mut target = Store::new();
        let pet = EntityId::real("Pet", "9");
        target
            .entry(pet.clone())
            .set(key("name"), Arc::new(StoreValue::Scalar(JsonValue::from("Rex"))));

        let synthetic_parent = EntityId::synthetic("Query.me");
        target
            .entry(synthetic_parent.clone())
            .set(key("pet"), Arc::new(StoreValue::Reference(pet.clone(), false)));

        let real = EntityId::real("User", "1");
        fold_synthetic_into_real(&mut target, &[], &synthetic_parent, &real);

        let merged = target.get(&real).unwrap();
        assert_eq!(
            merged.get(&key("pet")).unwrap().as_ref(),
            &StoreValue::Reference(pet, false)
        );
    }
}
