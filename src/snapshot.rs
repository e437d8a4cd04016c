//! Extracting a [`Store`] to a plain JSON value and restoring one from it.
//!
//! This is the cache's serialization boundary, not a persistence layer: what a caller does with
//! the extracted [`JsonValue`] (write it to disk, ship it to a different process, hold onto it in
//! memory) is entirely up to them. Every non-primitive value is tagged on the wire so decoding
//! never has to guess a shape from context: a reference is `{"type":"id","id":"<id>","generated":
//! <bool>}` and an opaque blob is `{"type":"json","json":<value>}`. Primitive scalars (null, bool,
//! number, string) and arrays of them serialize as themselves — there's nothing to disambiguate.
//! Two independent encoders given the same store therefore produce byte-identical output.

use serde_json_bytes::Value as JsonValue;
use serde_json_bytes::json;

use crate::error::CacheError;
use crate::field_key::FieldKey;
use crate::value::EntityId;
use crate::value::ListItem;
use crate::value::Store;
use crate::value::StoreValue;

const TYPE_KEY: &str = "type";
const ID_TYPE: &str = "id";
const JSON_TYPE: &str = "json";

/// Serializes a store to a plain JSON value: `{ entityId: { fieldKey: value } }`.
pub fn extract(store: &Store) -> JsonValue {
    let mut entities = serde_json_bytes::Map::new();
    for (entity_id, object) in store.iter() {
        let mut fields = serde_json_bytes::Map::new();
        for (key, value) in object.iter() {
            fields.insert(key.as_ref(), value_to_wire(value));
        }
        entities.insert(entity_id.as_str(), JsonValue::Object(fields));
    }
    JsonValue::Object(entities)
}

/// Deserializes a store from a value produced by [`extract`].
pub fn restore(wire: &JsonValue) -> Result<Store, CacheError> {
    let JsonValue::Object(entities) = wire else {
        crate::bail!("a cache snapshot must be a JSON object, got {wire:?}");
    };

    let mut store = Store::new();
    for (entity_id, fields) in entities.iter() {
        let JsonValue::Object(fields) = fields else {
            crate::bail!("entity \"{entity_id}\" in a cache snapshot must be a JSON object");
        };
        let entry = store.entry(EntityId::from(entity_id.as_str()));
        for (key, value) in fields.iter() {
            entry.set(
                FieldKey::from_encoded(key.as_str()),
                std::sync::Arc::new(wire_to_value(value)?),
            );
        }
    }
    Ok(store)
}

fn value_to_wire(value: &StoreValue) -> JsonValue {
    match value {
        StoreValue::Scalar(scalar) => scalar.clone(),
        StoreValue::JsonBlob(blob) => blob_wire(blob),
        StoreValue::Reference(id, generated) => reference_wire(id, *generated),
        StoreValue::ReferenceList(items) => JsonValue::Array(items.iter().map(list_item_to_wire).collect()),
    }
}

fn list_item_to_wire(item: &ListItem) -> JsonValue {
    match item {
        ListItem::Null => JsonValue::Null,
        ListItem::Scalar(value) => value.clone(),
        ListItem::Reference(id, generated) => reference_wire(id, *generated),
        ListItem::List(nested) => JsonValue::Array(nested.iter().map(list_item_to_wire).collect()),
    }
}

fn reference_wire(id: &EntityId, generated: bool) -> JsonValue {
    json!({ TYPE_KEY: ID_TYPE, "id": id.as_str(), "generated": generated })
}

fn blob_wire(blob: &JsonValue) -> JsonValue {
    json!({ TYPE_KEY: JSON_TYPE, "json": blob.clone() })
}

fn wire_to_value(wire: &JsonValue) -> Result<StoreValue, CacheError> {
    match tagged(wire)? {
        Tagged::Id { id, generated } => Ok(StoreValue::Reference(id, generated)),
        Tagged::Json(JsonValue::Object(fields)) => Ok(StoreValue::JsonBlob(JsonValue::Object(fields))),
        Tagged::Json(other) => Ok(StoreValue::Scalar(other)),
        Tagged::Untagged(JsonValue::Array(items)) => Ok(StoreValue::ReferenceList(
            items.iter().map(wire_to_list_item).collect::<Result<_, _>>()?,
        )),
        Tagged::Untagged(other) => Ok(StoreValue::Scalar(other)),
    }
}

fn wire_to_list_item(wire: &JsonValue) -> Result<ListItem, CacheError> {
    match tagged(wire)? {
        Tagged::Id { id, generated } => Ok(ListItem::Reference(id, generated)),
        Tagged::Json(blob) => Ok(ListItem::Scalar(blob)),
        Tagged::Untagged(JsonValue::Null) => Ok(ListItem::Null),
        Tagged::Untagged(JsonValue::Array(nested)) => Ok(ListItem::List(
            nested.iter().map(wire_to_list_item).collect::<Result<_, _>>()?,
        )),
        Tagged::Untagged(other) => Ok(ListItem::Scalar(other)),
    }
}

enum Tagged {
    Id { id: EntityId, generated: bool },
    Json(JsonValue),
    Untagged(JsonValue),
}

/// Recognizes a `{type:"id",...}`/`{type:"json",...}` wire object; anything else (including a
/// plain JSON object with no `type` field, which cannot occur in a snapshot this crate produced
/// but might in a hand-edited one) passes through untagged and ends up an error or a bare scalar
/// depending on where it's used.
fn tagged(wire: &JsonValue) -> Result<Tagged, CacheError> {
    let JsonValue::Object(fields) = wire else {
        return Ok(Tagged::Untagged(wire.clone()));
    };
    let Some(type_tag) = fields.get(TYPE_KEY).and_then(|v| v.as_str()) else {
        return Ok(Tagged::Untagged(wire.clone()));
    };
    match type_tag {
        ID_TYPE => {
            let id = fields
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| crate::internal_error!("a \"{ID_TYPE}\"-tagged snapshot value must carry a string \"id\""))?;
            let generated = fields.get("generated").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok(Tagged::Id {
                id: EntityId::from(id),
                generated,
            })
        }
        JSON_TYPE => {
            let json = fields
                .get("json")
                .cloned()
                .ok_or_else(|| crate::internal_error!("a \"{JSON_TYPE}\"-tagged snapshot value must carry a \"json\" field"))?;
            Ok(Tagged::Json(json))
        }
        other => crate::bail!("unknown snapshot value tag \"{other}\""),
    }
}
