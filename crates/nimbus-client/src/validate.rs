use nimbus_core::metadata::{self, MetadataType};
use nimbus_core::{Item, ItemMetadata, ItemType, MetadataValue, Result, StorageError};
use serde_json::Value;
use std::collections::BTreeMap;

/// Check an item envelope received from a provider and turn it into an
/// [`Item`]. Every violation is reported as `LocalComms`.
pub(crate) fn validate(method: &str, md: ItemMetadata) -> Result<Item> {
    let invalid = |what: String| {
        StorageError::LocalComms(format!(
            "{method}: received invalid metadata from provider: {what}"
        ))
    };

    if md.item_id.is_empty() {
        return Err(invalid("item_id cannot be empty".into()));
    }
    if md.item_type == ItemType::Root {
        if !md.parent_ids.is_empty() {
            return Err(invalid("parent_ids of root must be empty".into()));
        }
    } else {
        if md.parent_ids.is_empty() {
            return Err(invalid(
                "file or folder must have at least one parent ID".into(),
            ));
        }
        if md.parent_ids.iter().any(String::is_empty) {
            return Err(invalid("parent_id of file or folder cannot be empty".into()));
        }
        if md.name.is_empty() {
            return Err(invalid("name cannot be empty".into()));
        }
    }
    if md.item_type == ItemType::File && md.etag.is_empty() {
        return Err(invalid("etag of a file cannot be empty".into()));
    }

    let mut values = BTreeMap::new();
    for (key, value) in md.metadata {
        match metadata::known_type(&key) {
            Some(ty) => {
                let value = typed_value(ty, &value).ok_or_else(|| {
                    invalid(format!("value of \"{key}\" has the wrong type: {value}"))
                })?;
                values.insert(key, value);
            }
            None => {
                tracing::warn!("{method}: unknown metadata key \"{key}\" from provider");
                if let Some(value) = untyped_value(value) {
                    values.insert(key, value);
                }
            }
        }
    }

    if md.item_type == ItemType::File {
        for key in [metadata::SIZE_IN_BYTES, metadata::LAST_MODIFIED_TIME] {
            if !values.contains_key(key) {
                return Err(invalid(format!(
                    "missing key \"{key}\" in metadata for \"{}\"",
                    md.item_id
                )));
            }
        }
    }

    Ok(Item {
        item_id: md.item_id,
        parent_ids: md.parent_ids,
        name: md.name,
        etag: md.etag,
        item_type: md.item_type,
        metadata: values,
    })
}

fn typed_value(ty: MetadataType, value: &Value) -> Option<MetadataValue> {
    match ty {
        MetadataType::NonNegativeInt64 => value
            .as_i64()
            .filter(|n| *n >= 0)
            .map(MetadataValue::Int),
        MetadataType::Iso8601DateTime => value
            .as_str()
            .filter(|s| metadata::parse_timestamp(s).is_some())
            .map(MetadataValue::from),
        MetadataType::String => value.as_str().map(MetadataValue::from),
        MetadataType::Boolean => value.as_bool().map(MetadataValue::Bool),
    }
}

fn untyped_value(value: Value) -> Option<MetadataValue> {
    match value {
        Value::Bool(b) => Some(MetadataValue::Bool(b)),
        Value::String(s) => Some(MetadataValue::Str(s)),
        Value::Number(n) => n.as_i64().map(MetadataValue::Int),
        _ => None,
    }
}
