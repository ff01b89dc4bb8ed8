use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::metadata;

/// Kind of an item in a provider's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
    Root,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::File => write!(f, "file"),
            ItemType::Folder => write!(f, "folder"),
            ItemType::Root => write!(f, "root"),
        }
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ItemType::File),
            "folder" => Ok(ItemType::Folder),
            "root" => Ok(ItemType::Root),
            other => Err(format!("unknown item type: {other}")),
        }
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl MetadataValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Str(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Str(v.to_string())
    }
}

/// Immutable snapshot of a file, folder or root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub item_id: String,
    pub parent_ids: Vec<String>,
    pub name: String,
    pub etag: String,
    pub item_type: ItemType,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl Item {
    pub fn size_in_bytes(&self) -> Option<i64> {
        self.metadata
            .get(metadata::SIZE_IN_BYTES)
            .and_then(MetadataValue::as_int)
    }

    pub fn last_modified_time(&self) -> Option<&str> {
        self.metadata
            .get(metadata::LAST_MODIFIED_TIME)
            .and_then(MetadataValue::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.metadata
            .get(metadata::CONTENT_TYPE)
            .and_then(MetadataValue::as_str)
    }
}

/// Item envelope as it travels in RPC replies. Clients validate it before
/// turning it into an [`Item`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub item_id: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub etag: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<&Item> for ItemMetadata {
    fn from(item: &Item) -> Self {
        let metadata = item
            .metadata
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    MetadataValue::Bool(b) => serde_json::Value::Bool(*b),
                    MetadataValue::Int(i) => serde_json::Value::from(*i),
                    MetadataValue::Str(s) => serde_json::Value::String(s.clone()),
                };
                (k.clone(), value)
            })
            .collect();
        Self {
            item_id: item.item_id.clone(),
            parent_ids: item.parent_ids.clone(),
            name: item.name.clone(),
            etag: item.etag.clone(),
            item_type: item.item_type,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_type_roundtrip() {
        for t in [ItemType::File, ItemType::Folder, ItemType::Root] {
            assert_eq!(t.to_string().parse::<ItemType>().unwrap(), t);
        }
        assert!("symlink".parse::<ItemType>().is_err());
    }

    #[test]
    fn envelope_uses_type_field() {
        let mut item = Item {
            item_id: "/r/f".into(),
            parent_ids: vec!["/r".into()],
            name: "f".into(),
            etag: "17".into(),
            item_type: ItemType::File,
            metadata: BTreeMap::new(),
        };
        item.metadata
            .insert(metadata::SIZE_IN_BYTES.into(), MetadataValue::Int(3));
        let json = serde_json::to_value(ItemMetadata::from(&item)).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["metadata"]["size_in_bytes"], 3);
        assert_eq!(item.size_in_bytes(), Some(3));
    }
}
