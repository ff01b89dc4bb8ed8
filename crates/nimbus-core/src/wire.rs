//! RPC call and reply bodies exchanged between clients and a provider.

use serde::{Deserialize, Serialize};

use crate::types::ItemMetadata;

/// One provider call with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum Call {
    Roots,
    List {
        item_id: String,
        page_token: String,
    },
    Lookup {
        parent_id: String,
        name: String,
    },
    Metadata {
        item_id: String,
    },
    CreateFolder {
        parent_id: String,
        name: String,
    },
    CreateFile {
        parent_id: String,
        name: String,
        size: i64,
        content_type: String,
        allow_overwrite: bool,
    },
    Update {
        item_id: String,
        size: i64,
        old_etag: String,
    },
    FinishUpload {
        upload_id: String,
    },
    CancelUpload {
        upload_id: String,
    },
    Download {
        item_id: String,
        match_etag: String,
    },
    FinishDownload {
        download_id: String,
    },
    CancelDownload {
        download_id: String,
    },
    Delete {
        item_id: String,
    },
    Move {
        item_id: String,
        new_parent_id: String,
        new_name: String,
    },
    Copy {
        item_id: String,
        new_parent_id: String,
        new_name: String,
    },
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Roots => "Roots",
            Call::List { .. } => "List",
            Call::Lookup { .. } => "Lookup",
            Call::Metadata { .. } => "Metadata",
            Call::CreateFolder { .. } => "CreateFolder",
            Call::CreateFile { .. } => "CreateFile",
            Call::Update { .. } => "Update",
            Call::FinishUpload { .. } => "FinishUpload",
            Call::CancelUpload { .. } => "CancelUpload",
            Call::Download { .. } => "Download",
            Call::FinishDownload { .. } => "FinishDownload",
            Call::CancelDownload { .. } => "CancelDownload",
            Call::Delete { .. } => "Delete",
            Call::Move { .. } => "Move",
            Call::Copy { .. } => "Copy",
        }
    }
}

/// Successful reply to a [`Call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ReplyBody {
    Items(Vec<ItemMetadata>),
    Page {
        items: Vec<ItemMetadata>,
        next_page_token: String,
    },
    Item(ItemMetadata),
    /// Upload or download id; the channel descriptor travels alongside.
    Transfer { id: String },
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_encoding_names_the_method() {
        let call = Call::CreateFile {
            parent_id: "/r".into(),
            name: "f".into(),
            size: 10,
            content_type: String::new(),
            allow_overwrite: false,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["method"], "CreateFile");
        assert_eq!(json["args"]["size"], 10);
        assert_eq!(call.method(), "CreateFile");

        let roots = serde_json::to_string(&Call::Roots).unwrap();
        assert_eq!(serde_json::from_str::<Call>(&roots).unwrap(), Call::Roots);
    }
}
