use chrono::{DateTime, Utc};
use nimbus_core::{Item, ItemType, MetadataValue, Result, StorageError, metadata};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Names starting with this prefix are reserved for staging files and are
/// never listed, copied or accepted from clients.
pub const TMP_PREFIX: &str = ".nimbus-tmp";

const DIRECTORY_CONTENT_TYPE: &str = "inode/directory";

pub(crate) fn is_reserved(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(TMP_PREFIX))
}

/// Accept `name` only if it is a single path component that is not reserved.
pub(crate) fn sanitize<'a>(method: &str, name: &'a str) -> Result<&'a str> {
    if name.contains('/') {
        return Err(StorageError::InvalidArgument(format!(
            "{method}: name \"{name}\" cannot contain a slash"
        )));
    }
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::InvalidArgument(format!(
            "{method}: invalid name: \"{name}\""
        )));
    }
    if name.starts_with(TMP_PREFIX) {
        return Err(StorageError::InvalidArgument(format!(
            "{method}: names beginning with \"{TMP_PREFIX}\" are reserved"
        )));
    }
    Ok(name)
}

pub(crate) fn io_error(method: &str, path: &Path, err: &io::Error) -> StorageError {
    let key = path.to_string_lossy();
    StorageError::from_io(err, &format!("{method}: \"{key}\""), &key)
}

pub(crate) fn id_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn mtime_nanos(meta: &Metadata) -> i64 {
    meta.mtime()
        .saturating_mul(1_000_000_000)
        .saturating_add(meta.mtime_nsec())
}

pub(crate) fn etag_of(method: &str, path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path).map_err(|e| io_error(method, path, &e))?;
    Ok(mtime_nanos(&meta).to_string())
}

fn iso_date(nanos: i64) -> String {
    let time = DateTime::<Utc>::from_timestamp(nanos.div_euclid(1_000_000_000), 0)
        .unwrap_or_default();
    metadata::format_timestamp(time)
}

/// Build the item for `path`, which must be a file or a directory.
pub(crate) fn make_item(root: &Path, method: &str, path: &Path) -> Result<Item> {
    let meta = std::fs::metadata(path).map_err(|e| io_error(method, path, &e))?;
    let id = id_of(path);
    let mtime = mtime_nanos(&meta);
    let mode = meta.permissions().mode();

    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut parent_ids = path.parent().map(id_of).into_iter().collect::<Vec<_>>();
    let mut md = BTreeMap::new();
    let (item_type, etag, writable, content_type) = if meta.is_file() {
        md.insert(
            metadata::SIZE_IN_BYTES.to_string(),
            MetadataValue::Int(i64::try_from(meta.len()).unwrap_or(i64::MAX)),
        );
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        (ItemType::File, mtime.to_string(), mode & 0o200 != 0, content_type)
    } else if meta.is_dir() {
        let item_type = if path == root {
            name = "/".to_string();
            parent_ids.clear();
            ItemType::Root
        } else {
            ItemType::Folder
        };
        let writable = mode & 0o300 == 0o300;
        (item_type, String::new(), writable, DIRECTORY_CONTENT_TYPE.to_string())
    } else {
        return Err(StorageError::not_exists(
            format!("{method}: \"{id}\" is neither a file nor a folder"),
            id,
        ));
    };

    md.insert(
        metadata::LAST_MODIFIED_TIME.to_string(),
        MetadataValue::Str(iso_date(mtime)),
    );
    md.insert(
        metadata::CONTENT_TYPE.to_string(),
        MetadataValue::Str(content_type),
    );
    md.insert(metadata::WRITABLE.to_string(), MetadataValue::Bool(writable));

    Ok(Item {
        item_id: id,
        parent_ids,
        name,
        etag,
        item_type,
        metadata: md,
    })
}

/// Copy a file or a directory tree, skipping reserved entries and anything
/// that is neither a file nor a directory.
pub(crate) fn copy_recursively(source: &Path, target: &Path) -> io::Result<()> {
    if is_reserved(source) {
        return Ok(());
    }
    let meta = std::fs::metadata(source)?;
    if meta.is_file() {
        std::fs::copy(source, target)?;
    } else if meta.is_dir() {
        std::fs::create_dir(target)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &target.join(entry.file_name()))?;
        }
    }
    Ok(())
}
