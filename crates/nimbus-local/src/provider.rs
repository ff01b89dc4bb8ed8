use async_trait::async_trait;
use nimbus_core::config::LocalSettings;
use nimbus_core::{Item, Result, StorageError};
use nimbus_provider::{Context, DownloadSource, Provider, UploadSink};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::download::LocalDownload;
use crate::fsutil::{
    TMP_PREFIX, copy_recursively, etag_of, id_of, io_error, is_reserved, make_item, sanitize,
};
use crate::upload::{LocalUpload, Publish};

/// Environment variable naming an existing directory to serve instead of
/// the configured root.
pub const ROOT_ENV: &str = "NIMBUS_LOCAL_PROVIDER_ROOT";

/// Serves the directory tree below `root`.
pub struct LocalProvider {
    root: PathBuf,
    page_size: usize,
}

impl LocalProvider {
    /// Serve `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|e| io_error("new()", root, &e))?;
        if !canonical.is_dir() {
            return Err(StorageError::InvalidArgument(format!(
                "new(): \"{}\" is not a directory",
                root.display()
            )));
        }
        tracing::info!("Local: serving {}", canonical.display());
        Ok(Self {
            root: canonical,
            page_size: page_size.max(1),
        })
    }

    /// Pick the root from the environment, then the settings, then the
    /// per-user data directory.
    pub fn from_settings(settings: &LocalSettings) -> Result<Self> {
        let env_root = std::env::var(ROOT_ENV).ok();
        let root = resolve_root(env_root.as_deref(), settings)?;
        Self::new(root, settings.page_size)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonicalize `id` and make sure it names the root or something below
    /// it. Ids that only reach the right place through `..` or symlinks are
    /// rejected.
    fn check_id(&self, method: &str, id: &str) -> Result<PathBuf> {
        let path = Path::new(id);
        let canonical = std::fs::canonicalize(path).map_err(|e| io_error(method, path, &e))?;
        if canonical.as_os_str() != OsStr::new(id) || !canonical.starts_with(&self.root) {
            return Err(StorageError::InvalidArgument(format!(
                "{method}: invalid id: \"{id}\""
            )));
        }
        Ok(canonical)
    }

    fn item(&self, method: &str, path: &Path) -> Result<Item> {
        make_item(&self.root, method, path)
    }

    fn child(&self, method: &str, parent_id: &str, name: &str) -> Result<PathBuf> {
        let parent = self.check_id(method, parent_id)?;
        Ok(parent.join(sanitize(method, name)?))
    }
}

/// Root selection for [`LocalProvider::from_settings`], with the
/// environment value passed in.
pub(crate) fn resolve_root(env_root: Option<&str>, settings: &LocalSettings) -> Result<PathBuf> {
    if let Some(dir) = env_root.filter(|d| !d.is_empty()) {
        if !Path::new(dir).is_dir() {
            return Err(StorageError::InvalidArgument(format!(
                "environment variable {ROOT_ENV} must denote an existing directory"
            )));
        }
        return Ok(PathBuf::from(dir));
    }
    let root = match &settings.root {
        Some(root) => PathBuf::from(root),
        None => dirs::data_dir()
            .map(|d| d.join("nimbus").join("local"))
            .ok_or_else(|| {
                StorageError::InvalidArgument("cannot determine the data directory".to_string())
            })?,
    };
    std::fs::create_dir_all(&root).map_err(|e| io_error("new()", &root, &e))?;
    Ok(root)
}

fn exists_error(method: &str, path: &Path, name: &str) -> StorageError {
    let id = id_of(path);
    StorageError::exists(format!("{method}: \"{id}\" exists already"), id, name)
}

fn parse_page_token(method: &str, token: &str) -> Result<usize> {
    if token.is_empty() {
        return Ok(0);
    }
    token.parse().map_err(|_| {
        StorageError::InvalidArgument(format!("{method}: invalid page token \"{token}\""))
    })
}

#[async_trait]
impl Provider for LocalProvider {
    async fn roots(&self, _ctx: &Context) -> Result<Vec<Item>> {
        Ok(vec![self.item("roots()", &self.root)?])
    }

    async fn list(
        &self,
        item_id: &str,
        page_token: &str,
        _ctx: &Context,
    ) -> Result<(Vec<Item>, String)> {
        const METHOD: &str = "list()";
        let dir = self.check_id(METHOD, item_id)?;
        if !dir.is_dir() {
            return Err(StorageError::Logic(format!(
                "{METHOD}: \"{item_id}\" is not a folder"
            )));
        }
        let offset = parse_page_token(METHOD, page_token)?;

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| io_error(METHOD, &dir, &e))? {
            let entry = entry.map_err(|e| io_error(METHOD, &dir, &e))?;
            let path = entry.path();
            if !is_reserved(&path) {
                entries.push(path);
            }
        }
        entries.sort();

        let end = offset.saturating_add(self.page_size).min(entries.len());
        let page = entries.get(offset..end).unwrap_or_default();
        let items = page
            .iter()
            .filter_map(|path| match self.item(METHOD, path) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::debug!("{METHOD}: skipping {}: {e}", path.display());
                    None
                }
            })
            .collect();
        let next = if end < entries.len() {
            end.to_string()
        } else {
            String::new()
        };
        Ok((items, next))
    }

    async fn lookup(&self, parent_id: &str, name: &str, _ctx: &Context) -> Result<Vec<Item>> {
        const METHOD: &str = "lookup()";
        let path = self.child(METHOD, parent_id, name)?;
        let path = self.check_id(METHOD, &id_of(&path))?;
        Ok(vec![self.item(METHOD, &path)?])
    }

    async fn metadata(&self, item_id: &str, _ctx: &Context) -> Result<Item> {
        const METHOD: &str = "metadata()";
        let path = self.check_id(METHOD, item_id)?;
        self.item(METHOD, &path)
    }

    async fn create_folder(&self, parent_id: &str, name: &str, _ctx: &Context) -> Result<Item> {
        const METHOD: &str = "create_folder()";
        let path = self.child(METHOD, parent_id, name)?;
        if path.exists() {
            return Err(exists_error(METHOD, &path, name));
        }
        std::fs::create_dir(&path).map_err(|e| io_error(METHOD, &path, &e))?;
        self.item(METHOD, &path)
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        _size: u64,
        _content_type: &str,
        allow_overwrite: bool,
        _ctx: &Context,
    ) -> Result<Box<dyn UploadSink>> {
        const METHOD: &str = "create_file()";
        let path = self.child(METHOD, parent_id, name)?;
        if !allow_overwrite && path.exists() {
            return Err(exists_error(METHOD, &path, name));
        }
        let upload = LocalUpload::new(
            METHOD,
            self.root.clone(),
            path,
            Publish::Create { allow_overwrite },
        )?;
        Ok(Box::new(upload))
    }

    async fn update(
        &self,
        item_id: &str,
        _size: u64,
        old_etag: &str,
        _ctx: &Context,
    ) -> Result<Box<dyn UploadSink>> {
        const METHOD: &str = "update()";
        let path = self.check_id(METHOD, item_id)?;
        if !path.is_file() {
            return Err(StorageError::InvalidArgument(format!(
                "{METHOD}: \"{item_id}\" is not a file"
            )));
        }
        if !old_etag.is_empty() && etag_of(METHOD, &path)? != old_etag {
            return Err(StorageError::Conflict(format!("{METHOD}: etag mismatch")));
        }
        let upload = LocalUpload::new(
            METHOD,
            self.root.clone(),
            path,
            Publish::Update {
                old_etag: old_etag.to_string(),
            },
        )?;
        Ok(Box::new(upload))
    }

    async fn download(
        &self,
        item_id: &str,
        match_etag: &str,
        _ctx: &Context,
    ) -> Result<Box<dyn DownloadSource>> {
        const METHOD: &str = "download()";
        let path = self.check_id(METHOD, item_id)?;
        if !path.is_file() {
            return Err(StorageError::InvalidArgument(format!(
                "{METHOD}: \"{item_id}\" is not a file"
            )));
        }
        if !match_etag.is_empty() && etag_of(METHOD, &path)? != match_etag {
            return Err(StorageError::Conflict(format!("{METHOD}: etag mismatch")));
        }
        Ok(Box::new(LocalDownload::open(path).await?))
    }

    async fn delete(&self, item_id: &str, _ctx: &Context) -> Result<()> {
        const METHOD: &str = "delete()";
        let path = self.check_id(METHOD, item_id)?;
        if path == self.root {
            return Err(StorageError::PermissionDenied(format!(
                "{METHOD}: cannot delete root"
            )));
        }
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|e| io_error(METHOD, &path, &e))?;
        tracing::info!("{METHOD}: removed {}", path.display());
        Ok(())
    }

    async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        _ctx: &Context,
    ) -> Result<Item> {
        const METHOD: &str = "move()";
        let source = self.check_id(METHOD, item_id)?;
        let target = self.child(METHOD, new_parent_id, new_name)?;
        if target.exists() {
            return Err(exists_error(METHOD, &target, new_name));
        }
        if source == self.root {
            return Err(StorageError::PermissionDenied(format!(
                "{METHOD}: cannot move root"
            )));
        }
        std::fs::rename(&source, &target).map_err(|e| io_error(METHOD, &source, &e))?;
        self.item(METHOD, &target)
    }

    async fn copy(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        _ctx: &Context,
    ) -> Result<Item> {
        const METHOD: &str = "copy()";
        let source = self.check_id(METHOD, item_id)?;
        let target = self.child(METHOD, new_parent_id, new_name)?;
        if target.exists() {
            return Err(exists_error(METHOD, &target, new_name));
        }

        if source.is_dir() {
            // Build the copy under a reserved name so the walk never sees
            // its own output, then move it into place.
            let parent = target.parent().unwrap_or(&self.root);
            let staging = tempfile::Builder::new()
                .prefix(TMP_PREFIX)
                .tempdir_in(parent)
                .map_err(|e| io_error(METHOD, parent, &e))?;
            for entry in std::fs::read_dir(&source).map_err(|e| io_error(METHOD, &source, &e))? {
                let entry = entry.map_err(|e| io_error(METHOD, &source, &e))?;
                copy_recursively(&entry.path(), &staging.path().join(entry.file_name()))
                    .map_err(|e| io_error(METHOD, &entry.path(), &e))?;
            }
            std::fs::rename(staging.path(), &target).map_err(|e| io_error(METHOD, &target, &e))?;
        } else {
            std::fs::copy(&source, &target).map_err(|e| io_error(METHOD, &source, &e))?;
        }
        self.item(METHOD, &target)
    }
}
