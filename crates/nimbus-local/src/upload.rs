use async_trait::async_trait;
use nimbus_core::{Item, Result, StorageError};
use nimbus_provider::UploadSink;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use crate::fsutil::{TMP_PREFIX, etag_of, io_error, make_item};

/// How a finished upload is published.
pub(crate) enum Publish {
    Create { allow_overwrite: bool },
    Update { old_etag: String },
}

/// Upload staged in a temporary file beside its destination.
pub(crate) struct LocalUpload {
    method: &'static str,
    root: PathBuf,
    target: PathBuf,
    publish: Publish,
    file: Option<NamedTempFile>,
}

impl LocalUpload {
    pub(crate) fn new(
        method: &'static str,
        root: PathBuf,
        target: PathBuf,
        publish: Publish,
    ) -> Result<Self> {
        let dir = target
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| root.clone());
        let file = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| io_error(method, &dir, &e))?;
        tracing::debug!(
            "{method}: staging {} in {}",
            target.display(),
            file.path().display()
        );
        Ok(Self {
            method,
            root,
            target,
            publish,
            file: Some(file),
        })
    }

    fn finished(&self) -> StorageError {
        StorageError::Logic(format!(
            "{}: upload of \"{}\" was already finished or cancelled",
            self.method,
            self.target.display()
        ))
    }

    /// Re-check the preconditions that were checked when the upload started,
    /// as the destination may have changed in the meantime.
    fn recheck(&self) -> Result<()> {
        let id = self.target.to_string_lossy();
        match &self.publish {
            Publish::Create {
                allow_overwrite: false,
            } if self.target.exists() => {
                let name = self
                    .target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Err(StorageError::exists(
                    format!("{}: \"{id}\" exists already", self.method),
                    id.as_ref(),
                    name,
                ))
            }
            Publish::Update { old_etag } if !old_etag.is_empty() => {
                if etag_of(self.method, &self.target)? != *old_etag {
                    return Err(StorageError::Conflict(format!(
                        "{}: etag mismatch",
                        self.method
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl UploadSink for LocalUpload {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let method = self.method;
        let Some(file) = self.file.as_mut() else {
            return Err(self.finished());
        };
        file.write_all(chunk)
            .map_err(|e| io_error(method, &self.target, &e))
    }

    async fn finish(&mut self) -> Result<Item> {
        let Some(mut file) = self.file.take() else {
            return Err(self.finished());
        };
        self.recheck()?;
        file.flush()
            .map_err(|e| io_error(self.method, &self.target, &e))?;

        let no_clobber = matches!(
            self.publish,
            Publish::Create {
                allow_overwrite: false
            }
        );
        let persisted = if no_clobber {
            file.persist_noclobber(&self.target)
        } else {
            file.persist(&self.target)
        };
        persisted.map_err(|e| io_error(self.method, &self.target, &e.error))?;
        tracing::info!("{}: published {}", self.method, self.target.display());
        make_item(&self.root, self.method, &self.target)
    }

    async fn cancel(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let staged = file.path().to_path_buf();
            file.close().map_err(|e| io_error(self.method, &staged, &e))?;
            tracing::debug!("{}: discarded {}", self.method, staged.display());
        }
        Ok(())
    }
}
