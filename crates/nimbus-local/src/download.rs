use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nimbus_core::{Result, StorageError};
use nimbus_provider::DownloadSource;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::fsutil::io_error;

const METHOD: &str = "download()";

/// Streams an open file in chunks.
pub(crate) struct LocalDownload {
    path: PathBuf,
    file: Option<File>,
}

impl LocalDownload {
    pub(crate) async fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)
            .await
            .map_err(|e| io_error(METHOD, &path, &e))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

#[async_trait]
impl DownloadSource for LocalDownload {
    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        let Some(file) = self.file.as_mut() else {
            return Err(StorageError::Cancelled(format!(
                "{METHOD}: \"{}\" is no longer being read",
                self.path.display()
            )));
        };
        let mut buf = BytesMut::zeroed(max.max(1));
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| io_error(METHOD, &self.path, &e))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}
