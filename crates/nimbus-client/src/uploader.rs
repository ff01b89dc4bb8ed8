use nimbus_core::{Item, Message, Result, StorageError};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

use crate::reply::expect_item;
use crate::runtime::RuntimeHandle;
use crate::transfer::{Direction, Transfer, TransferState, TransferStatus};

const CHUNK_SIZE: usize = 64 * 1024;

/// Client end of an upload started by `create_file` or `update`.
///
/// Bytes written here go straight to the provider over the streaming
/// channel. `finish_upload` asks the provider to publish the file, which
/// only succeeds once exactly `size` bytes arrived. Dropping an unfinished
/// uploader cancels it.
pub struct Uploader {
    transfer: Arc<Transfer<Item>>,
    size: i64,
    written: AtomicU64,
}

impl Uploader {
    pub(crate) fn start<F>(
        method: &'static str,
        service: Arc<str>,
        runtime: RuntimeHandle,
        size: i64,
        pending: F,
    ) -> Self
    where
        F: Future<Output = Result<Message>> + Send + 'static,
    {
        Self {
            transfer: Transfer::start(method, service, runtime, Direction::Upload, pending),
            size,
            written: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.transfer.status()
    }

    /// Declared size of the upload.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Wait for the provider to hand out the channel.
    pub async fn ready(&self) -> Result<()> {
        self.transfer.ready().await
    }

    /// Write `data` to the channel in chunks of at most 64 KiB.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.transfer.ready().await?;
        let mut state = self.transfer.watch();
        let mut stream = self.transfer.stream.lock().await;
        let Some(channel) = stream.as_mut() else {
            return Err(self.transfer.closed_error());
        };

        let mut failure = None;
        for chunk in data.chunks(CHUNK_SIZE) {
            let written = tokio::select! {
                biased;
                _ = state.wait_for(TransferState::is_terminal) => None,
                written = channel.write_all(chunk) => Some(written),
            };
            match written {
                Some(Ok(())) => {
                    self.written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Some(Err(e)) => {
                    failure = Some(StorageError::resource(
                        format!("write(): cannot write to upload channel: {e}"),
                        e.raw_os_error().unwrap_or(-1),
                    ));
                    break;
                }
                None => {
                    failure = Some(self.transfer.closed_error());
                    break;
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(err) => {
                stream.take();
                drop(stream);
                self.transfer.fail(err);
                Err(self.transfer.closed_error())
            }
        }
    }

    /// Ask the provider to publish the upload.
    ///
    /// If fewer than `size` bytes were written the provider refuses with a
    /// logic error and the uploader stays `Ready`: write the rest and call
    /// this again. Once settled, calling it again returns the same outcome;
    /// after `cancel` it returns the cancellation.
    pub async fn finish_upload(&self) -> Result<Item> {
        let short = self.bytes_written() < u64::try_from(self.size).unwrap_or(0);
        self.transfer
            .finish(expect_item, |err| {
                short && matches!(err, StorageError::Logic(_))
            })
            .await
    }

    pub fn cancel(&self) {
        self.transfer.cancel();
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.transfer.cancel();
    }
}
