use nimbus_core::{Message, Result, StorageError};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;

use crate::reply::expect_empty;
use crate::runtime::RuntimeHandle;
use crate::transfer::{Direction, Transfer, TransferState, TransferStatus};

const CHUNK_SIZE: usize = 64 * 1024;

/// Client end of a download.
///
/// Read until end of stream, then call `finish_download` to learn whether
/// the provider delivered everything. A backend failure shows up as an
/// early end of stream followed by an error from `finish_download`.
pub struct Downloader {
    transfer: Arc<Transfer<()>>,
    read: AtomicU64,
}

impl Downloader {
    pub(crate) fn start<F>(
        method: &'static str,
        service: Arc<str>,
        runtime: RuntimeHandle,
        pending: F,
    ) -> Self
    where
        F: Future<Output = Result<Message>> + Send + 'static,
    {
        Self {
            transfer: Transfer::start(method, service, runtime, Direction::Download, pending),
            read: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.transfer.status()
    }

    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub async fn ready(&self) -> Result<()> {
        self.transfer.ready().await
    }

    /// Read into `buf`. Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.transfer.ready().await?;
        let mut state = self.transfer.watch();
        let mut stream = self.transfer.stream.lock().await;
        let Some(channel) = stream.as_mut() else {
            return Err(self.transfer.closed_error());
        };

        let read = tokio::select! {
            biased;
            _ = state.wait_for(TransferState::is_terminal) => None,
            read = channel.read(buf) => Some(read),
        };
        let err = match read {
            Some(Ok(n)) => {
                self.read.fetch_add(n as u64, Ordering::Relaxed);
                return Ok(n);
            }
            Some(Err(e)) => StorageError::resource(
                format!("read(): cannot read from download channel: {e}"),
                e.raw_os_error().unwrap_or(-1),
            ),
            None => self.transfer.closed_error(),
        };
        stream.take();
        drop(stream);
        self.transfer.fail(err);
        Err(self.transfer.closed_error())
    }

    /// Read everything up to end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(data),
                n => data.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Ask the provider for the outcome of the download. Returns the same
    /// outcome when called again; after `cancel` it returns the cancellation.
    pub async fn finish_download(&self) -> Result<()> {
        self.transfer.finish(expect_empty, |_| false).await
    }

    pub fn cancel(&self) {
        self.transfer.cancel();
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.transfer.cancel();
    }
}
