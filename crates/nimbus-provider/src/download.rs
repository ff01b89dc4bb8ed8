use nimbus_core::{PeerId, Result, StorageError};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::watch;

use crate::channel::{Direction, StreamingChannel};
use crate::provider::DownloadSource;
use crate::state::{JobState, JobStatus};

struct DownloadInner {
    state: JobState<()>,
    written: u64,
}

/// Server side of one download.
///
/// A background pump pulls chunks from the plugin's [`DownloadSource`] and
/// writes them to the retained channel end. The job records its completion
/// before the channel is closed, so a client that has seen end-of-stream can
/// always collect the outcome with `finish`.
pub struct DownloadJob {
    id: String,
    peer: PeerId,
    inner: tokio::sync::Mutex<DownloadInner>,
    source: tokio::sync::Mutex<Box<dyn DownloadSource>>,
    client_end: Mutex<Option<OwnedFd>>,
    stop: watch::Sender<bool>,
}

impl DownloadJob {
    /// Create the job and its channel and start streaming. Must run inside a
    /// Tokio runtime.
    pub fn start(
        id: String,
        peer: PeerId,
        source: Box<dyn DownloadSource>,
        chunk_size: usize,
    ) -> Result<Arc<Self>> {
        let mut channel = StreamingChannel::new(Direction::Download).map_err(|e| {
            StorageError::resource(
                format!("cannot create download channel: {e}"),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
        let client_end = channel.take_remote();
        let stream = channel.into_local().map_err(|e| {
            StorageError::resource(
                format!("cannot register download channel: {e}"),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;

        let (stop, stop_rx) = watch::channel(false);
        let job = Arc::new(Self {
            id,
            peer,
            inner: tokio::sync::Mutex::new(DownloadInner {
                state: JobState::InProgress,
                written: 0,
            }),
            source: tokio::sync::Mutex::new(source),
            client_end: Mutex::new(client_end),
            stop,
        });
        tokio::spawn(Arc::clone(&job).pump(stream, stop_rx, chunk_size.max(1)));
        tracing::debug!("Download {}: started for {}", job.id, job.peer);
        Ok(job)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// The client's channel end. Yields `Some` only once.
    pub fn take_client_end(&self) -> Option<OwnedFd> {
        self.client_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub async fn status(&self) -> JobStatus {
        self.inner.lock().await.state.status()
    }

    pub async fn bytes_written(&self) -> u64 {
        self.inner.lock().await.written
    }

    /// Record success and close the channel.
    pub async fn report_complete(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_in_progress() {
            inner.state = JobState::Finalized(());
            tracing::info!("Download {}: complete, {} bytes", self.id, inner.written);
        }
        drop(inner);
        self.stop.send_replace(true);
    }

    /// Record failure and close the channel so the client sees end-of-stream.
    pub async fn report_error(&self, err: StorageError) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_in_progress() {
            tracing::warn!("Download {}: {err}", self.id);
            inner.state = JobState::Error(err);
        }
        drop(inner);
        self.stop.send_replace(true);
    }

    /// Collect the outcome of a download whose payload has been written.
    pub async fn finish(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        match inner.state.finished_outcome("download") {
            Some(outcome) => outcome,
            None => Err(StorageError::Logic(format!(
                "finish() method called too early, only {} bytes have been written so far",
                inner.written
            ))),
        }
    }

    /// Stop streaming. Later calls return the first call's outcome, and
    /// cancelling a completed download does nothing.
    pub async fn cancel(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_in_progress() {
            return inner.state.cancel_outcome();
        }
        self.stop.send_replace(true);
        let outcome = self.source.lock().await.cancel().await;
        if let Err(e) = &outcome {
            tracing::warn!("Download {}: backend cancel failed: {e}", self.id);
        }
        inner.state = JobState::Cancelled {
            outcome: outcome.clone(),
        };
        tracing::info!("Download {}: cancelled", self.id);
        outcome
    }

    async fn pump(
        self: Arc<Self>,
        mut stream: UnixStream,
        mut stop: watch::Receiver<bool>,
        chunk_size: usize,
    ) {
        loop {
            if !self.inner.lock().await.state.is_in_progress() {
                return;
            }
            let chunk = {
                let mut source = self.source.lock().await;
                tokio::select! {
                    biased;
                    _ = stop.changed() => return,
                    chunk = source.read_chunk(chunk_size) => chunk,
                }
            };
            match chunk {
                Ok(Some(bytes)) => {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => return,
                        written = stream.write_all(&bytes) => {
                            if let Err(e) = written {
                                let err = StorageError::resource(
                                    format!("error writing download channel: {e}"),
                                    e.raw_os_error().unwrap_or(-1),
                                );
                                self.report_error(err).await;
                                return;
                            }
                            self.inner.lock().await.written += bytes.len() as u64;
                        }
                    }
                }
                Ok(None) => {
                    self.report_complete().await;
                    return;
                }
                Err(e) => {
                    self.report_error(e).await;
                    return;
                }
            }
        }
    }
}
