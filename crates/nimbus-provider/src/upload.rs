use nimbus_core::{Item, PeerId, Result, StorageError};
use std::io::Read;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{Direction, StreamingChannel};
use crate::provider::UploadSink;
use crate::state::{JobState, JobStatus};

enum PumpCommand {
    /// Consume everything already buffered in the socket, then acknowledge.
    Drain(oneshot::Sender<()>),
    Stop,
}

struct UploadInner {
    state: JobState<Item>,
    sink: Box<dyn UploadSink>,
    received: u64,
}

/// Server side of one upload.
///
/// A background pump reads the retained channel end and forwards bytes to
/// the plugin's [`UploadSink`]. `finish` and `cancel` serialize on the job
/// state, so the publish and discard side effects each run at most once.
pub struct UploadJob {
    id: String,
    peer: PeerId,
    size: u64,
    inner: tokio::sync::Mutex<UploadInner>,
    client_end: Mutex<Option<OwnedFd>>,
    pump: Mutex<Option<mpsc::UnboundedSender<PumpCommand>>>,
}

impl UploadJob {
    /// Create the job and its channel and start pumping. Must run inside a
    /// Tokio runtime.
    pub fn start(
        id: String,
        peer: PeerId,
        size: u64,
        sink: Box<dyn UploadSink>,
        chunk_size: usize,
    ) -> Result<Arc<Self>> {
        let mut channel = StreamingChannel::new(Direction::Upload).map_err(|e| {
            StorageError::resource(
                format!("cannot create upload channel: {e}"),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
        let client_end = channel.take_remote();
        let raw = channel.try_clone_local().map_err(|e| {
            StorageError::resource(
                format!("cannot duplicate upload channel: {e}"),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
        let stream = channel.into_local().map_err(|e| {
            StorageError::resource(
                format!("cannot register upload channel: {e}"),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let job = Arc::new(Self {
            id,
            peer,
            size,
            inner: tokio::sync::Mutex::new(UploadInner {
                state: JobState::InProgress,
                sink,
                received: 0,
            }),
            client_end: Mutex::new(client_end),
            pump: Mutex::new(Some(tx)),
        });
        tokio::spawn(Arc::clone(&job).pump(stream, raw, rx, chunk_size.max(1)));
        tracing::debug!("Upload {}: started for {}, {size} bytes", job.id, job.peer);
        Ok(job)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn size(&self) -> u64 {
        self.size
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

    pub async fn bytes_received(&self) -> u64 {
        self.inner.lock().await.received
    }

    /// Publish the upload once exactly `size` bytes arrived.
    ///
    /// A short upload is a logic error and leaves the job running so the
    /// client can send the rest and retry. Once the job has left the running
    /// state this returns the recorded outcome.
    pub async fn finish(&self) -> Result<Item> {
        self.drain().await;

        let mut inner = self.inner.lock().await;
        if let Some(outcome) = inner.state.finished_outcome("upload") {
            return outcome;
        }
        if inner.received < self.size {
            return Err(StorageError::Logic(format!(
                "finish() method called too early, size was given as {} but only {} bytes were received",
                self.size, inner.received
            )));
        }
        if inner.received > self.size {
            let err = StorageError::Logic(format!(
                "received more than the expected number ({}) of bytes: {} bytes were received",
                self.size, inner.received
            ));
            self.abandon(&mut inner, err.clone()).await;
            return Err(err);
        }

        self.stop_pump();
        let outcome = inner.sink.finish().await;
        inner.state = match &outcome {
            Ok(item) => {
                tracing::info!("Upload {}: published {}", self.id, item.item_id);
                JobState::Finalized(item.clone())
            }
            Err(e) => {
                tracing::warn!("Upload {}: publishing failed: {e}", self.id);
                JobState::Error(e.clone())
            }
        };
        outcome
    }

    /// Abandon the upload. Later calls return the first call's outcome, and
    /// cancelling a job that already completed does nothing.
    pub async fn cancel(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_in_progress() {
            return inner.state.cancel_outcome();
        }
        self.stop_pump();
        let outcome = inner.sink.cancel().await;
        if let Err(e) = &outcome {
            tracing::warn!("Upload {}: backend cancel failed: {e}", self.id);
        }
        inner.state = JobState::Cancelled {
            outcome: outcome.clone(),
        };
        tracing::info!("Upload {}: cancelled", self.id);
        outcome
    }

    async fn abandon(&self, inner: &mut UploadInner, err: StorageError) {
        self.stop_pump();
        if let Err(e) = inner.sink.cancel().await {
            tracing::warn!("Upload {}: backend cancel failed: {e}", self.id);
        }
        tracing::warn!("Upload {}: {err}", self.id);
        inner.state = JobState::Error(err);
    }

    fn stop_pump(&self) {
        let tx = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(PumpCommand::Stop);
        }
    }

    async fn drain(&self) {
        let tx = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PumpCommand::Drain(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    async fn pump(
        self: Arc<Self>,
        mut stream: UnixStream,
        raw: std::os::unix::net::UnixStream,
        mut commands: mpsc::UnboundedReceiver<PumpCommand>,
        chunk_size: usize,
    ) {
        let mut buf = vec![0u8; chunk_size];
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PumpCommand::Drain(done)) => {
                        let stopped = self.drain_buffered(&raw, &mut buf).await;
                        let _ = done.send(());
                        if stopped {
                            return;
                        }
                    }
                    Some(PumpCommand::Stop) | None => return,
                },
                read = stream.read(&mut buf) => {
                    let keep_going = match read {
                        Ok(0) => {
                            tracing::debug!("Upload {}: client closed its end", self.id);
                            false
                        }
                        Ok(n) => self.accept(&buf[..n]).await,
                        Err(e) => {
                            self.fail_read(&e).await;
                            false
                        }
                    };
                    if !keep_going {
                        return;
                    }
                }
            }
        }
    }

    /// Non-blocking reads straight from the socket until it is empty.
    /// Returns `true` once the pump has nothing left to do.
    async fn drain_buffered(&self, raw: &std::os::unix::net::UnixStream, buf: &mut [u8]) -> bool {
        loop {
            match (&*raw).read(buf) {
                Ok(0) => return true,
                Ok(n) => {
                    if !self.accept(&buf[..n]).await {
                        return true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_read(&e).await;
                    return true;
                }
            }
        }
    }

    /// Hand a chunk to the sink. Bytes beyond the declared size are counted
    /// but not stored.
    async fn accept(&self, chunk: &[u8]) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_in_progress() {
            return false;
        }
        let already = inner.received;
        inner.received += chunk.len() as u64;
        if inner.received > self.size {
            if already <= self.size {
                tracing::warn!(
                    "Upload {}: received more than the expected number ({}) of bytes",
                    self.id,
                    self.size
                );
            }
            return true;
        }
        if let Err(e) = inner.sink.write(chunk).await {
            self.abandon(&mut inner, e).await;
            return false;
        }
        true
    }

    async fn fail_read(&self, err: &std::io::Error) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_in_progress() {
            let err = StorageError::resource(
                format!("error reading upload channel: {err}"),
                err.raw_os_error().unwrap_or(-1),
            );
            self.abandon(&mut inner, err).await;
        }
    }
}
