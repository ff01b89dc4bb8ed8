use nimbus_core::{Call, Message, Result, StorageError};
use std::future::Future;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, OnceLock};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, watch};

use crate::reply::expect_transfer;
use crate::runtime::{RuntimeHandle, destroyed};

/// Observable state of an [`Uploader`](crate::Uploader) or
/// [`Downloader`](crate::Downloader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Loading,
    Ready,
    Finished,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) enum TransferState<T> {
    Loading,
    Ready,
    Finished(T),
    Error(StorageError),
    Cancelled(StorageError),
}

impl<T> TransferState<T> {
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, TransferState::Loading | TransferState::Ready)
    }

    fn status(&self) -> TransferStatus {
        match self {
            TransferState::Loading => TransferStatus::Loading,
            TransferState::Ready => TransferStatus::Ready,
            TransferState::Finished(_) => TransferStatus::Finished,
            TransferState::Error(_) => TransferStatus::Error,
            TransferState::Cancelled(_) => TransferStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn noun(self) -> &'static str {
        match self {
            Direction::Upload => "Uploader",
            Direction::Download => "Downloader",
        }
    }

    fn finish_method(self) -> &'static str {
        match self {
            Direction::Upload => "finish_upload()",
            Direction::Download => "finish_download()",
        }
    }

    fn finish_call(self, id: String) -> Call {
        match self {
            Direction::Upload => Call::FinishUpload { upload_id: id },
            Direction::Download => Call::FinishDownload { download_id: id },
        }
    }

    fn cancel_call(self, id: String) -> (&'static str, Call) {
        match self {
            Direction::Upload => ("cancel()", Call::CancelUpload { upload_id: id }),
            Direction::Download => ("cancel()", Call::CancelDownload { download_id: id }),
        }
    }
}

/// State shared by both transfer directions: the job's lifecycle, the id the
/// provider assigned and the local end of the streaming channel.
pub(crate) struct Transfer<T> {
    method: &'static str,
    service: Arc<str>,
    runtime: RuntimeHandle,
    direction: Direction,
    state: watch::Sender<TransferState<T>>,
    id: OnceLock<String>,
    pub(crate) stream: Mutex<Option<UnixStream>>,
    finishing: Mutex<()>,
}

impl<T: Clone + Send + Sync + 'static> Transfer<T> {
    /// Start tracking a transfer whose `CreateFile`/`Update`/`Download` call
    /// is `pending`.
    pub(crate) fn start<F>(
        method: &'static str,
        service: Arc<str>,
        runtime: RuntimeHandle,
        direction: Direction,
        pending: F,
    ) -> Arc<Self>
    where
        F: Future<Output = Result<Message>> + Send + 'static,
    {
        let (state, _) = watch::channel(TransferState::Loading);
        let transfer = Arc::new(Self {
            method,
            service,
            runtime,
            direction,
            state,
            id: OnceLock::new(),
            stream: Mutex::new(None),
            finishing: Mutex::new(()),
        });
        tokio::spawn(Arc::clone(&transfer).drive(pending));
        transfer
    }

    async fn drive<F>(self: Arc<Self>, pending: F)
    where
        F: Future<Output = Result<Message>> + Send + 'static,
    {
        let reply = pending.await;
        if let Err(err) = self.accept(reply).await {
            self.settle(TransferState::Error(err));
            return;
        }
        let ready = self.state.send_if_modified(|state| {
            if matches!(state, TransferState::Loading) {
                *state = TransferState::Ready;
                true
            } else {
                false
            }
        });
        if !ready {
            // Cancelled while the reply was in flight.
            self.send_cancel();
            self.close_stream();
            return;
        }
        tracing::debug!(
            "{}: {} {} ready",
            self.method,
            self.direction.noun(),
            self.id.get().map(String::as_str).unwrap_or_default()
        );

        let mut state = self.state.subscribe();
        tokio::select! {
            _ = state.wait_for(TransferState::is_terminal) => {}
            _ = self.runtime.destroyed() => {
                if self.settle(TransferState::Error(destroyed(self.method))) {
                    self.close_stream();
                }
            }
        }
    }

    /// Take the transfer id and the channel descriptor out of the reply.
    async fn accept(&self, reply: Result<Message>) -> Result<()> {
        let mut message = reply?;
        let id = expect_transfer(self.method, &message)?;
        let Some(fd) = message.fds.pop() else {
            tracing::error!("{}: reply for transfer {id} carries no descriptor", self.method);
            return Err(StorageError::LocalComms(format!(
                "{}: reply carries no channel descriptor",
                self.method
            )));
        };
        let local = |e: std::io::Error| {
            StorageError::LocalComms(format!("{}: cannot use channel: {e}", self.method))
        };
        let std_stream = StdUnixStream::from(fd);
        std_stream.set_nonblocking(true).map_err(local)?;
        let stream = UnixStream::from_std(std_stream).map_err(local)?;

        let _ = self.id.set(id);
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.state.borrow().status()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<TransferState<T>> {
        self.state.subscribe()
    }

    /// Move to a terminal state unless one was reached already.
    pub(crate) fn settle(&self, next: TransferState<T>) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Wait until the channel is usable.
    pub(crate) async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, TransferState::Loading))
            .await
            .map_err(|_| StorageError::LocalComms(format!("{}: state lost", self.method)))?;
        match &*state {
            TransferState::Error(err) | TransferState::Cancelled(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Error to report when the channel can no longer be used.
    pub(crate) fn closed_error(&self) -> StorageError {
        match &*self.state.borrow() {
            TransferState::Error(err) | TransferState::Cancelled(err) => err.clone(),
            TransferState::Finished(_) => StorageError::Logic(format!(
                "{}: {} is already finished",
                self.method,
                self.direction.noun()
            )),
            TransferState::Loading | TransferState::Ready => StorageError::Logic(format!(
                "{}: {} is being finalized",
                self.method,
                self.direction.noun()
            )),
        }
    }

    fn recorded(&self) -> Option<Result<T>> {
        match &*self.state.borrow() {
            TransferState::Finished(value) => Some(Ok(value.clone())),
            TransferState::Error(err) | TransferState::Cancelled(err) => Some(Err(err.clone())),
            TransferState::Loading | TransferState::Ready => None,
        }
    }

    /// Send the `Finish*` call and record its outcome. A settled transfer
    /// returns what it settled with.
    ///
    /// The channel stays open while the call is in flight. An error for
    /// which `retryable` holds leaves the transfer `Ready`, so the caller can
    /// keep using the channel and finish again.
    pub(crate) async fn finish<D, R>(&self, decode: D, retryable: R) -> Result<T>
    where
        D: FnOnce(&str, &Message) -> Result<T>,
        R: FnOnce(&StorageError) -> bool,
    {
        let _finishing = self.finishing.lock().await;
        if let Some(outcome) = self.recorded() {
            return outcome;
        }
        let method = self.direction.finish_method();
        if matches!(*self.state.borrow(), TransferState::Loading) {
            let err = StorageError::Logic(format!(
                "{method}: cannot finalize while {} is not in the Ready state",
                self.direction.noun()
            ));
            self.settle(TransferState::Error(err.clone()));
            return self.recorded().unwrap_or(Err(err));
        }

        let id = self.id.get().cloned().unwrap_or_default();
        let call = self.direction.finish_call(id);
        let outcome = self
            .runtime
            .call(method, &self.service, &call)
            .await
            .and_then(|reply| decode(method, &reply));
        if let Err(err) = &outcome {
            if retryable(err) && self.status() == TransferStatus::Ready {
                tracing::debug!("{method}: {} stays Ready: {err}", self.direction.noun());
                return outcome;
            }
        }
        let next = match &outcome {
            Ok(value) => TransferState::Finished(value.clone()),
            Err(err) => TransferState::Error(err.clone()),
        };
        let settled = self.settle(next);
        self.close_stream();
        if settled {
            tracing::info!("{method}: {} settled as {:?}", self.direction.noun(), self.status());
            if outcome.is_err() {
                // The provider keeps a job it could not finish, e.g. a
                // download whose payload was not fully read.
                self.send_cancel();
            }
            outcome
        } else {
            // Cancelled or shut down while the call was in flight.
            self.recorded().unwrap_or(outcome)
        }
    }

    /// Settle as failed after a local error and drop the provider's job.
    pub(crate) fn fail(&self, err: StorageError) {
        if self.settle(TransferState::Error(err)) {
            self.send_cancel();
            self.close_stream();
        }
    }

    /// Cancel the transfer. Has no effect once it is settled.
    pub(crate) fn cancel(&self) {
        let err = StorageError::Cancelled(format!(
            "{}: {} was cancelled",
            self.method,
            self.direction.noun()
        ));
        if !self.settle(TransferState::Cancelled(err)) {
            return;
        }
        tracing::info!("{}: {} cancelled", self.method, self.direction.noun());
        self.send_cancel();
        self.close_stream();
    }

    /// Tell the provider to drop the job. The reply is ignored.
    fn send_cancel(&self) {
        let Some(id) = self.id.get().cloned() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if !self.runtime.is_valid() {
            return;
        }
        let runtime = self.runtime.clone();
        let service = Arc::clone(&self.service);
        let (method, call) = self.direction.cancel_call(id);
        handle.spawn(async move {
            if let Err(e) = runtime.call(method, &service, &call).await {
                tracing::debug!("{method}: ignoring cancel failure: {e}");
            }
        });
    }

    /// Drop the local end unless a reader or writer is using it. Those notice
    /// the terminal state and drop it themselves.
    pub(crate) fn close_stream(&self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }
}
