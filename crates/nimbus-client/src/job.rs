use nimbus_core::{Item, Result, StorageError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Observable state of an [`AsyncJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Loading,
    Finished,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
enum State<T> {
    Loading,
    Finished(T),
    Error(StorageError),
    Cancelled(StorageError),
}

/// One outstanding provider call.
///
/// A job leaves `Loading` exactly once. Whichever of the reply, a
/// cancellation or a runtime shutdown gets there first decides the outcome.
pub struct AsyncJob<T> {
    method: &'static str,
    state: Arc<watch::Sender<State<T>>>,
    task: JoinHandle<()>,
}

pub type ItemJob = AsyncJob<Item>;
pub type ItemListJob = AsyncJob<Vec<Item>>;
pub type VoidJob = AsyncJob<()>;

impl<T: Clone + Send + Sync + 'static> AsyncJob<T> {
    pub(crate) fn spawn<F>(method: &'static str, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (state, _) = watch::channel(State::Loading);
        let state = Arc::new(state);
        let task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                let next = match work.await {
                    Ok(value) => State::Finished(value),
                    Err(err) => State::Error(err),
                };
                if !settle(&state, next) {
                    tracing::debug!("{method}: reply arrived after the job was settled");
                }
            }
        });
        Self {
            method,
            state,
            task,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn status(&self) -> JobStatus {
        match *self.state.borrow() {
            State::Loading => JobStatus::Loading,
            State::Finished(_) => JobStatus::Finished,
            State::Error(_) => JobStatus::Error,
            State::Cancelled(_) => JobStatus::Cancelled,
        }
    }

    /// Wait for the job to settle and return its outcome. May be called any
    /// number of times.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, State::Loading))
            .await
            .map_err(|_| StorageError::LocalComms(format!("{}: job state lost", self.method)))?;
        match &*state {
            State::Finished(value) => Ok(value.clone()),
            State::Error(err) | State::Cancelled(err) => Err(err.clone()),
            State::Loading => Err(StorageError::Logic(format!(
                "{}: job is still loading",
                self.method
            ))),
        }
    }

    /// Stop waiting for the reply. Has no effect on a settled job.
    pub fn cancel(&self) {
        let err = StorageError::Cancelled(format!("{}: job was cancelled", self.method));
        if settle(&self.state, State::Cancelled(err)) {
            self.task.abort();
        }
    }
}

fn settle<T>(state: &watch::Sender<State<T>>, next: State<T>) -> bool {
    state.send_if_modified(|current| {
        if matches!(current, State::Loading) {
            *current = next;
            true
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn settles_with_the_result() {
        let job = AsyncJob::spawn("metadata()", async { Ok(7) });
        assert_eq!(job.wait().await, Ok(7));
        assert_eq!(job.wait().await, Ok(7));
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.method(), "metadata()");
    }

    #[tokio::test]
    async fn errors_are_reported() {
        let job: VoidJob = AsyncJob::spawn("delete()", async {
            Err(StorageError::PermissionDenied("no".into()))
        });
        assert_eq!(job.wait().await, Err(StorageError::PermissionDenied("no".into())));
        assert_eq!(job.status(), JobStatus::Error);
        job.cancel();
        assert_eq!(job.status(), JobStatus::Error);
    }

    #[tokio::test]
    async fn cancel_wins_over_a_late_reply() {
        let (tx, rx) = oneshot::channel::<()>();
        let job = AsyncJob::spawn("list()", async move {
            let _ = rx.await;
            Ok(vec![1, 2, 3])
        });
        assert_eq!(job.status(), JobStatus::Loading);
        job.cancel();
        let _ = tx.send(());
        assert!(matches!(job.wait().await, Err(StorageError::Cancelled(_))));
        assert_eq!(job.status(), JobStatus::Cancelled);
    }
}
