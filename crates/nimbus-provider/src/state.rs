use nimbus_core::StorageError;

/// Externally visible phase of a transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Finalized,
    Cancelled,
    Error,
}

/// Completion state of a transfer job. Leaves `InProgress` at most once.
#[derive(Debug)]
pub(crate) enum JobState<T> {
    InProgress,
    Finalized(T),
    Cancelled { outcome: Result<(), StorageError> },
    Error(StorageError),
}

impl<T: Clone> JobState<T> {
    pub(crate) fn is_in_progress(&self) -> bool {
        matches!(self, JobState::InProgress)
    }

    pub(crate) fn status(&self) -> JobStatus {
        match self {
            JobState::InProgress => JobStatus::InProgress,
            JobState::Finalized(_) => JobStatus::Finalized,
            JobState::Cancelled { .. } => JobStatus::Cancelled,
            JobState::Error(_) => JobStatus::Error,
        }
    }

    /// Outcome of `finish()` once the job left `InProgress`.
    pub(crate) fn finished_outcome(&self, what: &str) -> Option<Result<T, StorageError>> {
        match self {
            JobState::InProgress => None,
            JobState::Finalized(value) => Some(Ok(value.clone())),
            JobState::Cancelled { .. } => Some(Err(StorageError::Cancelled(format!(
                "{what} was cancelled earlier"
            )))),
            JobState::Error(err) => Some(Err(err.clone())),
        }
    }

    /// Outcome of a repeated `cancel()`: the recorded one if the job was
    /// cancelled, otherwise a no-op.
    pub(crate) fn cancel_outcome(&self) -> Result<(), StorageError> {
        match self {
            JobState::Cancelled { outcome } => outcome.clone(),
            _ => Ok(()),
        }
    }
}
