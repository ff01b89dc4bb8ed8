use nimbus_core::{PeerId, Result, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use crate::download::DownloadJob;
use crate::inactivity::{Activity, InactivityTimer};
use crate::upload::UploadJob;

/// A registered upload or download.
#[derive(Clone)]
pub enum TransferJob {
    Upload(Arc<UploadJob>),
    Download(Arc<DownloadJob>),
}

impl TransferJob {
    pub fn id(&self) -> &str {
        match self {
            TransferJob::Upload(job) => job.id(),
            TransferJob::Download(job) => job.id(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        match self {
            TransferJob::Upload(job) => job.peer(),
            TransferJob::Download(job) => job.peer(),
        }
    }

    pub async fn cancel(&self) -> Result<()> {
        match self {
            TransferJob::Upload(job) => job.cancel().await,
            TransferJob::Download(job) => job.cancel().await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TransferJob::Upload(_) => "upload",
            TransferJob::Download(_) => "download",
        }
    }
}

#[derive(Default)]
struct JobsInner {
    jobs: HashMap<String, TransferJob>,
    by_peer: HashMap<PeerId, HashSet<String>>,
    busy: Option<Activity>,
}

impl JobsInner {
    fn release_if_idle(&mut self) {
        if self.jobs.is_empty() {
            self.busy = None;
        }
    }
}

/// Outstanding transfers, indexed by id and by owning peer.
///
/// Ids come from a counter owned by the registry. A peer is watched while it
/// owns at least one job; when it disconnects all of its jobs are removed
/// and cancelled. With a timer attached, the registry counts as one running
/// activity while it holds any job.
#[derive(Default)]
pub struct PendingJobs {
    next_id: AtomicU64,
    inner: Mutex<JobsInner>,
    timer: Option<Arc<InactivityTimer>>,
}

impl PendingJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timer(timer: Arc<InactivityTimer>) -> Self {
        Self {
            timer: Some(timer),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh job id, unique for the lifetime of this registry.
    pub fn next_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub fn add(&self, job: TransferJob) {
        let mut inner = self.lock();
        let peer = job.peer().clone();
        let ids = inner.by_peer.entry(peer.clone()).or_default();
        if ids.is_empty() {
            tracing::debug!("Jobs: watching peer {peer}");
        }
        ids.insert(job.id().to_string());
        inner.jobs.insert(job.id().to_string(), job);
        if inner.busy.is_none() {
            inner.busy = self.timer.as_ref().map(InactivityTimer::start);
        }
    }

    pub fn get_upload(&self, peer: &PeerId, id: &str) -> Result<Arc<UploadJob>> {
        match self.lookup(peer, id, "upload")? {
            TransferJob::Upload(job) => Ok(job),
            TransferJob::Download(_) => Err(no_such_job("upload", id)),
        }
    }

    pub fn get_download(&self, peer: &PeerId, id: &str) -> Result<Arc<DownloadJob>> {
        match self.lookup(peer, id, "download")? {
            TransferJob::Download(job) => Ok(job),
            TransferJob::Upload(_) => Err(no_such_job("download", id)),
        }
    }

    pub fn remove_upload(&self, peer: &PeerId, id: &str) -> Result<Arc<UploadJob>> {
        match self.remove(peer, id, "upload")? {
            TransferJob::Upload(job) => Ok(job),
            TransferJob::Download(_) => Err(no_such_job("upload", id)),
        }
    }

    pub fn remove_download(&self, peer: &PeerId, id: &str) -> Result<Arc<DownloadJob>> {
        match self.remove(peer, id, "download")? {
            TransferJob::Download(job) => Ok(job),
            TransferJob::Upload(_) => Err(no_such_job("download", id)),
        }
    }

    fn lookup(&self, peer: &PeerId, id: &str, kind: &str) -> Result<TransferJob> {
        let inner = self.lock();
        match inner.jobs.get(id) {
            Some(job) if job.peer() == peer && job.kind() == kind => Ok(job.clone()),
            _ => Err(no_such_job(kind, id)),
        }
    }

    /// Remove a job owned by `peer`. Fails with a logic error when the peer
    /// owns no job of that kind under `id`.
    fn remove(&self, peer: &PeerId, id: &str, kind: &str) -> Result<TransferJob> {
        let mut inner = self.lock();
        match inner.jobs.get(id) {
            Some(job) if job.peer() == peer && job.kind() == kind => {}
            _ => return Err(no_such_job(kind, id)),
        }
        let job = inner
            .jobs
            .remove(id)
            .ok_or_else(|| no_such_job(kind, id))?;
        if let Some(ids) = inner.by_peer.get_mut(peer) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_peer.remove(peer);
                tracing::debug!("Jobs: no longer watching peer {peer}");
            }
        }
        inner.release_if_idle();
        Ok(job)
    }

    /// Remove every job owned by `peer` and cancel each one in the
    /// background. Each cancellation task owns its job until it is done.
    pub fn on_peer_disconnected(&self, peer: &PeerId) -> Vec<JoinHandle<()>> {
        let jobs: Vec<TransferJob> = {
            let mut inner = self.lock();
            let Some(ids) = inner.by_peer.remove(peer) else {
                return Vec::new();
            };
            let jobs: Vec<TransferJob> =
                ids.iter().filter_map(|id| inner.jobs.remove(id)).collect();
            inner.release_if_idle();
            jobs
        };
        tracing::info!(
            "Jobs: peer {peer} disconnected, cancelling {} job(s)",
            jobs.len()
        );
        jobs.into_iter()
            .map(|job| {
                tokio::spawn(async move {
                    if let Err(e) = job.cancel().await {
                        tracing::warn!("Jobs: cancelling {} {} failed: {e}", job.kind(), job.id());
                    }
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Whether `peer` owns at least one job.
    pub fn is_watching(&self, peer: &PeerId) -> bool {
        self.lock().by_peer.contains_key(peer)
    }
}

fn no_such_job(kind: &str, id: &str) -> StorageError {
    StorageError::Logic(format!("no {kind} with id {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DownloadSource, UploadSink};
    use crate::state::JobStatus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use nimbus_core::Item;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl UploadSink for CountingSink {
        async fn write(&mut self, _chunk: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn finish(&mut self) -> Result<Item> {
            Err(StorageError::Logic("not expected".into()))
        }

        async fn cancel(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct IdleSource(Arc<AtomicUsize>);

    #[async_trait]
    impl DownloadSource for IdleSource {
        async fn read_chunk(&mut self, _max: usize) -> Result<Option<Bytes>> {
            std::future::pending().await
        }

        async fn cancel(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::RemoteComms("backend unreachable".into()))
        }
    }

    fn upload(jobs: &PendingJobs, peer: &PeerId, cancels: &Arc<AtomicUsize>) -> Arc<UploadJob> {
        let sink = Box::new(CountingSink(Arc::clone(cancels)));
        let job = UploadJob::start(jobs.next_id(), peer.clone(), 10, sink, 1024).unwrap();
        jobs.add(TransferJob::Upload(Arc::clone(&job)));
        job
    }

    #[test]
    fn ids_are_per_registry() {
        let a = PendingJobs::new();
        let b = PendingJobs::new();
        assert_eq!(a.next_id(), "1");
        assert_eq!(a.next_id(), "2");
        assert_eq!(b.next_id(), "1");
    }

    #[tokio::test]
    async fn remove_checks_owner_and_kind() {
        let jobs = PendingJobs::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let alice = PeerId::new(":1.1");
        let bob = PeerId::new(":1.2");
        let job = upload(&jobs, &alice, &cancels);

        assert!(matches!(
            jobs.remove_upload(&bob, job.id()),
            Err(StorageError::Logic(_))
        ));
        assert!(matches!(
            jobs.remove_download(&alice, job.id()),
            Err(StorageError::Logic(_))
        ));
        assert!(jobs.get_upload(&alice, job.id()).is_ok());
        assert!(jobs.is_watching(&alice));

        jobs.remove_upload(&alice, job.id()).unwrap();
        assert!(!jobs.is_watching(&alice));
        assert!(matches!(
            jobs.remove_upload(&alice, job.id()),
            Err(StorageError::Logic(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_cancels_every_job_of_that_peer_once() {
        let jobs = PendingJobs::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let gone = PeerId::new(":1.5");
        let stays = PeerId::new(":1.6");

        let uploads: Vec<_> = (0..3).map(|_| upload(&jobs, &gone, &cancels)).collect();
        let source = Box::new(IdleSource(Arc::clone(&cancels)));
        let download = DownloadJob::start(jobs.next_id(), gone.clone(), source, 1024).unwrap();
        jobs.add(TransferJob::Download(Arc::clone(&download)));
        let survivor = upload(&jobs, &stays, &cancels);
        assert_eq!(jobs.len(), 5);

        let handles = jobs.on_peer_disconnected(&gone);
        assert_eq!(handles.len(), 4);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cancels.load(Ordering::SeqCst), 4);
        assert_eq!(jobs.len(), 1);
        assert!(!jobs.is_watching(&gone));
        for job in &uploads {
            assert_eq!(job.status().await, JobStatus::Cancelled);
        }
        assert_eq!(download.status().await, JobStatus::Cancelled);
        assert_eq!(survivor.status().await, JobStatus::InProgress);

        assert!(jobs.on_peer_disconnected(&gone).is_empty());
    }

    #[tokio::test]
    async fn registered_jobs_keep_the_timer_busy() {
        let timer = InactivityTimer::new(None);
        let jobs = PendingJobs::with_timer(Arc::clone(&timer));
        let cancels = Arc::new(AtomicUsize::new(0));
        let peer = PeerId::new(":1.3");

        let first = upload(&jobs, &peer, &cancels);
        let second = upload(&jobs, &peer, &cancels);
        assert_eq!(timer.running(), 1);

        jobs.remove_upload(&peer, first.id()).unwrap();
        assert_eq!(timer.running(), 1);
        jobs.remove_upload(&peer, second.id()).unwrap();
        assert_eq!(timer.running(), 0);

        upload(&jobs, &peer, &cancels);
        assert_eq!(timer.running(), 1);
        for handle in jobs.on_peer_disconnected(&peer) {
            handle.await.unwrap();
        }
        assert_eq!(timer.running(), 0);
    }

    #[tokio::test]
    async fn cancel_task_keeps_removed_job_alive() {
        let jobs = PendingJobs::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let peer = PeerId::new(":1.9");
        let id = upload(&jobs, &peer, &cancels).id().to_string();

        let handles = jobs.on_peer_disconnected(&peer);
        assert!(jobs.get_upload(&peer, &id).is_err());
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
