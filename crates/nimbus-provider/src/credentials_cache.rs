use async_trait::async_trait;
use nimbus_core::{Bus, PeerId, PeerInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Where peer identities come from, normally the bus itself.
#[async_trait]
pub trait CredentialsSource: Send + Sync {
    async fn lookup(&self, peer: &PeerId) -> Result<PeerInfo, String>;
}

#[async_trait]
impl CredentialsSource for Bus {
    async fn lookup(&self, peer: &PeerId) -> Result<PeerInfo, String> {
        self.connection_credentials(peer).map_err(|e| e.to_string())
    }
}

/// Identity facts about a peer. `valid` is false when the lookup failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    pub valid: bool,
    pub uid: u32,
    pub pid: u32,
    pub label: String,
}

impl PeerCredentials {
    fn invalid() -> Self {
        Self {
            valid: false,
            uid: 0,
            pid: 0,
            label: String::new(),
        }
    }

    fn from_info(info: PeerInfo) -> Self {
        Self {
            valid: true,
            uid: info.uid,
            pid: info.pid,
            label: security_label(&info.security_label),
        }
    }
}

/// Strip the trailing NUL and confinement mode from a raw label, e.g.
/// `/usr/bin/app (enforce)` becomes `/usr/bin/app`.
fn security_label(raw: &str) -> String {
    let label = raw.trim_end_matches('\0');
    let label = match label.rfind(" (") {
        Some(pos) if label.ends_with(')') => &label[..pos],
        _ => label,
    };
    if label.is_empty() {
        "unconfined".to_string()
    } else {
        label.to_string()
    }
}

#[derive(Default)]
struct CacheInner {
    current: HashMap<PeerId, PeerCredentials>,
    old: HashMap<PeerId, PeerCredentials>,
    pending: HashMap<PeerId, Vec<oneshot::Sender<PeerCredentials>>>,
}

impl CacheInner {
    fn insert(&mut self, peer: PeerId, creds: PeerCredentials, capacity: usize) {
        if self.current.len() >= capacity {
            self.old = std::mem::take(&mut self.current);
        }
        self.current.insert(peer, creds);
    }
}

/// Two-generation cache of peer identities with coalesced lookups.
///
/// When the current generation fills up it becomes the old generation and
/// a new one starts. Hits in the old generation move to the current one.
/// Concurrent requests for an uncached peer share a single lookup, and a
/// failed lookup is cached as invalid.
pub struct CredentialsCache {
    source: Arc<dyn CredentialsSource>,
    capacity: usize,
    timeout: Duration,
    inner: Mutex<CacheInner>,
}

impl CredentialsCache {
    pub fn new(source: Arc<dyn CredentialsSource>, capacity: usize, timeout: Duration) -> Self {
        Self {
            source,
            capacity: capacity.max(1),
            timeout,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn get(self: &Arc<Self>, peer: &PeerId) -> PeerCredentials {
        let waiter = {
            let mut inner = self.lock();
            if let Some(creds) = inner.current.get(peer) {
                return creds.clone();
            }
            if let Some(creds) = inner.old.remove(peer) {
                inner.insert(peer.clone(), creds.clone(), self.capacity);
                return creds;
            }
            let (tx, rx) = oneshot::channel();
            match inner.pending.get_mut(peer) {
                Some(waiters) => waiters.push(tx),
                None => {
                    inner.pending.insert(peer.clone(), vec![tx]);
                    tokio::spawn(Arc::clone(self).resolve(peer.clone()));
                }
            }
            rx
        };
        waiter.await.unwrap_or_else(|_| PeerCredentials::invalid())
    }

    async fn resolve(self: Arc<Self>, peer: PeerId) {
        tracing::debug!("Credentials: looking up peer {peer}");
        let creds = match tokio::time::timeout(self.timeout, self.source.lookup(&peer)).await {
            Ok(Ok(info)) => PeerCredentials::from_info(info),
            Ok(Err(e)) => {
                tracing::warn!("Credentials: lookup for {peer} failed: {e}");
                PeerCredentials::invalid()
            }
            Err(_) => {
                tracing::warn!("Credentials: lookup for {peer} timed out");
                PeerCredentials::invalid()
            }
        };
        let waiters = {
            let mut inner = self.lock();
            inner.insert(peer.clone(), creds.clone(), self.capacity);
            inner.pending.remove(&peer).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(creds.clone());
        }
    }

    /// Entries in the (current, old) generations.
    pub fn generation_sizes(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.current.len(), inner.old.len())
    }
}
