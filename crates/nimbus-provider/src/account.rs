use async_trait::async_trait;
use nimbus_core::{Bus, Credentials, ErrorKind, IncomingCall, Result, StorageError, WireError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handler::Handler;
use crate::inactivity::Activity;

const ETIMEDOUT: i32 = 110;

/// Resolves the credentials of the account the provider serves.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `interactive` is set when the user may be asked to sign in again,
    /// typically after the backend rejected the previous credentials.
    async fn authenticate(&self, interactive: bool) -> Result<Credentials>;
}

/// Hands out the same credentials every time.
pub struct FixedAuthenticator {
    credentials: Credentials,
}

impl FixedAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for FixedAuthenticator {
    async fn authenticate(&self, _interactive: bool) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

enum AuthState {
    Unauthenticated,
    Authenticating { interactive: bool },
    Ready(Credentials),
}

/// A call cleared to run, with the credentials it runs under.
struct Released {
    call: IncomingCall,
    credentials: Credentials,
    activity: Activity,
}

struct AccountInner {
    state: AuthState,
    queue: VecDeque<(IncomingCall, Activity)>,
    interactive: bool,
    attempt: u64,
}

/// Account credentials plus the calls waiting for them.
///
/// Calls that arrive while credentials are unresolved are queued. Every
/// call, queued or not, is released through one channel whose consumer
/// enters the provider for each call before taking the next, so the
/// provider sees calls in arrival order. Queued calls from peers that have
/// since disconnected are dropped without reaching the provider.
pub struct AccountData {
    bus: Bus,
    authenticator: Arc<dyn Authenticator>,
    timeout: Duration,
    handler: Arc<Handler>,
    released: mpsc::UnboundedSender<Released>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Released>>>,
    inner: Mutex<AccountInner>,
}

impl AccountData {
    pub fn new(
        bus: Bus,
        authenticator: Arc<dyn Authenticator>,
        timeout: Duration,
        handler: Arc<Handler>,
    ) -> Self {
        let (released, receiver) = mpsc::unbounded_channel();
        Self {
            bus,
            authenticator,
            timeout,
            handler,
            released,
            receiver: Mutex::new(Some(receiver)),
            inner: Mutex::new(AccountInner {
                state: AuthState::Unauthenticated,
                queue: VecDeque::new(),
                interactive: false,
                attempt: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccountInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start releasing calls to the provider and begin authenticating.
    /// Returns `None` if the account was started already.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let dispatcher = tokio::spawn(release_loop(
            receiver,
            Arc::clone(&self.handler),
            Arc::downgrade(self),
        ));
        let mut inner = self.lock();
        if matches!(inner.state, AuthState::Unauthenticated) {
            let interactive = inner.interactive;
            self.begin_authentication(&mut inner, interactive);
        }
        Some(dispatcher)
    }

    /// Release `call` now, or queue it until credentials are available.
    /// `activity` is held until the call has been answered.
    pub fn submit(self: &Arc<Self>, call: IncomingCall, activity: Activity) {
        let mut inner = self.lock();
        if let AuthState::Ready(credentials) = &inner.state {
            let credentials = credentials.clone();
            self.release(call, credentials, activity);
            return;
        }
        tracing::debug!(
            "Account: queueing call {} from {} until credentials are ready",
            call.serial,
            call.sender
        );
        inner.queue.push_back((call, activity));
        if matches!(inner.state, AuthState::Unauthenticated) {
            let interactive = inner.interactive;
            self.begin_authentication(&mut inner, interactive);
        }
    }

    /// Forget the current credentials after the backend rejected them.
    ///
    /// Ready credentials are dropped and the next call authenticates
    /// interactively. A non-interactive authentication still running is
    /// superseded by an interactive one.
    pub fn invalidate_credentials(self: &Arc<Self>) {
        let mut inner = self.lock();
        if matches!(inner.state, AuthState::Ready(_)) {
            tracing::info!("Account: credentials rejected, will re-authenticate");
            inner.state = AuthState::Unauthenticated;
            inner.interactive = true;
        } else if matches!(inner.state, AuthState::Authenticating { interactive: false }) {
            tracing::info!("Account: credentials rejected, restarting authentication interactively");
            self.begin_authentication(&mut inner, true);
        } else if matches!(inner.state, AuthState::Unauthenticated) {
            inner.interactive = true;
        }
    }

    pub fn has_credentials(&self) -> bool {
        matches!(self.lock().state, AuthState::Ready(_))
    }

    pub fn queued_calls(&self) -> usize {
        self.lock().queue.len()
    }

    fn begin_authentication(self: &Arc<Self>, inner: &mut AccountInner, interactive: bool) {
        inner.attempt += 1;
        inner.state = AuthState::Authenticating { interactive };
        tokio::spawn(Arc::clone(self).authenticate(interactive, inner.attempt));
    }

    /// Hand a call to the release loop. Callers hold the account lock so
    /// that calls enter the channel in arrival order.
    fn release(&self, call: IncomingCall, credentials: Credentials, activity: Activity) {
        let released = Released {
            call,
            credentials,
            activity,
        };
        if let Err(mpsc::error::SendError(released)) = self.released.send(released) {
            tracing::warn!(
                "Account: not serving, dropping call {} from {}",
                released.call.serial,
                released.call.sender
            );
        }
    }

    async fn authenticate(self: Arc<Self>, interactive: bool, attempt: u64) {
        tracing::info!("Account: authenticating (interactive = {interactive})");
        let result =
            tokio::time::timeout(self.timeout, self.authenticator.authenticate(interactive)).await;

        let mut inner = self.lock();
        if inner.attempt != attempt {
            tracing::debug!("Account: authentication attempt {attempt} was superseded");
            return;
        }
        let outcome = match result {
            Ok(Ok(credentials)) => {
                inner.state = AuthState::Ready(credentials.clone());
                inner.interactive = false;
                Ok(credentials)
            }
            Ok(Err(e)) => {
                tracing::warn!("Account: authentication failed: {e}");
                inner.state = AuthState::Ready(Credentials::None);
                Ok(Credentials::None)
            }
            Err(_) => {
                tracing::warn!("Account: authentication timed out after {:?}", self.timeout);
                inner.state = AuthState::Unauthenticated;
                Err(StorageError::resource(
                    "timed out waiting for account credentials",
                    ETIMEDOUT,
                ))
            }
        };

        while let Some((call, activity)) = inner.queue.pop_front() {
            if !self.bus.is_connected(&call.sender) {
                tracing::debug!(
                    "Account: dropping call {} from departed peer {}",
                    call.serial,
                    call.sender
                );
                continue;
            }
            match &outcome {
                Ok(credentials) => self.release(call, credentials.clone(), activity),
                Err(e) => {
                    call.reply.send(Err(WireError::from(e)));
                }
            }
        }
    }
}

/// Enter the provider for each released call in turn.
async fn release_loop(
    mut released: mpsc::UnboundedReceiver<Released>,
    handler: Arc<Handler>,
    account: Weak<AccountData>,
) {
    while let Some(Released {
        call,
        credentials,
        activity,
    }) = released.recv().await
    {
        let account = account.clone();
        handler
            .handle(call, credentials, move |failed| {
                if failed == Some(ErrorKind::Unauthorized) {
                    if let Some(account) = account.upgrade() {
                        account.invalidate_credentials();
                    }
                }
                drop(activity);
            })
            .await;
    }
}
