use nimbus_core::{
    Bus, Call, Credentials, ErrorKind, IncomingCall, Message, PeerId, ReplyHandle, Result,
    StorageError, WireError,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::context::Context;
use crate::credentials_cache::CredentialsCache;
use crate::jobs::PendingJobs;
use crate::provider::Provider;

/// Runs one call against the provider and sends the reply.
pub struct Handler {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) jobs: Arc<PendingJobs>,
    pub(crate) cache: Arc<CredentialsCache>,
    pub(crate) bus: Bus,
    pub(crate) chunk_size: usize,
}

impl Handler {
    pub fn new(
        provider: Arc<dyn Provider>,
        jobs: Arc<PendingJobs>,
        cache: Arc<CredentialsCache>,
        bus: Bus,
        chunk_size: usize,
    ) -> Self {
        Self {
            provider,
            jobs,
            cache,
            bus,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Handle `call` with the account's `credentials`.
    ///
    /// Returns once the provider has been entered for this call, so calls
    /// handled one after another reach the provider in that order. The rest
    /// of the call runs in the background and `done` receives the kind of
    /// error sent back, if any.
    pub async fn handle<F>(self: &Arc<Self>, call: IncomingCall, credentials: Credentials, done: F)
    where
        F: FnOnce(Option<ErrorKind>) + Send + 'static,
    {
        let IncomingCall {
            sender,
            serial,
            message,
            reply,
        } = call;
        let (call, ctx) = match self.prepare(&sender, message, credentials).await {
            Ok(prepared) => prepared,
            Err(e) => {
                done(respond(serial, &sender, reply, Err(e)));
                return;
            }
        };
        let method = call.method();

        let (entered_tx, entered) = oneshot::channel();
        let invocation = tokio::spawn(signal_first_poll(
            Arc::clone(self).invoke(sender.clone(), call, ctx),
            entered_tx,
        ));
        tokio::spawn(async move {
            let result = match invocation.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    tracing::error!("{method}: provider panicked");
                    Err(StorageError::Unknown(format!(
                        "{method}: provider failed unexpectedly"
                    )))
                }
                Err(e) => Err(StorageError::Unknown(format!("{method}: {e}"))),
            };
            done(respond(serial, &sender, reply, result));
        });
        let _ = entered.await;
    }

    /// Decode the call and build its context from the sender's identity.
    async fn prepare(
        &self,
        sender: &PeerId,
        message: Message,
        credentials: Credentials,
    ) -> Result<(Call, Context)> {
        let call: Call = message
            .decode()
            .map_err(|e| StorageError::InvalidArgument(format!("malformed call: {e}")))?;
        let method = call.method();
        tracing::info!("{method} from {sender}");

        let peer = self.cache.get(sender).await;
        if !peer.valid {
            return Err(StorageError::PermissionDenied(format!(
                "{method}: could not retrieve credentials for peer {sender}"
            )));
        }
        let ctx = Context {
            uid: peer.uid,
            pid: peer.pid,
            security_label: peer.label,
            credentials,
        };
        Ok((call, ctx))
    }
}

fn respond(
    serial: u64,
    sender: &PeerId,
    reply: ReplyHandle,
    result: Result<Message>,
) -> Option<ErrorKind> {
    let kind = result.as_ref().err().map(StorageError::kind);
    if let Err(e) = &result {
        tracing::debug!("Call {serial} from {sender} failed: {e}");
    }
    if !reply.send(result.map_err(|e| WireError::from(&e))) {
        tracing::debug!("Call {serial}: {sender} stopped waiting for the reply");
    }
    kind
}

/// Runs `future`, firing `entered` once its first poll has returned.
fn signal_first_poll<F: Future>(
    future: F,
    entered: oneshot::Sender<()>,
) -> impl Future<Output = F::Output> {
    let mut future = Box::pin(future);
    let mut entered = Some(entered);
    std::future::poll_fn(move |cx| {
        let poll = future.as_mut().poll(cx);
        if let Some(entered) = entered.take() {
            let _ = entered.send(());
        }
        poll
    })
}
