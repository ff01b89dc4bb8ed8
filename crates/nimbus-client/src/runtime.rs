use nimbus_core::{Call, CallError, Connection, Message, Result, StorageError};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::account::AccountClient;

pub(crate) struct RuntimeInner {
    conn: Connection,
    shutdown: watch::Sender<bool>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Client runtime owning the bus connection.
///
/// Shutting the runtime down, or dropping its last handle, settles every
/// outstanding job with `RuntimeDestroyed`.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(conn: Connection) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RuntimeInner { conn, shutdown }),
        }
    }

    /// Client for the provider registered under `service_name`.
    pub fn account(&self, service_name: impl Into<String>) -> AccountClient {
        AccountClient::new(self.clone(), service_name.into())
    }

    pub fn is_valid(&self) -> bool {
        !*self.inner.shutdown.borrow()
    }

    /// Close the connection and fail everything still outstanding.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            tracing::info!("Runtime: shut down on {}", self.inner.conn.peer_id());
        }
        self.inner.conn.close();
    }

    pub(crate) fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inner: Arc::downgrade(&self.inner),
            shutdown: self.inner.shutdown.subscribe(),
        }
    }
}

/// What jobs hold on to: a weak reference, so that outstanding jobs do not
/// keep the runtime alive.
#[derive(Clone)]
pub(crate) struct RuntimeHandle {
    inner: Weak<RuntimeInner>,
    shutdown: watch::Receiver<bool>,
}

impl RuntimeHandle {
    /// Send `call` to `service` and wait for the reply, giving up when the
    /// runtime goes away.
    pub(crate) async fn call(&self, method: &str, service: &str, call: &Call) -> Result<Message> {
        let pending = {
            let inner = match self.inner.upgrade() {
                Some(inner) if !*inner.shutdown.borrow() => inner,
                _ => return Err(destroyed(method)),
            };
            let message = Message::encode(call).map_err(|e| {
                StorageError::LocalComms(format!("{method}: cannot encode call: {e}"))
            })?;
            inner.conn.call(service, message)
        };
        tokio::select! {
            biased;
            _ = self.destroyed() => Err(destroyed(method)),
            reply = pending => reply.map_err(|e| unmarshal_error(method, e)),
        }
    }

    /// Resolves once the runtime is shut down or dropped.
    pub(crate) async fn destroyed(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|down| *down).await;
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.inner.upgrade().is_some() && !*self.shutdown.borrow()
    }
}

pub(crate) fn destroyed(method: &str) -> StorageError {
    StorageError::RuntimeDestroyed(format!("{method}: runtime was destroyed previously"))
}

/// Turn a failed call into the client-visible error. Anything that is not
/// an error reply from the provider is a local communication failure.
pub(crate) fn unmarshal_error(method: &str, err: CallError) -> StorageError {
    match err {
        CallError::Remote(wire) => wire.into_storage_error(),
        CallError::Disconnected => {
            StorageError::LocalComms(format!("{method}: connection to the bus is closed"))
        }
        CallError::ServiceUnknown(name) => {
            StorageError::LocalComms(format!("{method}: no provider is registered as {name}"))
        }
        CallError::NoReply => StorageError::LocalComms(format!(
            "{method}: provider dropped the call without replying"
        )),
    }
}
