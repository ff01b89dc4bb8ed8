use nimbus_core::config::ProviderSettings;
use nimbus_core::{Bus, BusError, BusEvent, ServiceEndpoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::account::{AccountData, Authenticator};
use crate::credentials_cache::CredentialsCache;
use crate::handler::Handler;
use crate::inactivity::InactivityTimer;
use crate::jobs::PendingJobs;
use crate::provider::Provider;

/// Event loop serving one provider under a bus name.
///
/// The loop itself never waits on the provider: calls are queued or
/// released and disconnect notifications go straight to the job registry.
/// With an idle timeout configured the loop ends once no call has been
/// running and no transfer has been registered for that long.
pub struct Server {
    endpoint: ServiceEndpoint,
    account: Arc<AccountData>,
    jobs: Arc<PendingJobs>,
    timer: Arc<InactivityTimer>,
    idle_timeout: Option<Duration>,
}

impl Server {
    pub fn new(
        bus: &Bus,
        provider: Arc<dyn Provider>,
        authenticator: Arc<dyn Authenticator>,
        settings: &ProviderSettings,
    ) -> Result<Self, BusError> {
        let endpoint = bus.register_service(&settings.service_name)?;
        let idle_timeout = settings.idle_timeout();
        let timer = InactivityTimer::new(idle_timeout);
        let jobs = Arc::new(PendingJobs::with_timer(Arc::clone(&timer)));
        let cache = Arc::new(CredentialsCache::new(
            Arc::new(bus.clone()),
            settings.credentials_cache_size,
            settings.credentials_timeout(),
        ));
        let handler = Arc::new(Handler::new(
            provider,
            Arc::clone(&jobs),
            cache,
            bus.clone(),
            settings.transfer_chunk_size,
        ));
        let account = Arc::new(AccountData::new(
            bus.clone(),
            authenticator,
            settings.auth_timeout(),
            handler,
        ));
        Ok(Self {
            endpoint,
            account,
            jobs,
            timer,
            idle_timeout,
        })
    }

    pub fn jobs(&self) -> Arc<PendingJobs> {
        Arc::clone(&self.jobs)
    }

    pub fn account(&self) -> Arc<AccountData> {
        Arc::clone(&self.account)
    }

    pub async fn run(mut self) {
        tracing::info!("Server: serving {}", self.endpoint.name());
        let dispatcher = self.account.start();
        let timer = Arc::clone(&self.timer);
        let idle = timer.expired();
        tokio::pin!(idle);

        loop {
            tokio::select! {
                event = self.endpoint.next_event() => match event {
                    Some(BusEvent::Call(call)) => self.account.submit(call, self.timer.start()),
                    Some(BusEvent::Disconnected(peer)) => {
                        self.jobs.on_peer_disconnected(&peer);
                    }
                    None => break,
                },
                _ = &mut idle => {
                    tracing::info!(
                        "Server: exiting after {:?} of idle time",
                        self.idle_timeout.unwrap_or_default()
                    );
                    break;
                }
            }
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        tracing::info!("Server: {} closed", self.endpoint.name());
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
