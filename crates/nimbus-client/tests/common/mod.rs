#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_client::{AccountClient, Runtime};
use nimbus_core::config::ProviderSettings;
use nimbus_core::{Bus, BusEvent, Credentials, Item, PeerInfo, Result, StorageError};
use nimbus_local::LocalProvider;
use nimbus_provider::{
    Context, DownloadSource, FixedAuthenticator, PendingJobs, Provider, Server, UploadSink,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const SERVICE: &str = "com.nimbus.Client.Test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("nimbus=debug"))
        .with_test_writer()
        .try_init();
}

/// A served local backend and a client runtime talking to it.
pub struct Fixture {
    pub dir: TempDir,
    pub bus: Bus,
    pub runtime: Runtime,
    pub account: AccountClient,
    pub jobs: Arc<PendingJobs>,
    pub root_id: String,
    server: JoinHandle<()>,
}

impl Fixture {
    pub async fn start(page_size: usize) -> anyhow::Result<Self> {
        Self::start_with(page_size, |local| Arc::new(local) as Arc<dyn Provider>).await
    }

    /// Serve the local backend wrapped by `wrap`.
    pub async fn start_with<F>(page_size: usize, wrap: F) -> anyhow::Result<Self>
    where
        F: FnOnce(LocalProvider) -> Arc<dyn Provider>,
    {
        init_tracing();
        let dir = TempDir::new()?;
        let bus = Bus::new();
        let provider = wrap(LocalProvider::new(dir.path(), page_size)?);
        let settings = ProviderSettings {
            service_name: SERVICE.to_string(),
            ..ProviderSettings::default()
        };
        let server = Server::new(
            &bus,
            provider,
            Arc::new(FixedAuthenticator::new(Credentials::None)),
            &settings,
        )?;
        let jobs = server.jobs();
        let server = server.spawn();

        let runtime = Runtime::new(bus.connect(PeerInfo::new(1000, 4321, "unconfined")));
        let account = runtime.account(SERVICE);
        let roots = account.roots().wait().await?;
        anyhow::ensure!(roots.len() == 1, "expected one root, got {}", roots.len());
        let root_id = roots[0].item_id.clone();

        Ok(Self {
            dir,
            bus,
            runtime,
            account,
            jobs,
            root_id,
            server,
        })
    }

    /// Upload `data` as `name` under the root.
    pub async fn put(&self, name: &str, data: &[u8]) -> Result<Item> {
        let uploader =
            self.account
                .create_file(&self.root_id, name, data.len() as i64, "", false);
        uploader.ready().await?;
        uploader.write(data).await?;
        uploader.finish_upload().await
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A bus service that accepts calls and never answers them.
pub fn silent_service(bus: &Bus, name: &str) -> JoinHandle<()> {
    let mut endpoint = bus.register_service(name).unwrap_or_else(|e| panic!("{e}"));
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(event) = endpoint.next_event().await {
            if let BusEvent::Call(call) = event {
                held.push(call);
            }
        }
    })
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("condition not reached in time"));
}

/// Local backend whose downloads of files named `broken*` fail half way.
pub struct BrokenDownloads(pub LocalProvider);

struct BrokenSource {
    sent: bool,
}

#[async_trait]
impl DownloadSource for BrokenSource {
    async fn read_chunk(&mut self, _max: usize) -> Result<Option<Bytes>> {
        if self.sent {
            return Err(StorageError::resource("disk went away", 5));
        }
        self.sent = true;
        Ok(Some(Bytes::from_static(b"first part")))
    }

    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Provider for BrokenDownloads {
    async fn roots(&self, ctx: &Context) -> Result<Vec<Item>> {
        self.0.roots(ctx).await
    }

    async fn list(
        &self,
        item_id: &str,
        page_token: &str,
        ctx: &Context,
    ) -> Result<(Vec<Item>, String)> {
        self.0.list(item_id, page_token, ctx).await
    }

    async fn lookup(&self, parent_id: &str, name: &str, ctx: &Context) -> Result<Vec<Item>> {
        self.0.lookup(parent_id, name, ctx).await
    }

    async fn metadata(&self, item_id: &str, ctx: &Context) -> Result<Item> {
        self.0.metadata(item_id, ctx).await
    }

    async fn create_folder(&self, parent_id: &str, name: &str, ctx: &Context) -> Result<Item> {
        self.0.create_folder(parent_id, name, ctx).await
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        size: u64,
        content_type: &str,
        allow_overwrite: bool,
        ctx: &Context,
    ) -> Result<Box<dyn UploadSink>> {
        self.0
            .create_file(parent_id, name, size, content_type, allow_overwrite, ctx)
            .await
    }

    async fn update(
        &self,
        item_id: &str,
        size: u64,
        old_etag: &str,
        ctx: &Context,
    ) -> Result<Box<dyn UploadSink>> {
        self.0.update(item_id, size, old_etag, ctx).await
    }

    async fn download(
        &self,
        item_id: &str,
        match_etag: &str,
        ctx: &Context,
    ) -> Result<Box<dyn DownloadSource>> {
        let source = self.0.download(item_id, match_etag, ctx).await?;
        let name = std::path::Path::new(item_id)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with("broken") {
            return Ok(Box::new(BrokenSource { sent: false }));
        }
        Ok(source)
    }

    async fn delete(&self, item_id: &str, ctx: &Context) -> Result<()> {
        self.0.delete(item_id, ctx).await
    }

    async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        ctx: &Context,
    ) -> Result<Item> {
        self.0.move_item(item_id, new_parent_id, new_name, ctx).await
    }

    async fn copy(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        ctx: &Context,
    ) -> Result<Item> {
        self.0.copy(item_id, new_parent_id, new_name, ctx).await
    }
}
