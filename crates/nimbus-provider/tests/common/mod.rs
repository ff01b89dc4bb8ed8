#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_core::config::ProviderSettings;
use nimbus_core::{
    Bus, Call, CallError, Connection, Credentials, Item, ItemType, Message, MetadataValue,
    PeerInfo, ReplyBody, Result, StorageError,
};
use nimbus_provider::{
    AccountData, Authenticator, Context, DownloadSource, PendingJobs, Provider, Server,
    UploadSink,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const SERVICE: &str = "com.nimbus.Test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("nimbus=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

pub fn file_item(id: &str, parent: &str, size: i64, etag: &str) -> Item {
    let mut metadata = BTreeMap::new();
    metadata.insert("size_in_bytes".to_string(), MetadataValue::Int(size));
    metadata.insert(
        "last_modified_time".to_string(),
        MetadataValue::Str("2024-05-01T10:00:00Z".to_string()),
    );
    Item {
        item_id: id.to_string(),
        parent_ids: vec![parent.to_string()],
        name: id.to_string(),
        etag: etag.to_string(),
        item_type: ItemType::File,
        metadata,
    }
}

pub fn folder_item(id: &str, parent: &str) -> Item {
    Item {
        item_id: id.to_string(),
        parent_ids: vec![parent.to_string()],
        name: id.to_string(),
        etag: String::new(),
        item_type: ItemType::Folder,
        metadata: BTreeMap::new(),
    }
}

pub fn root_item() -> Item {
    Item {
        item_id: "root".to_string(),
        parent_ids: Vec::new(),
        name: "Root".to_string(),
        etag: String::new(),
        item_type: ItemType::Root,
        metadata: BTreeMap::new(),
    }
}

/// Provider whose behaviour is keyed on item ids.
#[derive(Default)]
pub struct ScriptedProvider {
    pub metadata_calls: Mutex<Vec<String>>,
    pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub upload_cancels: Arc<AtomicUsize>,
    pub contexts: Mutex<Vec<Context>>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn roots(&self, _ctx: &Context) -> Result<Vec<Item>> {
        Ok(vec![root_item()])
    }

    async fn list(
        &self,
        item_id: &str,
        page_token: &str,
        _ctx: &Context,
    ) -> Result<(Vec<Item>, String)> {
        match (item_id, page_token) {
            ("root", "") => Ok((
                vec![file_item("a", "root", 1, "1"), file_item("b", "root", 2, "1")],
                "p1".to_string(),
            )),
            ("root", "p1") => Ok((vec![folder_item("c", "root")], String::new())),
            ("root", other) => Err(StorageError::InvalidArgument(format!(
                "bad page token {other}"
            ))),
            (other, _) => Err(StorageError::not_exists("no such folder", other)),
        }
    }

    async fn lookup(&self, parent_id: &str, name: &str, _ctx: &Context) -> Result<Vec<Item>> {
        Ok(vec![folder_item(name, parent_id)])
    }

    async fn metadata(&self, item_id: &str, ctx: &Context) -> Result<Item> {
        self.metadata_calls.lock().unwrap().push(item_id.to_string());
        self.contexts.lock().unwrap().push(ctx.clone());
        match item_id {
            "expired" => Err(StorageError::Unauthorized("token expired".into())),
            "panic" => panic!("provider bug"),
            _ => Ok(file_item(item_id, "root", 0, "1")),
        }
    }

    async fn create_folder(&self, parent_id: &str, name: &str, _ctx: &Context) -> Result<Item> {
        Ok(folder_item(name, parent_id))
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        _size: u64,
        _content_type: &str,
        _allow_overwrite: bool,
        _ctx: &Context,
    ) -> Result<Box<dyn UploadSink>> {
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            parent: parent_id.to_string(),
            data: Vec::new(),
            files: Arc::clone(&self.files),
            cancels: Arc::clone(&self.upload_cancels),
        }))
    }

    async fn update(
        &self,
        item_id: &str,
        _size: u64,
        old_etag: &str,
        _ctx: &Context,
    ) -> Result<Box<dyn UploadSink>> {
        if old_etag != "1" {
            return Err(StorageError::Conflict(format!("{item_id} has changed")));
        }
        self.create_file("root", item_id, 0, "", true, _ctx).await
    }

    async fn download(
        &self,
        item_id: &str,
        _match_etag: &str,
        _ctx: &Context,
    ) -> Result<Box<dyn DownloadSource>> {
        let chunks: VecDeque<Result<Option<Bytes>>> = match item_id {
            "broken" => vec![
                Ok(Some(Bytes::from_static(b"first part"))),
                Err(StorageError::resource("backend read failed", 5)),
            ]
            .into(),
            other => {
                let data = self
                    .files
                    .lock()
                    .unwrap()
                    .get(other)
                    .cloned()
                    .ok_or_else(|| StorageError::not_exists("no such file", other))?;
                vec![Ok(Some(Bytes::from(data))), Ok(None)].into()
            }
        };
        Ok(Box::new(ScriptedSource { chunks }))
    }

    async fn delete(&self, item_id: &str, _ctx: &Context) -> Result<()> {
        if item_id == "root" {
            return Err(StorageError::PermissionDenied("cannot delete root".into()));
        }
        Ok(())
    }

    async fn move_item(
        &self,
        _item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        _ctx: &Context,
    ) -> Result<Item> {
        Ok(folder_item(new_name, new_parent_id))
    }

    async fn copy(
        &self,
        _item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        _ctx: &Context,
    ) -> Result<Item> {
        Ok(folder_item(new_name, new_parent_id))
    }
}

pub struct MemorySink {
    name: String,
    parent: String,
    data: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl UploadSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<Item> {
        let size = self.data.len() as i64;
        self.files
            .lock()
            .unwrap()
            .insert(self.name.clone(), std::mem::take(&mut self.data));
        Ok(file_item(&self.name, &self.parent, size, "2"))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedSource {
    chunks: VecDeque<Result<Option<Bytes>>>,
}

#[async_trait]
impl DownloadSource for ScriptedSource {
    async fn read_chunk(&mut self, _max: usize) -> Result<Option<Bytes>> {
        self.chunks.pop_front().unwrap_or(Ok(None))
    }

    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Authenticator that lets through one authentication per permit.
pub struct GatedAuthenticator {
    pub permits: Semaphore,
    pub calls: Mutex<Vec<bool>>,
}

impl GatedAuthenticator {
    pub fn new(initial_permits: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(initial_permits),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Authenticator for GatedAuthenticator {
    async fn authenticate(&self, interactive: bool) -> Result<Credentials> {
        self.calls.lock().unwrap().push(interactive);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StorageError::Unauthorized("gate closed".into()))?;
        permit.forget();
        Ok(Credentials::OAuth2 {
            access_token: "token".into(),
        })
    }
}

pub struct Harness {
    pub bus: Bus,
    pub provider: Arc<ScriptedProvider>,
    pub jobs: Arc<PendingJobs>,
    pub account: Arc<AccountData>,
    server: JoinHandle<()>,
}

impl Harness {
    pub fn start(authenticator: Arc<dyn Authenticator>) -> Self {
        Self::start_with(authenticator, ProviderSettings::default())
    }

    pub fn start_with(authenticator: Arc<dyn Authenticator>, mut settings: ProviderSettings) -> Self {
        init_tracing();
        settings.service_name = SERVICE.to_string();
        let bus = Bus::new();
        let provider = Arc::new(ScriptedProvider::default());
        let server = Server::new(&bus, provider.clone(), authenticator, &settings).unwrap();
        let jobs = server.jobs();
        let account = server.account();
        Self {
            bus,
            provider,
            jobs,
            account,
            server: server.spawn(),
        }
    }

    /// Whether the server loop is still running.
    pub fn is_serving(&self) -> bool {
        !self.server.is_finished()
    }

    pub fn connect(&self) -> Connection {
        self.bus
            .connect(PeerInfo::new(1000, 4321, "/usr/bin/test-app (enforce)"))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub async fn call(conn: &Connection, call: &Call) -> std::result::Result<Message, CallError> {
    conn.call(SERVICE, Message::encode(call).unwrap()).await
}

pub async fn call_ok(conn: &Connection, c: &Call) -> (ReplyBody, Message) {
    let message = call(conn, c).await.unwrap();
    (message.decode().unwrap(), message)
}

pub async fn call_err(conn: &Connection, c: &Call) -> StorageError {
    match call(conn, c).await {
        Err(CallError::Remote(wire)) => wire.into_storage_error(),
        other => panic!("expected an error reply, got {other:?}"),
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
