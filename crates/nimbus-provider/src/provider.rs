use async_trait::async_trait;
use bytes::Bytes;
use nimbus_core::{Item, Result};

use crate::context::Context;

/// A storage backend plugged into the server.
///
/// Every operation receives the per-call [`Context`]. Failures must be
/// reported as `StorageError` values; the server never inspects anything
/// else.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Top-level items of the account.
    async fn roots(&self, ctx: &Context) -> Result<Vec<Item>>;

    /// One page of the children of `item_id`, plus the token for the next
    /// page (empty when this is the last one).
    async fn list(
        &self,
        item_id: &str,
        page_token: &str,
        ctx: &Context,
    ) -> Result<(Vec<Item>, String)>;

    /// Children of `parent_id` called `name`.
    async fn lookup(&self, parent_id: &str, name: &str, ctx: &Context) -> Result<Vec<Item>>;

    async fn metadata(&self, item_id: &str, ctx: &Context) -> Result<Item>;

    async fn create_folder(&self, parent_id: &str, name: &str, ctx: &Context) -> Result<Item>;

    /// Start a new file of exactly `size` bytes.
    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        size: u64,
        content_type: &str,
        allow_overwrite: bool,
        ctx: &Context,
    ) -> Result<Box<dyn UploadSink>>;

    /// Replace the contents of `item_id`, provided it still has `old_etag`.
    async fn update(
        &self,
        item_id: &str,
        size: u64,
        old_etag: &str,
        ctx: &Context,
    ) -> Result<Box<dyn UploadSink>>;

    /// Stream the contents of `item_id`. A non-empty `match_etag` must equal
    /// the current etag.
    async fn download(
        &self,
        item_id: &str,
        match_etag: &str,
        ctx: &Context,
    ) -> Result<Box<dyn DownloadSource>>;

    async fn delete(&self, item_id: &str, ctx: &Context) -> Result<()>;

    async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        ctx: &Context,
    ) -> Result<Item>;

    async fn copy(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: &str,
        ctx: &Context,
    ) -> Result<Item>;
}

/// Backend half of an upload. The server feeds it the received bytes.
#[async_trait]
pub trait UploadSink: Send {
    /// Append the next chunk of the payload.
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// All declared bytes arrived. Publish them and return the new item.
    async fn finish(&mut self) -> Result<Item>;

    /// Discard whatever was written.
    async fn cancel(&mut self) -> Result<()>;
}

/// Backend half of a download. The server pulls chunks until `None`.
#[async_trait]
pub trait DownloadSource: Send {
    /// Next chunk of at most `max` bytes, or `None` once the payload is done.
    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>>;

    async fn cancel(&mut self) -> Result<()>;
}
