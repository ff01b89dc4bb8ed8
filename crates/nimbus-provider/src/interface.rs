//! Maps each RPC method onto the provider and the job registry.

use nimbus_core::{Call, Item, ItemMetadata, Message, PeerId, ReplyBody, Result, StorageError};
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::context::Context;
use crate::download::DownloadJob;
use crate::handler::Handler;
use crate::jobs::TransferJob;
use crate::provider::{DownloadSource, UploadSink};
use crate::state::JobStatus;
use crate::upload::UploadJob;

impl Handler {
    pub(crate) async fn invoke(
        self: Arc<Self>,
        sender: PeerId,
        call: Call,
        ctx: Context,
    ) -> Result<Message> {
        let provider = &self.provider;
        let body = match call {
            Call::Roots => ReplyBody::Items(envelopes(provider.roots(&ctx).await?)),
            Call::List {
                item_id,
                page_token,
            } => {
                let (items, next_page_token) = provider.list(&item_id, &page_token, &ctx).await?;
                ReplyBody::Page {
                    items: envelopes(items),
                    next_page_token,
                }
            }
            Call::Lookup { parent_id, name } => {
                ReplyBody::Items(envelopes(provider.lookup(&parent_id, &name, &ctx).await?))
            }
            Call::Metadata { item_id } => envelope(&provider.metadata(&item_id, &ctx).await?),
            Call::CreateFolder { parent_id, name } => {
                envelope(&provider.create_folder(&parent_id, &name, &ctx).await?)
            }
            Call::CreateFile {
                parent_id,
                name,
                size,
                content_type,
                allow_overwrite,
            } => {
                let size = declared_size(size)?;
                let sink = provider
                    .create_file(&parent_id, &name, size, &content_type, allow_overwrite, &ctx)
                    .await?;
                return self.start_upload(sender, size, sink);
            }
            Call::Update {
                item_id,
                size,
                old_etag,
            } => {
                let size = declared_size(size)?;
                let sink = provider.update(&item_id, size, &old_etag, &ctx).await?;
                return self.start_upload(sender, size, sink);
            }
            Call::FinishUpload { upload_id } => {
                let job = self.jobs.get_upload(&sender, &upload_id)?;
                let outcome = job.finish().await;
                if job.status().await != JobStatus::InProgress {
                    let _ = self.jobs.remove_upload(&sender, &upload_id);
                }
                envelope(&outcome?)
            }
            Call::CancelUpload { upload_id } => {
                self.jobs.remove_upload(&sender, &upload_id)?.cancel().await?;
                ReplyBody::Empty
            }
            Call::Download {
                item_id,
                match_etag,
            } => {
                let source = provider.download(&item_id, &match_etag, &ctx).await?;
                return self.start_download(sender, source);
            }
            Call::FinishDownload { download_id } => {
                let job = self.jobs.get_download(&sender, &download_id)?;
                let outcome = job.finish().await;
                if job.status().await != JobStatus::InProgress {
                    let _ = self.jobs.remove_download(&sender, &download_id);
                }
                outcome?;
                ReplyBody::Empty
            }
            Call::CancelDownload { download_id } => {
                self.jobs
                    .remove_download(&sender, &download_id)?
                    .cancel()
                    .await?;
                ReplyBody::Empty
            }
            Call::Delete { item_id } => {
                provider.delete(&item_id, &ctx).await?;
                ReplyBody::Empty
            }
            Call::Move {
                item_id,
                new_parent_id,
                new_name,
            } => envelope(
                &provider
                    .move_item(&item_id, &new_parent_id, &new_name, &ctx)
                    .await?,
            ),
            Call::Copy {
                item_id,
                new_parent_id,
                new_name,
            } => envelope(&provider.copy(&item_id, &new_parent_id, &new_name, &ctx).await?),
        };
        encode(&body)
    }

    fn start_upload(&self, sender: PeerId, size: u64, sink: Box<dyn UploadSink>) -> Result<Message> {
        let job = UploadJob::start(self.jobs.next_id(), sender, size, sink, self.chunk_size)?;
        let fd = job.take_client_end();
        self.hand_over(TransferJob::Upload(job), fd)
    }

    fn start_download(&self, sender: PeerId, source: Box<dyn DownloadSource>) -> Result<Message> {
        let job = DownloadJob::start(self.jobs.next_id(), sender, source, self.chunk_size)?;
        let fd = job.take_client_end();
        self.hand_over(TransferJob::Download(job), fd)
    }

    /// Register the job and attach the client's channel end to the reply. A
    /// peer that left while the job was being set up gets its jobs reclaimed
    /// here, since its disconnect may already have been processed.
    fn hand_over(&self, job: TransferJob, fd: Option<OwnedFd>) -> Result<Message> {
        let Some(fd) = fd else {
            tracing::error!("Job {}: channel end already handed out", job.id());
            return Err(StorageError::Unknown("transfer channel unavailable".to_string()));
        };
        let id = job.id().to_string();
        let peer = job.peer().clone();
        self.jobs.add(job);
        if !self.bus.is_connected(&peer) {
            self.jobs.on_peer_disconnected(&peer);
            return Err(StorageError::Cancelled(format!(
                "peer {peer} disconnected before job {id} started"
            )));
        }
        Ok(encode(&ReplyBody::Transfer { id })?.with_fd(fd))
    }
}

fn declared_size(size: i64) -> Result<u64> {
    u64::try_from(size)
        .map_err(|_| StorageError::InvalidArgument(format!("size must be non-negative, got {size}")))
}

fn envelope(item: &Item) -> ReplyBody {
    ReplyBody::Item(ItemMetadata::from(item))
}

fn envelopes(items: Vec<Item>) -> Vec<ItemMetadata> {
    items.iter().map(ItemMetadata::from).collect()
}

fn encode(body: &ReplyBody) -> Result<Message> {
    Message::encode(body).map_err(|e| StorageError::Unknown(format!("cannot encode reply: {e}")))
}
