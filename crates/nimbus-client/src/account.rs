use nimbus_core::{Call, Message, Result};
use std::sync::Arc;

use crate::downloader::Downloader;
use crate::job::{AsyncJob, ItemJob, ItemListJob, VoidJob};
use crate::reply::{expect_empty, expect_item, expect_items, expect_page, expect_some_items};
use crate::runtime::{Runtime, RuntimeHandle};
use crate::uploader::Uploader;

/// Calls into one provider, identified by its bus name.
///
/// Every operation returns immediately with a job; nothing is sent until
/// the job's task runs on the Tokio runtime.
#[derive(Clone)]
pub struct AccountClient {
    runtime: RuntimeHandle,
    service: Arc<str>,
}

impl AccountClient {
    pub(crate) fn new(runtime: Runtime, service: String) -> Self {
        Self {
            runtime: runtime.handle(),
            service: service.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    fn pending(
        &self,
        method: &'static str,
        call: Call,
    ) -> impl Future<Output = Result<Message>> + Send + use<> {
        let runtime = self.runtime.clone();
        let service = Arc::clone(&self.service);
        async move { runtime.call(method, &service, &call).await }
    }

    fn item_job(&self, method: &'static str, call: Call) -> ItemJob {
        let reply = self.pending(method, call);
        AsyncJob::spawn(method, async move { expect_item(method, &reply.await?) })
    }

    fn items_job(&self, method: &'static str, call: Call) -> ItemListJob {
        let reply = self.pending(method, call);
        AsyncJob::spawn(method, async move { expect_items(method, &reply.await?) })
    }

    pub fn roots(&self) -> ItemListJob {
        self.items_job("roots()", Call::Roots)
    }

    /// Every child of `folder_id`. Pages are fetched one after another and
    /// concatenated in order.
    pub fn list(&self, folder_id: &str) -> ItemListJob {
        const METHOD: &str = "list()";
        let runtime = self.runtime.clone();
        let service = Arc::clone(&self.service);
        let item_id = folder_id.to_string();
        AsyncJob::spawn(METHOD, async move {
            let mut items = Vec::new();
            let mut page_token = String::new();
            loop {
                let call = Call::List {
                    item_id: item_id.clone(),
                    page_token,
                };
                let reply = runtime.call(METHOD, &service, &call).await?;
                let (page, next) = expect_page(METHOD, &reply)?;
                tracing::debug!("{METHOD}: {} item(s) from {item_id}", page.len());
                items.extend(page);
                if next.is_empty() {
                    return Ok(items);
                }
                page_token = next;
            }
        })
    }

    /// Items called `name` in `parent_id`. A provider that answers with no
    /// items at all breaks the contract and yields `LocalComms`.
    pub fn lookup(&self, parent_id: &str, name: &str) -> ItemListJob {
        const METHOD: &str = "lookup()";
        let reply = self.pending(
            METHOD,
            Call::Lookup {
                parent_id: parent_id.to_string(),
                name: name.to_string(),
            },
        );
        AsyncJob::spawn(METHOD, async move { expect_some_items(METHOD, &reply.await?) })
    }

    pub fn metadata(&self, item_id: &str) -> ItemJob {
        self.item_job(
            "metadata()",
            Call::Metadata {
                item_id: item_id.to_string(),
            },
        )
    }

    pub fn create_folder(&self, parent_id: &str, name: &str) -> ItemJob {
        self.item_job(
            "create_folder()",
            Call::CreateFolder {
                parent_id: parent_id.to_string(),
                name: name.to_string(),
            },
        )
    }

    /// Start uploading a new file of exactly `size` bytes.
    pub fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        size: i64,
        content_type: &str,
        allow_overwrite: bool,
    ) -> Uploader {
        const METHOD: &str = "create_file()";
        let call = Call::CreateFile {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            size,
            content_type: content_type.to_string(),
            allow_overwrite,
        };
        Uploader::start(
            METHOD,
            Arc::clone(&self.service),
            self.runtime.clone(),
            size,
            self.pending(METHOD, call),
        )
    }

    /// Start replacing the content of `item_id`. With a non-empty
    /// `old_etag` the provider refuses to publish over a changed file.
    pub fn update(&self, item_id: &str, size: i64, old_etag: &str) -> Uploader {
        const METHOD: &str = "update()";
        let call = Call::Update {
            item_id: item_id.to_string(),
            size,
            old_etag: old_etag.to_string(),
        };
        Uploader::start(
            METHOD,
            Arc::clone(&self.service),
            self.runtime.clone(),
            size,
            self.pending(METHOD, call),
        )
    }

    pub fn download(&self, item_id: &str, match_etag: &str) -> Downloader {
        const METHOD: &str = "download()";
        let call = Call::Download {
            item_id: item_id.to_string(),
            match_etag: match_etag.to_string(),
        };
        Downloader::start(
            METHOD,
            Arc::clone(&self.service),
            self.runtime.clone(),
            self.pending(METHOD, call),
        )
    }

    pub fn delete(&self, item_id: &str) -> VoidJob {
        const METHOD: &str = "delete()";
        let call = Call::Delete {
            item_id: item_id.to_string(),
        };
        let reply = self.pending(METHOD, call);
        AsyncJob::spawn(METHOD, async move { expect_empty(METHOD, &reply.await?) })
    }

    pub fn move_item(&self, item_id: &str, new_parent_id: &str, new_name: &str) -> ItemJob {
        self.item_job(
            "move_item()",
            Call::Move {
                item_id: item_id.to_string(),
                new_parent_id: new_parent_id.to_string(),
                new_name: new_name.to_string(),
            },
        )
    }

    pub fn copy(&self, item_id: &str, new_parent_id: &str, new_name: &str) -> ItemJob {
        self.item_job(
            "copy()",
            Call::Copy {
                item_id: item_id.to_string(),
                new_parent_id: new_parent_id.to_string(),
                new_name: new_name.to_string(),
            },
        )
    }
}
