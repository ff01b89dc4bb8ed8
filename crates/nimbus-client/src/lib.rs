//! Client side of the storage RPC engine.
//!
//! A [`Runtime`] wraps a bus connection. Each provider call made through an
//! [`AccountClient`] returns a job that settles exactly once. Uploads and
//! downloads return an [`Uploader`] or [`Downloader`] that streams bytes over
//! the channel handed out by the provider.

mod account;
mod downloader;
mod job;
mod reply;
mod runtime;
mod transfer;
mod uploader;
mod validate;

pub use account::AccountClient;
pub use downloader::Downloader;
pub use job::{AsyncJob, ItemJob, ItemListJob, JobStatus, VoidJob};
pub use runtime::Runtime;
pub use transfer::TransferStatus;
pub use uploader::Uploader;
