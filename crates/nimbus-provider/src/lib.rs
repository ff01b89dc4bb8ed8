//! Provider side of the storage RPC engine.
//!
//! A [`Server`] receives calls from the bus, resolves the account's
//! credentials and the caller's identity, and hands each call to a
//! [`Provider`] plugin. Uploads and downloads are driven by jobs that stream
//! bytes over a dedicated socket pair whose far end is passed to the client.

pub mod account;
pub mod channel;
pub mod context;
pub mod credentials_cache;
pub mod download;
pub mod handler;
pub mod inactivity;
mod interface;
pub mod jobs;
pub mod provider;
pub mod server;
pub mod state;
pub mod upload;

pub use account::{AccountData, Authenticator, FixedAuthenticator};
pub use context::Context;
pub use credentials_cache::{CredentialsCache, CredentialsSource, PeerCredentials};
pub use download::DownloadJob;
pub use inactivity::{Activity, InactivityTimer};
pub use jobs::{PendingJobs, TransferJob};
pub use provider::{DownloadSource, Provider, UploadSink};
pub use server::Server;
pub use state::JobStatus;
pub use upload::UploadJob;
