//! Provider backed by a directory tree on the local filesystem.
//!
//! Item ids are canonical absolute paths below the served root. Uploads are
//! staged in hidden temporary files next to their destination and published
//! atomically when the upload finishes.

mod download;
mod fsutil;
mod provider;
mod upload;

pub use fsutil::TMP_PREFIX;
pub use provider::{LocalProvider, ROOT_ENV};
