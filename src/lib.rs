//! Path-addressed storage driver over S3 and API-compatible object stores,
//! for a content-addressable artifact registry.
//!
//! The backend is a flat key/value namespace; directories are an abstraction
//! synthesized from key prefixes, so directory entries carry no modification
//! time. S3 guarantees read-after-write consistency for new objects only, no
//! read-after-update and no list-after-write consistency.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

mod config;
pub use config::S3Config;
mod errors;
pub use errors::{Error, Result};
pub(crate) mod s3;
pub use s3::S3;

/// Streaming object content returned by [`StorageDriver::reader`].
pub type ObjectBody = BoxStream<'static, Result<Bytes>>;

/// Metadata for a file or synthesized directory at a logical path.
///
/// Directories exist only as key prefixes in the backend, so directory
/// entries have no size and no modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
    pub is_dir: bool,
}

/// Options accepted by [`StorageDriver::url_for`].
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// HTTP method the URL should authorize; `GET` when unset. Only `GET`
    /// and `HEAD` are supported.
    pub method: Option<String>,
    /// Absolute instant at which the URL expires; 20 minutes from now when
    /// unset.
    pub expiry: Option<SystemTime>,
}

/// Returned by a walk callback to steer traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkDecision {
    /// Keep walking.
    Continue,
    /// On a directory entry: do not descend into it. On a file entry: end
    /// the walk gracefully.
    SkipDir,
}

/// Provides a hierarchical file-system style interface over a backend
/// object store. All paths are absolute, slash-delimited, and opaque beyond
/// the delimiter.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// The backend identifier of this driver implementation.
    fn name(&self) -> &'static str;

    /// Retrieve the full content stored at `path`.
    async fn get_content(&self, path: &str) -> Result<Bytes>;

    /// Store `content` at `path`, replacing any existing object.
    async fn put_content(&self, path: &str, content: Bytes) -> Result<()>;

    /// Open a content stream starting at `offset` bytes into the object. An
    /// offset at or past the end of the object yields an empty stream.
    async fn reader(&self, path: &str, offset: u64) -> Result<ObjectBody>;

    /// Return a [`FileWriter`] assembling content at `path`. With `append`
    /// the writer attaches to the most recent in-progress upload for the
    /// path, failing with [`Error::PathNotFound`] if there is none.
    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>>;

    /// Retrieve metadata for the file or directory at `path`. Cancelling
    /// `cancel_token` aborts the lookup with [`Error::Cancelled`].
    async fn stat(&self, cancel_token: &CancellationToken, path: &str) -> Result<FileInfo>;

    /// List the direct children of `path`: files first, then directories,
    /// each group in backend (lexicographic) order. Cancelling
    /// `cancel_token` aborts paging with [`Error::Cancelled`].
    async fn list(&self, cancel_token: &CancellationToken, path: &str) -> Result<Vec<String>>;

    /// Move the object at `source_path` to `dest_path`. Implemented as
    /// copy-then-delete; not atomic.
    async fn rename(&self, source_path: &str, dest_path: &str) -> Result<()>;

    /// Recursively delete everything at and under `path`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Issue a time-limited URL authorizing direct access to `path`.
    async fn url_for(&self, path: &str, options: UrlOptions) -> Result<String>;

    /// Traverse every file under `from` in sorted key order, synthesizing a
    /// directory event for each directory the sorted stream reveals before
    /// the files beneath it. Cancelling `cancel_token` aborts paging with
    /// [`Error::Cancelled`].
    async fn walk(
        &self,
        cancel_token: &CancellationToken,
        from: &str,
        f: &mut (dyn for<'a> FnMut(&'a FileInfo) -> Result<WalkDecision> + Send),
    ) -> Result<()>;
}

/// Buffered, resumable writer for a single logical path.
///
/// A writer is not safe for concurrent use; callers serialize access.
/// `close`, `commit`, and `cancel` are terminal: once one of them has run,
/// every later call fails with the matching `Already*` error.
#[async_trait]
pub trait FileWriter: Send {
    /// Append `buf` to the object being assembled, uploading buffered parts
    /// as they fill. Returns the number of bytes consumed.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Total bytes observed by this writer, including parts uploaded by the
    /// session this writer resumed.
    fn size(&self) -> u64;

    /// Flush buffered content and leave the upload in progress so a later
    /// writer can resume it.
    async fn close(&mut self) -> Result<()>;

    /// Abort the upload and discard all uploaded parts.
    async fn cancel(&mut self) -> Result<()>;

    /// Flush buffered content and finalize the object.
    async fn commit(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // validate object safety
    #[allow(dead_code)]
    struct Whatever {
        driver: Box<dyn StorageDriver>,
        writer: Box<dyn FileWriter>,
    }
}
