use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::operation::create_multipart_upload::builders::CreateMultipartUploadFluentBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectCannedAcl, ObjectIdentifier,
    ServerSideEncryption, StorageClass,
};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) mod logging;
mod writer;
use writer::{UploadedPart, Writer};

use crate::config::S3Config;
use crate::errors::{parse_error, Error, Result};
use crate::{FileInfo, FileWriter, ObjectBody, StorageDriver, UrlOptions, WalkDecision};

const DRIVER_NAME: &str = "s3aws";

/// The largest number of objects a single backend list call can return,
/// and the batch ceiling for DeleteObjects.
const LIST_MAX: i32 = 1000;

const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(20 * 60);

const OCTET_STREAM: &str = "application/octet-stream";

/// Storage driver backed by an S3 bucket. Objects are stored at keys formed
/// from the logical path under the configured root directory.
#[derive(Clone)]
pub struct S3 {
    client: Client,
    bucket: String,
    chunk_size: u64,
    multipart_copy_chunk_size: u64,
    multipart_copy_max_concurrency: usize,
    multipart_copy_threshold_size: u64,
    root_directory: String,
    storage_class: Option<StorageClass>,
    object_acl: ObjectCannedAcl,
    encrypt: bool,
    key_id: Option<String>,
}

impl S3 {
    pub(crate) fn new(client: Client, config: &S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            chunk_size: config.chunk_size,
            multipart_copy_chunk_size: config.multipart_copy_chunk_size,
            multipart_copy_max_concurrency: config.multipart_copy_max_concurrency as usize,
            multipart_copy_threshold_size: config.multipart_copy_threshold_size,
            root_directory: config.root_directory.clone(),
            storage_class: config.parsed_storage_class(),
            object_acl: config.parsed_object_acl(),
            encrypt: config.encrypt,
            key_id: (!config.key_id.is_empty()).then(|| config.key_id.clone()),
        }
    }

    /// The object key a logical path maps to.
    fn s3_key(&self, path: &str) -> String {
        let root = self.root_directory.trim_end_matches('/');
        format!("{root}{path}")
            .trim_start_matches('/')
            .to_string()
    }

    /// The bucket key for the given storage path.
    pub fn s3_bucket_key(&self, path: &str) -> String {
        self.s3_key(path)
    }

    /// With an empty root directory there is no key prefix to strip from
    /// listing results, so synthesized paths gain a leading `/` to stay
    /// absolute.
    fn result_prefix(&self) -> &'static str {
        if self.s3_key("").is_empty() {
            "/"
        } else {
            ""
        }
    }

    /// Logical path for a key returned by a listing.
    fn logical_path(&self, key: &str) -> String {
        key.replacen(&self.s3_key(""), self.result_prefix(), 1)
    }

    fn encryption_mode(&self) -> Option<ServerSideEncryption> {
        if !self.encrypt {
            return None;
        }
        match self.key_id {
            None => Some(ServerSideEncryption::Aes256),
            Some(_) => Some(ServerSideEncryption::AwsKms),
        }
    }

    fn sse_kms_key_id(&self) -> Option<String> {
        self.key_id.clone()
    }

    /// A CreateMultipartUpload request carrying the full object metadata
    /// set. Shared by the writer and the copy path.
    pub(crate) fn create_multipart_upload_request(
        &self,
        key: &str,
    ) -> CreateMultipartUploadFluentBuilder {
        self.client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(OCTET_STREAM)
            .acl(self.object_acl.clone())
            .set_storage_class(self.storage_class.clone())
            .set_server_side_encryption(self.encryption_mode())
            .set_ssekms_key_id(self.sse_kms_key_id())
    }

    /// Copy the object at `source_path` to `dest_path`. Objects at or below
    /// the multipart threshold go through a single server-side copy; larger
    /// objects are copied as concurrent part-range copies.
    async fn copy(&self, source_path: &str, dest_path: &str) -> Result<()> {
        let info = self.stat(&CancellationToken::new(), source_path).await?;

        if info.size <= self.multipart_copy_threshold_size {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .key(self.s3_key(dest_path))
                .content_type(OCTET_STREAM)
                .acl(self.object_acl.clone())
                .set_storage_class(self.storage_class.clone())
                .set_server_side_encryption(self.encryption_mode())
                .set_ssekms_key_id(self.sse_kms_key_id())
                .copy_source(format!("{}/{}", self.bucket, self.s3_key(source_path)))
                .send()
                .await
                .map_err(|err| parse_error(source_path, err))?;
            return Ok(());
        }

        let create = self
            .create_multipart_upload_request(&self.s3_key(dest_path))
            .send()
            .await?;
        let upload_id = create
            .upload_id()
            .map(String::from)
            .ok_or(Error::FailedToInitiateMultipartUpload("missing upload id"))?;

        let num_parts = info.size.div_ceil(self.multipart_copy_chunk_size) as usize;
        debug!(
            source = %source_path,
            dest = %dest_path,
            size = info.size,
            num_parts,
            "copying object in parts"
        );

        let semaphore = Arc::new(Semaphore::new(self.multipart_copy_max_concurrency));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<CompletedPart>)>(num_parts);

        for index in 0..num_parts {
            let driver = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let source_key = self.s3_key(source_path);
            let dest_key = self.s3_key(dest_path);
            let upload_id = upload_id.clone();
            let chunk_size = self.multipart_copy_chunk_size;
            let total_size = info.size;
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let result = driver
                    .copy_part(&source_key, &dest_key, &upload_id, index, chunk_size, total_size)
                    .await;
                tx.send((index, result)).await.ok();
            });
        }
        drop(tx);

        // The first error wins and ends the copy; part copies still in
        // flight keep running against the backend and the destination
        // upload is left behind unaborted.
        let mut completed: Vec<Option<CompletedPart>> = vec![None; num_parts];
        for _ in 0..num_parts {
            match rx.recv().await {
                Some((index, result)) => completed[index] = Some(result?),
                None => break,
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.s3_key(dest_path))
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed.into_iter().flatten().collect()))
                    .build(),
            )
            .send()
            .await?;
        Ok(())
    }

    async fn copy_part(
        &self,
        source_key: &str,
        dest_key: &str,
        upload_id: &str,
        index: usize,
        chunk_size: u64,
        total_size: u64,
    ) -> Result<CompletedPart> {
        let part_number = index as i32 + 1;
        let resp = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .key(dest_key)
            .part_number(part_number)
            .upload_id(upload_id)
            .copy_source_range(copy_source_range(index as u64, chunk_size, total_size))
            .send()
            .await?;
        let mut builder = CompletedPart::builder().part_number(part_number);
        if let Some(etag) = resp.copy_part_result().and_then(|result| result.e_tag()) {
            builder = builder.e_tag(etag);
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl StorageDriver for S3 {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn get_content(&self, path: &str) -> Result<Bytes> {
        let mut stream = self.reader(path, 0).await?;
        let mut content = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content.freeze())
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.s3_key(path))
            .content_type(OCTET_STREAM)
            .acl(self.object_acl.clone())
            .set_storage_class(self.storage_class.clone())
            .set_server_side_encryption(self.encryption_mode())
            .set_ssekms_key_id(self.sse_kms_key_id())
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|err| parse_error(path, err))?;
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<ObjectBody> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.s3_key(path))
            .range(format!("bytes={offset}-"))
            .send()
            .await;
        match resp {
            Ok(output) => {
                let stream = ReaderStream::new(output.body.into_async_read()).map_err(Error::from);
                Ok(stream.boxed())
            }
            // an offset at or past the end of the object is an empty read,
            // not an error
            Err(err) if err.code() == Some("InvalidRange") => {
                Ok(futures::stream::empty().boxed())
            }
            Err(err) => Err(parse_error(path, err)),
        }
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>> {
        let key = self.s3_key(path);

        if !append {
            let resp = self.create_multipart_upload_request(&key).send().await?;
            let upload_id = resp
                .upload_id()
                .map(String::from)
                .ok_or(Error::FailedToInitiateMultipartUpload("missing upload id"))?;
            return Ok(Box::new(Writer::new(self.clone(), key, upload_id, Vec::new())));
        }

        let resp = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(&key)
            .send()
            .await
            .map_err(|err| parse_error(path, err))?;

        for upload in resp.uploads() {
            if upload.key() != Some(key.as_str()) {
                continue;
            }
            let upload_id = upload
                .upload_id()
                .map(String::from)
                .ok_or(Error::FailedToInitiateMultipartUpload("missing upload id"))?;
            let parts_resp = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|err| parse_error(path, err))?;
            let parts: Vec<UploadedPart> = parts_resp
                .parts()
                .iter()
                .map(|part| UploadedPart {
                    etag: part.e_tag().map(String::from),
                    part_number: part.part_number().unwrap_or_default(),
                    size: part.size().unwrap_or(0).max(0) as u64,
                })
                .collect();
            return Ok(Box::new(Writer::new(self.clone(), key, upload_id, parts)));
        }

        Err(Error::PathNotFound {
            path: path.to_string(),
        })
    }

    async fn stat(&self, cancel_token: &CancellationToken, path: &str) -> Result<FileInfo> {
        if cancel_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let key = self.s3_key(path);

        if let Ok(resp) = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            if let Some(length) = resp.content_length() {
                return Ok(FileInfo {
                    path: path.to_string(),
                    size: length.max(0) as u64,
                    mod_time: to_system_time(resp.last_modified()),
                    is_dir: false,
                });
            }
        }

        if cancel_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // no object at the exact key; a single listed descendant means the
        // path exists as a directory prefix
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&key)
            .max_keys(1)
            .send()
            .await?;

        if let [object] = resp.contents() {
            if object.key() != Some(key.as_str()) {
                return Ok(FileInfo {
                    path: path.to_string(),
                    size: 0,
                    mod_time: None,
                    is_dir: true,
                });
            }
            return Ok(FileInfo {
                path: path.to_string(),
                size: object.size().unwrap_or(0).max(0) as u64,
                mod_time: to_system_time(object.last_modified()),
                is_dir: false,
            });
        }
        if resp.common_prefixes().len() == 1 {
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                mod_time: None,
                is_dir: true,
            });
        }

        Err(Error::PathNotFound {
            path: path.to_string(),
        })
    }

    async fn list(&self, cancel_token: &CancellationToken, opath: &str) -> Result<Vec<String>> {
        let mut path = opath.to_string();
        if path != "/" && !path.ends_with('/') {
            path.push('/');
        }

        let key_prefix = self.s3_key(&path);
        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            if cancel_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .delimiter("/")
                .max_keys(LIST_MAX);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|err| parse_error(opath, err))?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    files.push(self.logical_path(key));
                }
            }
            for common_prefix in resp.common_prefixes() {
                if let Some(dir) = common_prefix.prefix() {
                    directories.push(self.logical_path(dir.trim_end_matches('/')));
                }
            }

            if !resp.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = resp.next_continuation_token().map(String::from);
            if continuation_token.is_none() {
                break;
            }
        }

        if opath != "/" && files.is_empty() && directories.is_empty() {
            // an empty response means a missing directory, since the
            // backend has no directory entities to stat
            return Err(Error::PathNotFound {
                path: opath.to_string(),
            });
        }

        files.append(&mut directories);
        Ok(files)
    }

    async fn rename(&self, source_path: &str, dest_path: &str) -> Result<()> {
        // the backend has no native move
        self.copy(source_path, dest_path).await?;
        self.delete(source_path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut keys: Vec<String> = Vec::new();

        let stat = self.stat(&CancellationToken::new(), path).await?;
        if !stat.is_dir {
            keys.push(self.s3_key(path));
        }

        // enumerate the subtree; no delimiter, so descendants come back in
        // one flat sorted stream
        let prefix = format!("{}/", self.s3_key(path));
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .max_keys(LIST_MAX);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            // a listing failure ends enumeration with whatever was
            // collected so far
            let Ok(resp) = request.send().await else { break };
            if resp.contents().is_empty() {
                break;
            }
            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|object| object.key().map(String::from)),
            );
            if !resp.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = resp.next_continuation_token().map(String::from);
            if continuation_token.is_none() {
                break;
            }
        }

        if keys.is_empty() {
            return Err(Error::PathNotFound {
                path: path.to_string(),
            });
        }

        for batch in keys.chunks(LIST_MAX as usize) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let resp = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(
                    Delete::builder()
                        .set_objects(Some(objects))
                        .quiet(false)
                        .build()?,
                )
                .send()
                .await?;
            if let Some(first) = resp.errors().first() {
                return Err(Error::BatchDeleteFailed(
                    first.code().unwrap_or("unknown").to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn url_for(&self, path: &str, options: UrlOptions) -> Result<String> {
        let method = options.method.as_deref().unwrap_or("GET");
        if method != "GET" && method != "HEAD" {
            return Err(Error::UnsupportedMethod(method.to_string()));
        }

        let expires_in = options
            .expiry
            .map(|expiry| {
                expiry
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
            })
            .unwrap_or(DEFAULT_URL_EXPIRY);
        let presigning = PresigningConfig::expires_in(expires_in)?;

        let key = self.s3_key(path);
        let presigned = match method {
            "GET" => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(presigning)
                .await
                .map_err(|err| parse_error(path, err))?,
            _ => self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(presigning)
                .await
                .map_err(|err| parse_error(path, err))?,
        };
        Ok(presigned.uri().to_string())
    }

    async fn walk(
        &self,
        cancel_token: &CancellationToken,
        from: &str,
        f: &mut (dyn for<'a> FnMut(&'a FileInfo) -> Result<WalkDecision> + Send),
    ) -> Result<()> {
        let mut path = from.to_string();
        if !path.ends_with('/') {
            path.push('/');
        }

        let key_prefix = self.s3_key(&path);
        debug!(prefix = %key_prefix, "walking flat object listing");

        // With the delimiter omitted the backend lists every key under the
        // prefix recursively, in sorted depth-first order, so directories
        // can be inferred by comparing each object path with the last one.
        let mut state = WalkState::new(format!("{}{}", self.result_prefix(), key_prefix));
        let mut continuation_token: Option<String> = None;

        loop {
            if cancel_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .max_keys(LIST_MAX);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|err| parse_error(from, err))?;

            let files: Vec<FileInfo> = resp
                .contents()
                .iter()
                .filter_map(|object| {
                    let key = object.key()?;
                    Some(FileInfo {
                        path: self.logical_path(key),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        mod_time: to_system_time(object.last_modified()),
                        is_dir: false,
                    })
                })
                .collect();

            if state.dispatch_page(files, f)?.is_break() {
                return Ok(());
            }

            if !resp.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = resp.next_continuation_token().map(String::from);
            if continuation_token.is_none() {
                break;
            }
        }

        // there is no empty-directory concept, so a walk that saw nothing
        // means the path does not exist
        if state.emitted == 0 {
            return Err(Error::PathNotFound {
                path: from.to_string(),
            });
        }
        Ok(())
    }
}

/// Traversal state carried across listing pages during a walk.
struct WalkState {
    /// most recent directory reported, for de-duplicating inferred
    /// directories
    prev_dir: String,
    /// most recent skipped directory; events under it are dropped
    prev_skip_dir: Option<String>,
    emitted: u64,
}

impl WalkState {
    fn new(prev_dir: String) -> Self {
        Self {
            prev_dir,
            prev_skip_dir: None,
            emitted: 0,
        }
    }

    /// Synthesize directory events for one page of sorted file entries and
    /// dispatch everything to the callback, shallower directories first.
    fn dispatch_page(
        &mut self,
        files: Vec<FileInfo>,
        f: &mut (dyn FnMut(&FileInfo) -> Result<WalkDecision> + Send),
    ) -> Result<ControlFlow<()>> {
        let mut events: Vec<FileInfo> = Vec::with_capacity(files.len());
        for file in files {
            for dir in directory_diff(&self.prev_dir, &file.path) {
                events.push(FileInfo {
                    path: dir.clone(),
                    size: 0,
                    mod_time: None,
                    is_dir: true,
                });
                self.prev_dir = dir;
            }
            events.push(file);
        }

        for event in events {
            if let Some(skip) = &self.prev_skip_dir {
                if event.path.starts_with(skip.as_str()) {
                    continue;
                }
            }
            let decision = f(&event);
            self.emitted += 1;
            match decision? {
                WalkDecision::Continue => {}
                WalkDecision::SkipDir => {
                    if event.is_dir {
                        self.prev_skip_dir = Some(event.path);
                    } else {
                        // skip on a file ends the walk gracefully
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Directories on `current`'s ancestor chain that are not already on
/// `prev`'s chain, shallowest first.
///
/// ```text
/// directory_diff("/path/to/folder", "/path/to/folder/folder/file")
///   -> ["/path/to/folder/folder"]
/// directory_diff("/path/to/folder/folder1", "/path/to/folder/folder2/file")
///   -> ["/path/to/folder/folder2"]
/// directory_diff("/", "/path/to/folder/folder/file")
///   -> ["/path", "/path/to", "/path/to/folder", "/path/to/folder/folder"]
/// ```
///
/// Returns nothing for an empty `prev`, although the walk never produces
/// one: `prev_dir` is seeded with the listing prefix.
fn directory_diff(prev: &str, current: &str) -> Vec<String> {
    let mut paths = Vec::new();
    if prev.is_empty() || current.is_empty() {
        return paths;
    }

    // the ancestor test is separator-bounded so a sibling like "/a/foo.bar"
    // does not pass for an ancestor of "/a/foo/x"
    let mut parent = parent_dir(current);
    while parent != "/" && parent != prev && !prev.starts_with(&format!("{parent}/")) {
        paths.push(parent.clone());
        parent = parent_dir(&parent);
    }
    paths.reverse();
    paths
}

/// Parent of a slash-delimited path; `/` once the chain is exhausted.
fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

/// Byte range covered by one part of a multipart copy.
fn copy_source_range(part: u64, chunk_size: u64, total_size: u64) -> String {
    let first_byte = part * chunk_size;
    let last_byte = (first_byte + chunk_size - 1).min(total_size - 1);
    format!("bytes={first_byte}-{last_byte}")
}

fn to_system_time(datetime: Option<&DateTime>) -> Option<SystemTime> {
    datetime.map(|datetime| {
        SystemTime::UNIX_EPOCH
            + Duration::new(datetime.secs().max(0) as u64, datetime.subsec_nanos())
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use aws_config::BehaviorVersion;
    use aws_credential_types::provider::SharedCredentialsProvider;
    use aws_credential_types::Credentials;
    use aws_sdk_s3::config::Region;

    use super::*;

    pub(crate) fn test_driver(root: &str) -> S3 {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                "access", "secret", None, None, "tests",
            )))
            .build();
        S3 {
            client: Client::from_conf(config),
            bucket: "test-bucket".to_string(),
            chunk_size: 10 << 20,
            multipart_copy_chunk_size: 32 << 20,
            multipart_copy_max_concurrency: 100,
            multipart_copy_threshold_size: 32 << 20,
            root_directory: root.to_string(),
            storage_class: Some(StorageClass::Standard),
            object_acl: ObjectCannedAcl::Private,
            encrypt: false,
            key_id: None,
        }
    }

    #[test]
    fn key_mapping() {
        let cases = [
            ("", "/a/b", "a/b"),
            ("/", "/a/b", "a/b"),
            ("/r", "/a/b", "r/a/b"),
            ("r", "/a/b", "r/a/b"),
            ("r/", "/a/b", "r/a/b"),
            ("/r/s", "/a/b", "r/s/a/b"),
            ("", "", ""),
            ("/", "", ""),
            ("/r", "", "r"),
        ];
        for (root, path, expected) in cases {
            assert_eq!(test_driver(root).s3_key(path), expected, "root {root:?}");
        }
    }

    #[test]
    fn logical_path_round_trip() {
        let driver = test_driver("");
        assert_eq!(driver.logical_path("a/b"), "/a/b");

        let driver = test_driver("/r");
        assert_eq!(driver.logical_path("r/a/b"), "/a/b");
        assert_eq!(driver.s3_key(&driver.logical_path("r/a/b")), "r/a/b");
    }

    #[test]
    fn directory_diff_cases() {
        let cases: [(&str, &str, &[&str]); 7] = [
            ("/path/to/folder", "/path/to/folder/folder/file", &[
                "/path/to/folder/folder",
            ]),
            ("/path/to/folder/folder1", "/path/to/folder/folder2/file", &[
                "/path/to/folder/folder2",
            ]),
            (
                "/path/to/folder/folder1/file",
                "/path/to/folder/folder2/file",
                &["/path/to/folder/folder2"],
            ),
            (
                "/path/to/folder/folder1/file",
                "/path/to/folder/folder2/folder1/file",
                &["/path/to/folder/folder2", "/path/to/folder/folder2/folder1"],
            ),
            ("/", "/path/to/folder/folder/file", &[
                "/path",
                "/path/to",
                "/path/to/folder",
                "/path/to/folder/folder",
            ]),
            // "." sorts before "/", so a punctuation-named sibling precedes
            // the directory it is a character-extension of; it must not pass
            // for that directory's ancestor
            ("/a/foo.bar", "/a/foo/x", &["/a/foo"]),
            ("", "/path/to/file", &[]),
        ];
        for (prev, current, expected) in cases {
            assert_eq!(
                directory_diff(prev, current),
                expected,
                "diff({prev:?}, {current:?})"
            );
        }
    }

    #[test]
    fn copy_ranges_cover_the_object_exactly() {
        let size: u64 = 100 << 20;
        let chunk: u64 = 32 << 20;
        assert_eq!(size.div_ceil(chunk), 4);
        assert_eq!(copy_source_range(0, chunk, size), "bytes=0-33554431");
        assert_eq!(copy_source_range(1, chunk, size), "bytes=33554432-67108863");
        assert_eq!(copy_source_range(2, chunk, size), "bytes=67108864-100663295");
        assert_eq!(
            copy_source_range(3, chunk, size),
            "bytes=100663296-104857599"
        );
    }

    fn collect(state: &mut WalkState, page: Vec<FileInfo>) -> (Vec<(String, bool)>, bool) {
        let mut seen = Vec::new();
        let flow = state
            .dispatch_page(page, &mut |info| {
                seen.push((info.path.clone(), info.is_dir));
                Ok(WalkDecision::Continue)
            })
            .unwrap();
        (seen, flow.is_break())
    }

    fn file(path: &str) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            size: 1,
            mod_time: None,
            is_dir: false,
        }
    }

    #[test]
    fn walk_emits_directories_before_their_files() {
        let mut state = WalkState::new("/".to_string());
        let (seen, stopped) = collect(
            &mut state,
            vec![file("/a/b/c"), file("/a/b/d"), file("/a/e")],
        );
        assert!(!stopped);
        assert_eq!(
            seen,
            vec![
                ("/a".to_string(), true),
                ("/a/b".to_string(), true),
                ("/a/b/c".to_string(), false),
                ("/a/b/d".to_string(), false),
                ("/a/e".to_string(), false),
            ]
        );
    }

    #[test]
    fn walk_deduplicates_directories_across_pages() {
        let mut state = WalkState::new("/".to_string());
        let (first, _) = collect(&mut state, vec![file("/a/b/c")]);
        let (second, _) = collect(&mut state, vec![file("/a/b/d"), file("/a/f/g")]);
        assert_eq!(
            first,
            vec![
                ("/a".to_string(), true),
                ("/a/b".to_string(), true),
                ("/a/b/c".to_string(), false),
            ]
        );
        assert_eq!(
            second,
            vec![
                ("/a/b/d".to_string(), false),
                ("/a/f".to_string(), true),
                ("/a/f/g".to_string(), false),
            ]
        );
    }

    #[test]
    fn walk_skip_directory_suppresses_the_subtree() {
        let mut state = WalkState::new("/a/".to_string());
        let mut seen = Vec::new();
        let flow = state
            .dispatch_page(vec![file("/a/b/c"), file("/a/e")], &mut |info| {
                seen.push((info.path.clone(), info.is_dir));
                if info.path == "/a/b" {
                    return Ok(WalkDecision::SkipDir);
                }
                Ok(WalkDecision::Continue)
            })
            .unwrap();
        assert!(!flow.is_break());
        assert_eq!(
            seen,
            vec![("/a/b".to_string(), true), ("/a/e".to_string(), false)]
        );
    }

    #[test]
    fn walk_skip_on_a_file_stops_gracefully() {
        let mut state = WalkState::new("/".to_string());
        let mut seen = Vec::new();
        let flow = state
            .dispatch_page(vec![file("/a/b"), file("/a/c")], &mut |info| {
                seen.push(info.path.clone());
                if info.is_dir {
                    return Ok(WalkDecision::Continue);
                }
                Ok(WalkDecision::SkipDir)
            })
            .unwrap();
        assert!(flow.is_break());
        assert_eq!(seen, vec!["/a".to_string(), "/a/b".to_string()]);
    }

    #[test]
    fn walk_callback_errors_propagate() {
        let mut state = WalkState::new("/".to_string());
        let result = state.dispatch_page(vec![file("/a/b")], &mut |info| {
            if info.is_dir {
                return Ok(WalkDecision::Continue);
            }
            Err(Error::QuotaExceeded)
        });
        assert!(matches!(result, Err(Error::QuotaExceeded)));
        assert_eq!(state.emitted, 2);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_backend_call() {
        let driver = test_driver("");
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        assert!(matches!(
            driver.stat(&cancel_token, "/a").await,
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            driver.list(&cancel_token, "/a").await,
            Err(Error::Cancelled)
        ));
        let walked = driver
            .walk(&cancel_token, "/a", &mut |_| Ok(WalkDecision::Continue))
            .await;
        assert!(matches!(walked, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn url_for_rejects_unsupported_methods() {
        let driver = test_driver("");
        let result = driver
            .url_for(
                "/a/b",
                UrlOptions {
                    method: Some("POST".to_string()),
                    expiry: None,
                },
            )
            .await;
        match result {
            Err(Error::UnsupportedMethod(method)) => assert_eq!(method, "POST"),
            other => panic!("expected unsupported method error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn url_for_presigns_get_requests() {
        let driver = test_driver("/r");
        let url = driver
            .url_for("/a/b", UrlOptions::default())
            .await
            .unwrap();
        assert!(url.contains("test-bucket"));
        assert!(url.contains("r/a/b"));
        assert!(url.contains("X-Amz-Signature"));
    }
}
