//! Storage driver errors.

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::error::SdkError;
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// General purpose error handling for the storage driver.
///
/// The first group of variants is the domain taxonomy surfaced to the
/// registry; everything below it wraps the individual backend operation
/// errors so they can propagate with `?`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("unsupported url method: {0}")]
    UnsupportedMethod(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("writer already closed")]
    AlreadyClosed,
    #[error("writer already committed")]
    AlreadyCommitted,
    #[error("writer already cancelled")]
    AlreadyCancelled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to initiate multipart upload: {0}")]
    FailedToInitiateMultipartUpload(&'static str),

    #[error("batch delete failed: {0}")]
    BatchDeleteFailed(String),

    #[error("i/o error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("{0}")]
    ByteStreamError(#[from] aws_sdk_s3::primitives::ByteStreamError),

    #[error("invalid presigning configuration: {0}")]
    PresigningConfigError(#[from] aws_sdk_s3::presigning::PresigningConfigError),

    #[error("invalid request parameter: {0}")]
    RequestBuildError(#[from] aws_sdk_s3::error::BuildError),

    #[error("aws sdk put object error")]
    AWSSDKPutObjectError(#[from] SdkError<aws_sdk_s3::operation::put_object::PutObjectError>),
    #[error("aws sdk get object error")]
    AWSSDKGetObjectError(#[from] SdkError<aws_sdk_s3::operation::get_object::GetObjectError>),
    #[error("aws sdk head object error")]
    AWSSDKHeadObjectError(#[from] SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>),
    #[error("aws sdk copy object error")]
    AWSSDKCopyObjectError(#[from] SdkError<aws_sdk_s3::operation::copy_object::CopyObjectError>),
    #[error("aws sdk delete objects error")]
    AWSSDKDeleteObjectsError(
        #[from] SdkError<aws_sdk_s3::operation::delete_objects::DeleteObjectsError>,
    ),
    #[error("aws sdk list objects error")]
    AWSSDKListObjectsV2Error(
        #[from] SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    ),
    #[error("aws sdk create multipart upload error")]
    AWSSDKCreateMultipartUploadError(
        #[from]
        SdkError<aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError>,
    ),
    #[error("aws sdk upload part error")]
    AWSSDKUploadPartError(#[from] SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>),
    #[error("aws sdk upload part copy error")]
    AWSSDKUploadPartCopyError(
        #[from] SdkError<aws_sdk_s3::operation::upload_part_copy::UploadPartCopyError>,
    ),
    #[error("aws sdk complete multipart upload error")]
    AWSSDKCompleteMultipartUploadError(
        #[from]
        SdkError<aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError>,
    ),
    #[error("aws sdk abort multipart upload error")]
    AWSSDKAbortMultipartUploadError(
        #[from]
        SdkError<aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError>,
    ),
    #[error("aws sdk list multipart uploads error")]
    AWSSDKListMultipartUploadsError(
        #[from]
        SdkError<aws_sdk_s3::operation::list_multipart_uploads::ListMultipartUploadsError>,
    ),
    #[error("aws sdk list parts error")]
    AWSSDKListPartsError(#[from] SdkError<aws_sdk_s3::operation::list_parts::ListPartsError>),
}

/// Translate a backend error into the driver's domain taxonomy where a
/// well-known error code applies, otherwise pass it through wrapped.
pub(crate) fn parse_error<E>(path: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata,
    Error: From<SdkError<E>>,
{
    match err.code() {
        Some("NoSuchKey") => Error::PathNotFound {
            path: path.to_string(),
        },
        Some("QuotaExceeded") => Error::QuotaExceeded,
        _ => Error::from(err),
    }
}
