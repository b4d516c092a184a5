use std::collections::{HashMap, HashSet};

use aws_config::{AppName, BehaviorVersion};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::{ObjectCannedAcl, StorageClass};
use aws_sdk_s3::Client;
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::s3::logging::ApiLogger;
use crate::s3::S3;

/// The S3 API requires multipart upload chunks to be at least 5 MiB.
pub(crate) const MIN_CHUNK_SIZE: u64 = 5 << 20;

/// Maximum multipart upload chunk size allowed by the S3 API.
pub(crate) const MAX_CHUNK_SIZE: u64 = 5 << 30;

const DEFAULT_CHUNK_SIZE: u64 = 2 * MIN_CHUNK_SIZE;

/// Chunk size for all but the last part of a multipart copy. Empirically,
/// 32 MiB is optimal.
const DEFAULT_MULTIPART_COPY_CHUNK_SIZE: u64 = 32 << 20;

/// Maximum number of concurrent part-copy operations during a multipart
/// copy.
const DEFAULT_MULTIPART_COPY_MAX_CONCURRENCY: u64 = 100;

/// Object size above which copies switch from a single server-side copy to
/// a multipart copy.
const DEFAULT_MULTIPART_COPY_THRESHOLD_SIZE: u64 = 32 << 20;

/// Storage class value that omits the storage class header entirely, for
/// S3-compatible endpoints that reject it.
const NO_STORAGE_CLASS: &str = "NONE";

static VALID_REGIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "af-south-1",
        "ap-east-1",
        "ap-northeast-1",
        "ap-northeast-2",
        "ap-northeast-3",
        "ap-south-1",
        "ap-south-2",
        "ap-southeast-1",
        "ap-southeast-2",
        "ap-southeast-3",
        "ap-southeast-4",
        "ca-central-1",
        "ca-west-1",
        "cn-north-1",
        "cn-northwest-1",
        "eu-central-1",
        "eu-central-2",
        "eu-north-1",
        "eu-south-1",
        "eu-south-2",
        "eu-west-1",
        "eu-west-2",
        "eu-west-3",
        "il-central-1",
        "me-central-1",
        "me-south-1",
        "sa-east-1",
        "us-east-1",
        "us-east-2",
        "us-gov-east-1",
        "us-gov-west-1",
        "us-west-1",
        "us-west-2",
    ])
});

static VALID_OBJECT_ACLS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "private",
        "public-read",
        "public-read-write",
        "authenticated-read",
        "aws-exec-read",
        "bucket-owner-read",
        "bucket-owner-full-control",
    ])
});

/// Driver configuration.
///
/// Credentials are optional; when absent the SDK's default provider chain
/// (environment, shared credentials file, instance metadata) applies.
#[derive(Clone, Debug, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub session_token: String,

    pub region: String,
    /// Custom endpoint for S3-compatible stores. Setting this disables the
    /// region allow-list check and forces path-style addressing.
    #[serde(default)]
    pub region_endpoint: String,
    pub bucket: String,

    #[serde(default)]
    pub encrypt: bool,
    /// KMS key id; selects `aws:kms` over `AES256` when `encrypt` is set.
    #[serde(default)]
    pub key_id: String,

    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default = "default_true")]
    pub v4_auth: bool,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_multipart_copy_chunk_size")]
    pub multipart_copy_chunk_size: u64,
    #[serde(default = "default_multipart_copy_max_concurrency")]
    pub multipart_copy_max_concurrency: u64,
    #[serde(default = "default_multipart_copy_threshold_size")]
    pub multipart_copy_threshold_size: u64,

    /// Prefix under the bucket below which all keys are placed.
    #[serde(default)]
    pub root_directory: String,
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    #[serde(default = "default_object_acl")]
    pub object_acl: String,

    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub log_s3_api_requests: bool,
    /// Maps log field names to response header names captured by the API
    /// request logger.
    #[serde(default)]
    pub log_s3_api_response_headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_multipart_copy_chunk_size() -> u64 {
    DEFAULT_MULTIPART_COPY_CHUNK_SIZE
}

fn default_multipart_copy_max_concurrency() -> u64 {
    DEFAULT_MULTIPART_COPY_MAX_CONCURRENCY
}

fn default_multipart_copy_threshold_size() -> u64 {
    DEFAULT_MULTIPART_COPY_THRESHOLD_SIZE
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

fn default_object_acl() -> String {
    "private".to_string()
}

impl S3Config {
    /// Construct the driver, validating every parameter first.
    pub async fn new_driver(&self) -> Result<S3> {
        self.validate()?;

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(self.region.clone()));

        if !self.access_key.is_empty() {
            let session_token =
                (!self.session_token.is_empty()).then(|| self.session_token.clone());
            let credentials = Credentials::new(
                self.access_key.clone(),
                self.secret_key.clone(),
                session_token,
                None,
                "stowage",
            );
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        if !self.user_agent.is_empty() {
            let app_name = AppName::new(self.user_agent.clone())
                .map_err(|err| Error::Configuration(format!("invalid user agent: {err}")))?;
            loader = loader.app_name(app_name);
        }

        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if !self.region_endpoint.is_empty() {
            builder = builder
                .endpoint_url(self.region_endpoint.clone())
                .force_path_style(true);
        }
        if self.log_s3_api_requests {
            builder = builder.interceptor(ApiLogger::new(
                self.log_s3_api_response_headers.clone(),
            ));
        }

        let client = Client::from_conf(builder.build());

        Ok(S3::new(client, self))
    }

    pub(crate) fn parsed_storage_class(&self) -> Option<StorageClass> {
        match self.storage_class.to_uppercase().as_str() {
            NO_STORAGE_CLASS => None,
            other => Some(StorageClass::from(other)),
        }
    }

    pub(crate) fn parsed_object_acl(&self) -> ObjectCannedAcl {
        ObjectCannedAcl::from(self.object_acl.as_str())
    }

    fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::Configuration("no region provided".to_string()));
        }
        if self.region_endpoint.is_empty() && !VALID_REGIONS.contains(self.region.as_str()) {
            return Err(Error::Configuration(format!(
                "invalid region provided: {}",
                self.region
            )));
        }
        if self.bucket.is_empty() {
            return Err(Error::Configuration("no bucket provided".to_string()));
        }
        if self.access_key.is_empty() != self.secret_key.is_empty() {
            return Err(Error::Configuration(
                "both access key and secret key must be provided".to_string(),
            ));
        }
        if !self.v4_auth
            && (self.region_endpoint.is_empty()
                || self.region_endpoint.contains("s3.amazonaws.com"))
        {
            return Err(Error::Configuration(
                "on Amazon S3 this storage driver can only be used with v4 authentication"
                    .to_string(),
            ));
        }

        bounded("chunk_size", self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)?;
        bounded(
            "multipart_copy_chunk_size",
            self.multipart_copy_chunk_size,
            MIN_CHUNK_SIZE,
            MAX_CHUNK_SIZE,
        )?;
        bounded(
            "multipart_copy_max_concurrency",
            self.multipart_copy_max_concurrency,
            1,
            u64::MAX,
        )?;
        bounded(
            "multipart_copy_threshold_size",
            self.multipart_copy_threshold_size,
            0,
            MAX_CHUNK_SIZE,
        )?;

        let storage_class = self.storage_class.to_uppercase();
        if storage_class != NO_STORAGE_CLASS
            && storage_class != "STANDARD"
            && storage_class != "REDUCED_REDUNDANCY"
        {
            return Err(Error::Configuration(format!(
                "invalid storage class provided: {}",
                self.storage_class
            )));
        }

        if !VALID_OBJECT_ACLS.contains(self.object_acl.as_str()) {
            return Err(Error::Configuration(format!(
                "invalid object acl provided: {}",
                self.object_acl
            )));
        }

        Ok(())
    }
}

fn bounded(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(Error::Configuration(format!(
            "the {name} parameter {value} must be between {min} and {max} (inclusive)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> S3Config {
        serde_yaml::from_str("{region: us-east-1, bucket: artifacts}").unwrap()
    }

    #[test]
    fn defaults() {
        let config = minimal();
        assert_eq!(config.chunk_size, 10 << 20);
        assert_eq!(config.multipart_copy_chunk_size, 32 << 20);
        assert_eq!(config.multipart_copy_max_concurrency, 100);
        assert_eq!(config.multipart_copy_threshold_size, 32 << 20);
        assert!(config.secure);
        assert!(config.v4_auth);
        assert!(!config.encrypt);
        assert_eq!(config.storage_class, "STANDARD");
        assert_eq!(config.object_acl, "private");
        assert_eq!(config.root_directory, "");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn storage_class_parsing() {
        let mut config = minimal();
        assert_eq!(config.parsed_storage_class(), Some(StorageClass::Standard));

        config.storage_class = "reduced_redundancy".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.parsed_storage_class(),
            Some(StorageClass::ReducedRedundancy)
        );

        config.storage_class = "none".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.parsed_storage_class(), None);

        config.storage_class = "GLACIER".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bounds_rejected() {
        let cases = [
            ("chunk_size: 1024", "chunk_size below the part minimum"),
            ("chunk_size: 6442450944", "chunk_size above the part maximum"),
            ("multipart_copy_chunk_size: 1", "copy chunk below minimum"),
            ("multipart_copy_max_concurrency: 0", "zero concurrency"),
            (
                "multipart_copy_threshold_size: 6442450944",
                "threshold above maximum",
            ),
        ];
        for (fragment, why) in cases {
            let doc = format!("{{region: us-east-1, bucket: artifacts, {fragment}}}");
            let config: S3Config = serde_yaml::from_str(&doc).unwrap();
            assert!(config.validate().is_err(), "{why}");
        }
    }

    #[test]
    fn region_allow_list() {
        let mut config = minimal();
        config.region = "mars-north-1".to_string();
        assert!(config.validate().is_err());

        // a custom endpoint bypasses the allow-list
        config.region_endpoint = "https://minio.internal:9000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn required_parameters() {
        let missing_bucket: std::result::Result<S3Config, _> =
            serde_yaml::from_str("{region: us-east-1}");
        assert!(missing_bucket.is_err());

        let missing_region: std::result::Result<S3Config, _> =
            serde_yaml::from_str("{bucket: artifacts}");
        assert!(missing_region.is_err());

        let mut config = minimal();
        config.access_key = "AKIAEXAMPLE".to_string();
        assert!(config.validate().is_err(), "secret key must accompany access key");
        config.secret_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn v2_auth_requires_custom_endpoint() {
        let mut config = minimal();
        config.v4_auth = false;
        assert!(config.validate().is_err());

        config.region_endpoint = "https://storage.example.com".to_string();
        assert!(config.validate().is_ok());

        config.region_endpoint = "https://s3.amazonaws.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn object_acl_allow_list() {
        let mut config = minimal();
        for acl in VALID_OBJECT_ACLS.iter() {
            config.object_acl = acl.to_string();
            assert!(config.validate().is_ok());
        }
        config.object_acl = "everyone".to_string();
        assert!(config.validate().is_err());
    }
}
