use std::path::PathBuf;

use aws_sdk_s3::config::SharedHttpClient;
use serde::Deserialize;

use crate::{
    ContentHash, Error, FullBlobStore, LocalBlobStore, MemoryBlobStore, ObjectBlobStore, Result,
};

/// The configuration of a blob store.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory {},
    Local(LocalBackendConfig),
    ObjectStore(ObjectStoreBackendConfig),
}

impl BackendConfig {
    /// Instantiates the configured blob store.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, `Error::Configuration` is returned.
    ///
    /// Otherwise, any error raised while setting the backend up is returned.
    pub async fn instantiate(&self) -> Result<Box<dyn FullBlobStore + Send + Sync>> {
        Ok(match self {
            Self::Memory {} => Box::new(MemoryBlobStore::new()),
            Self::Local(config) => Box::new(LocalBlobStore::new(config.clone()).await?),
            Self::ObjectStore(config) => Box::new(ObjectBlobStore::new(config.clone()).await?),
        })
    }
}

fn default_prefix_size() -> usize {
    2
}

fn default_file_mode() -> u32 {
    0o644
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LocalBackendConfig {
    /// Where content is written before being promoted.
    ///
    /// Must be on the same filesystem as `assets_path`.
    pub staging_path: PathBuf,

    /// The root of the sharded blob tree.
    pub assets_path: PathBuf,

    /// The number of hash characters used to name shard directories.
    #[serde(default = "default_prefix_size")]
    pub prefix_size: usize,

    /// The permissions of stored files, on Unix.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

impl LocalBackendConfig {
    pub fn new(staging_path: impl Into<PathBuf>, assets_path: impl Into<PathBuf>) -> Self {
        Self {
            staging_path: staging_path.into(),
            assets_path: assets_path.into(),
            prefix_size: default_prefix_size(),
            file_mode: default_file_mode(),
        }
    }

    /// # Errors
    ///
    /// `Error::Configuration` if the prefix size is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.prefix_size == 0 || self.prefix_size > ContentHash::HEX_LEN {
            return Err(Error::Configuration(format!(
                "the prefix size must be between 1 and {}, got {}",
                ContentHash::HEX_LEN,
                self.prefix_size
            )));
        }

        Ok(())
    }
}

/// Static credentials for an S3-compatible object store.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .finish()
    }
}

/// How buckets are addressed in requests.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BucketLookup {
    /// DNS-style for AWS endpoints, path-style for everything else.
    #[default]
    Auto,
    /// `https://endpoint/bucket/key`
    Path,
    /// `https://bucket.endpoint/key`
    Dns,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_staging_prefix() -> String {
    "tmp/".to_string()
}

#[derive(Clone, Deserialize)]
pub struct ObjectStoreBackendConfig {
    /// The endpoint, as `host[:port]` or as a full URL.
    ///
    /// If not set, the AWS endpoint of the region is used.
    #[serde(default)]
    pub endpoint: Option<String>,

    pub bucket: String,

    #[serde(default)]
    pub credentials: Option<StaticCredentials>,

    /// Use the default AWS credentials chain (environment, profile,
    /// instance metadata...) instead of static credentials.
    #[serde(default)]
    pub use_environment_credentials: bool,

    /// Whether to use HTTPS for an endpoint given without a scheme.
    #[serde(default)]
    pub secure: bool,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub bucket_lookup: BucketLookup,

    /// Create the bucket on startup if it does not exist.
    #[serde(default)]
    pub auto_create_bucket: bool,

    /// The key prefix of in-flight uploads. Must end with a `/`.
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    /// Overrides the HTTP transport, mostly for tests.
    #[serde(skip)]
    pub http_client: Option<SharedHttpClient>,
}

impl std::fmt::Debug for ObjectStoreBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackendConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("credentials", &self.credentials)
            .field(
                "use_environment_credentials",
                &self.use_environment_credentials,
            )
            .field("secure", &self.secure)
            .field("region", &self.region)
            .field("bucket_lookup", &self.bucket_lookup)
            .field("auto_create_bucket", &self.auto_create_bucket)
            .field("staging_prefix", &self.staging_prefix)
            .field("http_client", &self.http_client.as_ref().map(|_| ".."))
            .finish()
    }
}

impl ObjectStoreBackendConfig {
    /// Creates a configuration for the specified bucket, with static
    /// credentials and every other setting at its default.
    pub fn new(bucket: impl Into<String>, credentials: StaticCredentials) -> Self {
        Self {
            endpoint: None,
            bucket: bucket.into(),
            credentials: Some(credentials),
            use_environment_credentials: false,
            secure: false,
            region: default_region(),
            bucket_lookup: BucketLookup::default(),
            auto_create_bucket: false,
            staging_prefix: default_staging_prefix(),
            http_client: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..self
        }
    }

    /// # Errors
    ///
    /// `Error::Configuration` if the settings are inconsistent.
    pub fn validate(&self) -> Result<()> {
        match (&self.credentials, self.use_environment_credentials) {
            (Some(_), true) => {
                return Err(Error::Configuration(
                    "static credentials and environment credentials are mutually exclusive"
                        .to_string(),
                ));
            }
            (None, false) => {
                return Err(Error::Configuration(
                    "either static credentials or environment credentials must be configured"
                        .to_string(),
                ));
            }
            _ => {}
        }

        if self.bucket.is_empty() {
            return Err(Error::Configuration(
                "the bucket name cannot be empty".to_string(),
            ));
        }

        if !self.staging_prefix.ends_with('/') || self.staging_prefix.len() < 2 {
            return Err(Error::Configuration(format!(
                "the staging prefix must be a non-empty path ending with `/`, got `{}`",
                self.staging_prefix
            )));
        }

        if let Some(endpoint) = &self.endpoint {
            if endpoint.is_empty() {
                return Err(Error::Configuration(
                    "the endpoint cannot be empty".to_string(),
                ));
            }

            if self.secure && endpoint.starts_with("http://") {
                return Err(Error::Configuration(format!(
                    "a secure connection was requested but the endpoint `{}` uses plain HTTP",
                    endpoint
                )));
            }
        }

        Ok(())
    }

    /// Returns the endpoint as a full URL, or `None` to use the AWS default.
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|endpoint| {
            if endpoint.contains("://") {
                endpoint.clone()
            } else if self.secure {
                format!("https://{}", endpoint)
            } else {
                format!("http://{}", endpoint)
            }
        })
    }

    /// Whether buckets are addressed as part of the path rather than of the
    /// host name.
    pub fn force_path_style(&self) -> bool {
        match self.bucket_lookup {
            BucketLookup::Path => true,
            BucketLookup::Dns => false,
            BucketLookup::Auto => self
                .endpoint
                .as_ref()
                .map_or(false, |endpoint| !endpoint_host(endpoint).ends_with("amazonaws.com")),
        }
    }
}

fn endpoint_host(endpoint: &str) -> &str {
    let endpoint = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = endpoint.split('/').next().unwrap_or(endpoint);

    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}
