use std::fmt::Display;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    operation::{
        create_bucket::CreateBucketError, get_object::GetObjectError,
        head_bucket::HeadBucketError, head_object::HeadObjectError,
    },
    primitives::ByteStream,
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration,
    },
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    batch::Batcher, BlobAsyncRead, BlobExistenceChecker, BlobIterator, BlobMetadata, BlobReader,
    BlobRemover, BlobWriter, ContentHash, Context, Error, HashedBlobWriter, HashingReader,
    LocatorSource, MapIoError, ObjectStoreBackendConfig, Result,
};

/// The size of the parts of a multipart upload.
///
/// Content that fits in a single part is sent with a single `PutObject`.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// The region in which buckets must be created without a location
/// constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// An `ObjectBlobStore` stores blobs in an S3-compatible object store, each
/// blob under a key equal to its hash.
///
/// New content is uploaded under a random key below the staging prefix, then
/// copied server-side to its hash key once the hash is known.
#[derive(Debug, Clone)]
pub struct ObjectBlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    staging_prefix: String,
}

impl ObjectBlobStore {
    /// Creates a new `ObjectBlobStore` and makes sure its bucket exists.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or if the bucket does not exist and
    /// `auto_create_bucket` is not set, `Error::Configuration` is returned.
    #[instrument(skip_all, fields(bucket = %config.bucket))]
    pub async fn new(config: ObjectStoreBackendConfig) -> Result<Self> {
        config.validate()?;

        let region = Region::new(config.region.clone());

        let mut builder = if config.use_environment_credentials {
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;

            aws_sdk_s3::config::Builder::from(&sdk_config)
        } else {
            aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
        };

        if let Some(credentials) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                credentials.session_token.clone(),
                None,
                "lgn-blob-store",
            ));
        }

        if let Some(endpoint_url) = config.endpoint_url() {
            builder = builder.endpoint_url(endpoint_url);
        }

        builder = builder.force_path_style(config.force_path_style());

        if let Some(http_client) = &config.http_client {
            builder = builder.http_client(http_client.clone());
        }

        let store = Self::from_client(
            aws_sdk_s3::Client::from_conf(builder.build()),
            config.bucket,
            config.staging_prefix,
        );

        store
            .ensure_bucket(config.auto_create_bucket, &config.region)
            .await?;

        info!("initialized {}", store);

        Ok(store)
    }

    /// Creates an `ObjectBlobStore` over an existing client.
    ///
    /// Unlike `new`, this neither validates nor probes anything.
    pub fn from_client(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        staging_prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            staging_prefix: staging_prefix.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn staging_prefix(&self) -> &str {
        &self.staging_prefix
    }

    fn staging_key(&self) -> String {
        format!("{}{}", self.staging_prefix, uuid::Uuid::new_v4())
    }

    async fn ensure_bucket(&self, auto_create: bool, region: &str) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .map_or(false, HeadBucketError::is_not_found) => {}
            Err(err) => {
                return Err(s3_error(
                    format!("failed to probe bucket `{}`", self.bucket),
                    err,
                ));
            }
        }

        if !auto_create {
            return Err(Error::Configuration(format!(
                "bucket `{}` does not exist and automatic creation is disabled",
                self.bucket
            )));
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);

        if region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("created bucket `{}`", self.bucket);

                Ok(())
            }
            // Someone else created it in the meantime.
            Err(err)
                if err
                    .as_service_error()
                    .map_or(false, CreateBucketError::is_bucket_already_owned_by_you) =>
            {
                Ok(())
            }
            Err(err) => Err(s3_error(
                format!("failed to create bucket `{}`", self.bucket),
                err,
            )),
        }
    }

    /// Returns the size of the object, or `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => u64::try_from(output.content_length().unwrap_or_default())
                .map(Some)
                .map_io_err(format!("invalid content length for object `{}`", key)),
            Err(err)
                if err
                    .as_service_error()
                    .map_or(false, HeadObjectError::is_not_found) =>
            {
                Ok(None)
            }
            Err(err) => Err(s3_error(format!("failed to probe object `{}`", key), err)),
        }
    }

    /// Uploads the whole content of `reader` under a new staging key and
    /// returns that key along with the hash of the content.
    async fn stage(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &BlobMetadata,
    ) -> Result<(String, ContentHash)> {
        let staging_key = self.staging_key();
        let mut reader = HashingReader::new(reader);

        self.upload(&staging_key, &mut reader, metadata).await?;

        Ok((staging_key, reader.finalize()))
    }

    /// Copies a staging object to the key of its hash, then deletes it.
    ///
    /// Nothing but a successful copy ever writes to a hash key.
    async fn promote(&self, staging_key: &str, hash: &ContentHash) -> Result<()> {
        if let Err(err) = self.copy(staging_key, &hash.to_string()).await {
            return Err(self.discard(staging_key, err).await);
        }

        // The blob is in place: a leftover staging object only wastes space.
        if let Err(err) = self.delete(staging_key).await {
            warn!(
                "failed to delete staging object `{}`, leaving it behind: {}",
                staging_key, err
            );
        }

        debug!(%hash, "promoted blob");

        Ok(())
    }

    /// Uploads the whole content of `reader` under `key`.
    async fn upload(
        &self,
        key: &str,
        reader: &mut (impl AsyncRead + Unpin + Send),
        metadata: &BlobMetadata,
    ) -> Result<()> {
        let first_part = read_part(reader, part_capacity(metadata.size)).await?;

        if first_part.len() < PART_SIZE {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .set_content_type(metadata.content_type.clone())
                .set_content_disposition(metadata.content_disposition.clone())
                .body(ByteStream::from(first_part))
                .send()
                .await
                .map_err(|err| s3_error(format!("failed to put object `{}`", key), err))?;

            debug!("uploaded `{}`", key);

            Ok(())
        } else {
            self.upload_multipart(key, first_part, reader, metadata)
                .await
        }
    }

    async fn upload_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        reader: &mut (impl AsyncRead + Unpin + Send),
        metadata: &BlobMetadata,
    ) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(metadata.content_type.clone())
            .set_content_disposition(metadata.content_disposition.clone())
            .send()
            .await
            .map_err(|err| {
                s3_error(
                    format!("failed to start multipart upload of `{}`", key),
                    err,
                )
            })?;

        let upload_id = upload
            .upload_id()
            .ok_or_else(|| {
                Error::io(
                    format!("failed to start multipart upload of `{}`", key),
                    anyhow::anyhow!("no upload identifier was returned"),
                )
            })?
            .to_string();

        let err = match self
            .upload_parts(key, &upload_id, first_part, reader)
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        warn!("aborting multipart upload of `{}`: {}", key, err);

        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .send()
            .await
        {
            Ok(_) => Err(err),
            Err(abort_err) => Err(err.cleanup_failed(anyhow::anyhow!(
                "failed to abort multipart upload `{}`: {}",
                upload_id,
                DisplayErrorContext(abort_err)
            ))),
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        reader: &mut (impl AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let mut parts = Vec::new();
        let mut part = first_part;
        let mut part_number = 1;

        while !part.is_empty() {
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|err| {
                    s3_error(
                        format!("failed to upload part {} of `{}`", part_number, key),
                        err,
                    )
                })?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(ToOwned::to_owned))
                    .part_number(part_number)
                    .build(),
            );

            part = read_part(reader, PART_SIZE).await?;
            part_number += 1;
        }

        debug!("uploaded {} part(s) of `{}`", parts.len(), key);

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                s3_error(
                    format!("failed to complete multipart upload of `{}`", key),
                    err,
                )
            })?;

        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(format!("{}/{}", self.bucket, from))
            .send()
            .await
            .map_err(|err| s3_error(format!("failed to copy `{}` to `{}`", from, to), err))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| s3_error(format!("failed to delete object `{}`", key), err))?;

        Ok(())
    }

    /// Deletes `key` after `err` occurred, keeping track of both failures if
    /// the deletion fails too.
    async fn discard(&self, key: &str, err: Error) -> Error {
        match self.delete(key).await {
            Ok(()) => err,
            Err(cleanup) => err.cleanup_failed(cleanup),
        }
    }
}

/// The initial capacity of the first part buffer, given the announced size
/// of the content.
fn part_capacity(size: Option<u64>) -> usize {
    size.and_then(|size| usize::try_from(size).ok())
        .map_or(PART_SIZE, |size| size.min(PART_SIZE))
}

/// Reads at most one part worth of data, stopping early only at the end of
/// the stream.
async fn read_part(
    reader: &mut (impl AsyncRead + Unpin + Send),
    capacity: usize,
) -> Result<Vec<u8>> {
    let mut part = Vec::with_capacity(capacity);

    (&mut *reader)
        .take(PART_SIZE as u64)
        .read_to_end(&mut part)
        .await
        .map_io_err("failed to read blob content")?;

    Ok(part)
}

fn s3_error(context: impl Into<String>, err: impl std::error::Error) -> Error {
    Error::io(context, anyhow::anyhow!("{}", DisplayErrorContext(err)))
}

impl Display for ObjectBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "S3 (bucket: {}, staging prefix: {})",
            self.bucket, self.staging_prefix
        )
    }
}

#[async_trait]
impl BlobWriter for ObjectBlobStore {
    #[instrument(skip_all, fields(store = %self))]
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &BlobMetadata,
    ) -> Result<ContentHash> {
        ctx.run(async {
            let (staging_key, hash) = self.stage(reader, metadata).await?;

            self.promote(&staging_key, &hash).await?;

            Ok(hash)
        })
        .await
    }
}

#[async_trait]
impl HashedBlobWriter for ObjectBlobStore {
    #[instrument(skip(self, ctx, reader, metadata), fields(store = %self))]
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        ctx.run(async {
            if self.head(&hash.to_string()).await?.is_some() {
                debug!("blob already exists: skipping");

                return Ok(());
            }

            let (staging_key, actual) = self.stage(reader, metadata).await?;

            if actual != *hash {
                return Err(self
                    .discard(&staging_key, Error::hash_mismatch(*hash, actual))
                    .await);
            }

            self.promote(&staging_key, hash).await
        })
        .await
    }
}

#[async_trait]
impl BlobReader for ObjectBlobStore {
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead> {
        ctx.run(async {
            let key = hash.to_string();

            match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(output) => Ok(Box::pin(output.body.into_async_read()) as BlobAsyncRead),
                Err(err)
                    if err
                        .as_service_error()
                        .map_or(false, GetObjectError::is_no_such_key) =>
                {
                    Err(Error::not_found(*hash))
                }
                Err(err) => Err(s3_error(format!("failed to get object `{}`", key), err)),
            }
        })
        .await
    }

    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64> {
        ctx.run(async {
            self.head(&hash.to_string())
                .await?
                .ok_or_else(|| Error::not_found(*hash))
        })
        .await
    }
}

#[async_trait]
impl BlobExistenceChecker for ObjectBlobStore {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        ctx.run(async { Ok(self.head(&hash.to_string()).await?.is_some()) })
            .await
    }
}

#[async_trait]
impl BlobIterator for ObjectBlobStore {
    #[instrument(skip(self, ctx, visit), fields(store = %self))]
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()> {
        let mut batcher = Batcher::new(batch_size, visit)?;

        ctx.run(async {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|err| {
                    s3_error(
                        format!("failed to list objects of bucket `{}`", self.bucket),
                        err,
                    )
                })?;

                for key in page.contents().iter().filter_map(|object| object.key()) {
                    if key.starts_with(&self.staging_prefix) {
                        continue;
                    }

                    match key.parse::<ContentHash>() {
                        Ok(hash) => batcher.push(hash)?,
                        Err(err) => debug!("skipping object `{}`: {}", key, err),
                    }
                }
            }

            Ok(())
        })
        .await?;

        batcher.finish()
    }
}

#[async_trait]
impl BlobRemover for ObjectBlobStore {
    #[instrument(skip(self, ctx), fields(store = %self))]
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()> {
        ctx.run(async {
            let key = hash.to_string();

            // Deleting a missing key succeeds silently.
            if self.head(&key).await?.is_none() {
                return Err(Error::not_found(*hash));
            }

            self.delete(&key).await
        })
        .await
    }
}

impl LocatorSource for ObjectBlobStore {
    fn locator(&self, hash: &ContentHash) -> Result<String> {
        Ok(format!("s3://{}/{}", self.bucket, hash))
    }
}
