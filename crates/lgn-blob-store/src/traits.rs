use std::{fmt::Display, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{ContentHash, Context, Error, MapIoError, Result};

/// A reader as returned by the `BlobReader` trait.
pub type BlobAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

/// Optional information about a blob, passed alongside its content.
///
/// Backends that cannot make use of a field simply ignore it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMetadata {
    /// The exact size of the content, if known in advance.
    ///
    /// Used as a hint to size upload buffers.
    pub size: Option<u64>,
    /// The media type of the content (e.g. `image/png`).
    pub content_type: Option<String>,
    /// The content disposition (e.g. `inline; filename="test.png"`).
    pub content_disposition: Option<String>,
}

impl BlobMetadata {
    #[must_use]
    pub fn with_size(self, size: u64) -> Self {
        Self {
            size: Some(size),
            ..self
        }
    }

    #[must_use]
    pub fn with_content_type(self, content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_content_disposition(self, content_disposition: impl Into<String>) -> Self {
        Self {
            content_disposition: Some(content_disposition.into()),
            ..self
        }
    }
}

/// BlobWriter is a trait for persisting content in a blob-store.
#[async_trait]
pub trait BlobWriter: Display {
    /// Reads `reader` to exhaustion, persists its content and returns its
    /// hash.
    ///
    /// Storing content that already exists is a no-op that returns the same
    /// hash. On failure, nothing is reachable under the hash of the content.
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &BlobMetadata,
    ) -> Result<ContentHash>;
}

/// HashedBlobWriter is implemented by backends that can persist content under
/// a hash known in advance more cheaply than through `BlobWriter::store`.
#[async_trait]
pub trait HashedBlobWriter: Display {
    /// Persists the content of `reader` under `hash`.
    ///
    /// If a blob already exists under `hash`, the call is a no-op and
    /// `reader` is not read: the content is not compared with what was
    /// stored first.
    ///
    /// # Errors
    ///
    /// If the content does not hash to `hash`, nothing is persisted and
    /// `Error::HashMismatch` is returned.
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        metadata: &BlobMetadata,
    ) -> Result<()>;
}

/// BlobReader is a trait for reading content from a blob-store.
#[async_trait]
pub trait BlobReader: Display {
    /// Returns an async reader over the content of the blob.
    ///
    /// If no such blob exists, `Error::NotFound` is returned.
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead>;

    /// Returns the size of the blob, in bytes.
    ///
    /// If no such blob exists, `Error::NotFound` is returned.
    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64>;
}

/// BlobExistenceChecker is implemented by backends that can tell whether a
/// blob exists without reading it.
#[async_trait]
pub trait BlobExistenceChecker: Display {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool>;
}

/// BlobIterator is a trait for enumerating all the blobs of a store.
#[async_trait]
pub trait BlobIterator: Display {
    /// Calls `visit` with the hashes of all stored blobs, at most
    /// `batch_size` at a time.
    ///
    /// The enumeration is not isolated from concurrent writes or removals:
    /// blobs changed during the walk may or may not be reported.
    ///
    /// # Errors
    ///
    /// If `visit` returns an error, iteration stops immediately and that
    /// error is returned as-is.
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()>;
}

/// BlobRemover is a trait for deleting blobs.
#[async_trait]
pub trait BlobRemover: Display {
    /// Removes the blob.
    ///
    /// If no such blob exists, `Error::NotFound` is returned.
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()>;
}

/// Provides the locators an external image proxy uses to reach a blob.
pub trait LocatorSource {
    /// Returns a `<scheme>://<path>` locator for the blob.
    ///
    /// The blob does not need to exist.
    fn locator(&self, hash: &ContentHash) -> Result<String>;
}

#[async_trait]
pub trait BlobWriterExt: BlobWriter {
    /// Stores the specified content and returns its hash.
    async fn store_bytes(&self, ctx: &Context, data: &[u8]) -> Result<ContentHash> {
        let metadata = BlobMetadata::default().with_size(data.len() as u64);
        let mut reader = data;

        self.store(ctx, &mut reader, &metadata).await
    }
}

impl<T: BlobWriter + ?Sized> BlobWriterExt for T {}

#[async_trait]
pub trait BlobReaderExt: BlobReader {
    /// Reads the full content of the blob.
    async fn read_blob(&self, ctx: &Context, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut reader = self.fetch(ctx, hash).await?;

        ctx.run(async move {
            let mut content = Vec::new();

            reader
                .read_to_end(&mut content)
                .await
                .map_io_err(format!("failed to read blob `{}`", hash))?;

            Ok(content)
        })
        .await
    }
}

impl<T: BlobReader + ?Sized> BlobReaderExt for T {}

#[async_trait]
pub trait BlobRemoverExt: BlobRemover {
    /// Removes the blob if it exists.
    ///
    /// Returns whether a blob was removed.
    async fn remove_if_exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        match self.remove(ctx, hash).await {
            Ok(()) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl<T: BlobRemover + ?Sized> BlobRemoverExt for T {}

/// `BlobStore` is the set of capabilities every backend provides.
pub trait BlobStore:
    BlobWriter + BlobReader + BlobIterator + BlobRemover + LocatorSource
{
}

/// Blanket implementation of `BlobStore`.
impl<T> BlobStore for T where
    T: BlobWriter + BlobReader + BlobIterator + BlobRemover + LocatorSource
{
}

/// `FullBlobStore` is a `BlobStore` that also supports the optional
/// capabilities.
pub trait FullBlobStore: BlobStore + HashedBlobWriter + BlobExistenceChecker {}

/// Blanket implementation of `FullBlobStore`.
impl<T> FullBlobStore for T where T: BlobStore + HashedBlobWriter + BlobExistenceChecker {}

/// Blanket implementations for Arc<T> variants.

#[async_trait]
impl<T: BlobWriter + Send + Sync + ?Sized> BlobWriter for Arc<T> {
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &BlobMetadata,
    ) -> Result<ContentHash> {
        self.as_ref().store(ctx, reader, metadata).await
    }
}

#[async_trait]
impl<T: HashedBlobWriter + Send + Sync + ?Sized> HashedBlobWriter for Arc<T> {
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        self.as_ref()
            .store_hashed(ctx, reader, hash, metadata)
            .await
    }
}

#[async_trait]
impl<T: BlobReader + Send + Sync + ?Sized> BlobReader for Arc<T> {
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead> {
        self.as_ref().fetch(ctx, hash).await
    }

    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64> {
        self.as_ref().size(ctx, hash).await
    }
}

#[async_trait]
impl<T: BlobExistenceChecker + Send + Sync + ?Sized> BlobExistenceChecker for Arc<T> {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        self.as_ref().exists(ctx, hash).await
    }
}

#[async_trait]
impl<T: BlobIterator + Send + Sync + ?Sized> BlobIterator for Arc<T> {
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()> {
        self.as_ref().iterate(ctx, batch_size, visit).await
    }
}

#[async_trait]
impl<T: BlobRemover + Send + Sync + ?Sized> BlobRemover for Arc<T> {
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()> {
        self.as_ref().remove(ctx, hash).await
    }
}

impl<T: LocatorSource + ?Sized> LocatorSource for Arc<T> {
    fn locator(&self, hash: &ContentHash) -> Result<String> {
        self.as_ref().locator(hash)
    }
}

/// Blanket implementations for Box<T> variants.

#[async_trait]
impl<T: BlobWriter + Send + Sync + ?Sized> BlobWriter for Box<T> {
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &BlobMetadata,
    ) -> Result<ContentHash> {
        self.as_ref().store(ctx, reader, metadata).await
    }
}

#[async_trait]
impl<T: HashedBlobWriter + Send + Sync + ?Sized> HashedBlobWriter for Box<T> {
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        self.as_ref()
            .store_hashed(ctx, reader, hash, metadata)
            .await
    }
}

#[async_trait]
impl<T: BlobReader + Send + Sync + ?Sized> BlobReader for Box<T> {
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead> {
        self.as_ref().fetch(ctx, hash).await
    }

    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64> {
        self.as_ref().size(ctx, hash).await
    }
}

#[async_trait]
impl<T: BlobExistenceChecker + Send + Sync + ?Sized> BlobExistenceChecker for Box<T> {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        self.as_ref().exists(ctx, hash).await
    }
}

#[async_trait]
impl<T: BlobIterator + Send + Sync + ?Sized> BlobIterator for Box<T> {
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()> {
        self.as_ref().iterate(ctx, batch_size, visit).await
    }
}

#[async_trait]
impl<T: BlobRemover + Send + Sync + ?Sized> BlobRemover for Box<T> {
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()> {
        self.as_ref().remove(ctx, hash).await
    }
}

impl<T: LocatorSource + ?Sized> LocatorSource for Box<T> {
    fn locator(&self, hash: &ContentHash) -> Result<String> {
        self.as_ref().locator(hash)
    }
}

/// Blanket implementations for &T variants.

#[async_trait]
impl<'a, T: BlobWriter + Send + Sync + ?Sized> BlobWriter for &'a T {
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &BlobMetadata,
    ) -> Result<ContentHash> {
        (**self).store(ctx, reader, metadata).await
    }
}

#[async_trait]
impl<'a, T: HashedBlobWriter + Send + Sync + ?Sized> HashedBlobWriter for &'a T {
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        metadata: &BlobMetadata,
    ) -> Result<()> {
        (**self)
            .store_hashed(ctx, reader, hash, metadata)
            .await
    }
}

#[async_trait]
impl<'a, T: BlobReader + Send + Sync + ?Sized> BlobReader for &'a T {
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead> {
        (**self).fetch(ctx, hash).await
    }

    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64> {
        (**self).size(ctx, hash).await
    }
}

#[async_trait]
impl<'a, T: BlobExistenceChecker + Send + Sync + ?Sized> BlobExistenceChecker for &'a T {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        (**self).exists(ctx, hash).await
    }
}

#[async_trait]
impl<'a, T: BlobIterator + Send + Sync + ?Sized> BlobIterator for &'a T {
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()> {
        (**self).iterate(ctx, batch_size, visit).await
    }
}

#[async_trait]
impl<'a, T: BlobRemover + Send + Sync + ?Sized> BlobRemover for &'a T {
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()> {
        (**self).remove(ctx, hash).await
    }
}

impl<'a, T: LocatorSource + ?Sized> LocatorSource for &'a T {
    fn locator(&self, hash: &ContentHash) -> Result<String> {
        (**self).locator(hash)
    }
}
