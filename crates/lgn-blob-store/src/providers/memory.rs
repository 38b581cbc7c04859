use std::{collections::HashMap, fmt::Display, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::RwLock,
};
use tracing::{debug, instrument};

use crate::{
    batch::Batcher, BlobAsyncRead, BlobExistenceChecker, BlobIterator, BlobMetadata, BlobReader,
    BlobRemover, BlobWriter, ContentHash, Context, Error, HashedBlobWriter, LocatorSource,
    MapIoError, Result,
};

/// A `MemoryBlobStore` is a blob store that keeps content in RAM.
///
/// Clones share the same content.
#[derive(Default, Debug, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<ContentHash, Bytes>>>,
}

impl MemoryBlobStore {
    /// Creates a new, empty `MemoryBlobStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

async fn read_all(ctx: &Context, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<Vec<u8>> {
    ctx.run(async {
        let mut data = Vec::new();

        reader
            .read_to_end(&mut data)
            .await
            .map_io_err("failed to read blob content")?;

        Ok(data)
    })
    .await
}

impl Display for MemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "in-memory")
    }
}

#[async_trait]
impl BlobWriter for MemoryBlobStore {
    #[instrument(skip_all, fields(store = %self))]
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _metadata: &BlobMetadata,
    ) -> Result<ContentHash> {
        let data = read_all(ctx, reader).await?;
        let hash = ContentHash::of(&data);

        ctx.check()?;

        self.blobs
            .write()
            .await
            .entry(hash)
            .or_insert_with(|| data.into());

        debug!(%hash, "stored blob");

        Ok(hash)
    }
}

#[async_trait]
impl HashedBlobWriter for MemoryBlobStore {
    #[instrument(skip(self, ctx, reader, _metadata), fields(store = %self))]
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        _metadata: &BlobMetadata,
    ) -> Result<()> {
        if self.blobs.read().await.contains_key(hash) {
            debug!("blob already exists: skipping");

            return Ok(());
        }

        let data = read_all(ctx, reader).await?;
        let actual = ContentHash::of(&data);

        if actual != *hash {
            return Err(Error::hash_mismatch(*hash, actual));
        }

        ctx.check()?;

        self.blobs
            .write()
            .await
            .entry(actual)
            .or_insert_with(|| data.into());

        Ok(())
    }
}

#[async_trait]
impl BlobReader for MemoryBlobStore {
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead> {
        ctx.check()?;

        match self.blobs.read().await.get(hash) {
            Some(content) => Ok(Box::pin(std::io::Cursor::new(content.clone()))),
            None => Err(Error::not_found(*hash)),
        }
    }

    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64> {
        ctx.check()?;

        match self.blobs.read().await.get(hash) {
            Some(content) => Ok(content.len() as u64),
            None => Err(Error::not_found(*hash)),
        }
    }
}

#[async_trait]
impl BlobExistenceChecker for MemoryBlobStore {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        ctx.check()?;

        Ok(self.blobs.read().await.contains_key(hash))
    }
}

#[async_trait]
impl BlobIterator for MemoryBlobStore {
    #[instrument(skip(self, ctx, visit), fields(store = %self))]
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()> {
        let mut batcher = Batcher::new(batch_size, visit)?;

        ctx.check()?;

        // The lock is released before any visit.
        let mut hashes: Vec<ContentHash> = self.blobs.read().await.keys().copied().collect();
        hashes.sort_unstable();

        for hash in hashes {
            ctx.check()?;
            batcher.push(hash)?;
        }

        batcher.finish()
    }
}

#[async_trait]
impl BlobRemover for MemoryBlobStore {
    #[instrument(skip(self, ctx), fields(store = %self))]
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()> {
        ctx.check()?;

        match self.blobs.write().await.remove(hash) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(*hash)),
        }
    }
}

impl LocatorSource for MemoryBlobStore {
    fn locator(&self, hash: &ContentHash) -> Result<String> {
        Ok(format!("memory://{}", hash))
    }
}
