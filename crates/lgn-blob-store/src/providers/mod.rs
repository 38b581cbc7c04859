#[cfg(test)]
mod fake_s3;
mod local;
mod memory;
mod object_store;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use object_store::ObjectBlobStore;

#[cfg(test)]
pub(crate) async fn test_blob_store(store: &(impl crate::FullBlobStore + Send + Sync)) {
    use crate::{BlobMetadata, BlobReaderExt, BlobWriterExt, ContentHash, Context, Error};

    let ctx = Context::new();
    let data: &[u8; 128] = &[0x41; 128];
    let hash = ContentHash::of(data);

    match store.read_blob(&ctx, &hash).await {
        Err(Error::NotFound { hash: missing }) => assert_eq!(missing, hash),
        Err(err) => panic!("unexpected error: {}", err),
        Ok(_) => panic!("blob `{}` should not exist yet", hash),
    }

    assert!(!store.exists(&ctx, &hash).await.unwrap());
    assert_eq!(store.store_bytes(&ctx, data).await.unwrap(), hash);
    assert!(store.exists(&ctx, &hash).await.unwrap());
    assert_eq!(store.read_blob(&ctx, &hash).await.unwrap(), data);
    assert_eq!(store.size(&ctx, &hash).await.unwrap(), 128);

    // Storing it again is a no-op.
    assert_eq!(store.store_bytes(&ctx, data).await.unwrap(), hash);

    // An existing blob is never read again.
    let mut garbage: &[u8] = b"garbage";
    store
        .store_hashed(&ctx, &mut garbage, &hash, &BlobMetadata::default())
        .await
        .unwrap();
    assert_eq!(store.read_blob(&ctx, &hash).await.unwrap(), data);

    let other = ContentHash::of(b"other");
    let mut content: &[u8] = b"not other";
    let err = store
        .store_hashed(&ctx, &mut content, &other, &BlobMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HashMismatch { expected, .. } if expected == other));
    assert!(!store.exists(&ctx, &other).await.unwrap());

    let mut content: &[u8] = b"other";
    store
        .store_hashed(&ctx, &mut content, &other, &BlobMetadata::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    store
        .iterate(&ctx, 1, &mut |batch: Vec<ContentHash>| -> crate::Result<()> {
            assert_eq!(batch.len(), 1);
            seen.extend(batch);
            Ok(())
        })
        .await
        .unwrap();
    seen.sort();

    let mut expected = vec![hash, other];
    expected.sort();
    assert_eq!(seen, expected);

    store.remove(&ctx, &hash).await.unwrap();
    assert!(store.fetch(&ctx, &hash).await.err().unwrap().is_not_found());
    assert!(store.size(&ctx, &hash).await.unwrap_err().is_not_found());
    assert!(store.remove(&ctx, &hash).await.unwrap_err().is_not_found());

    store.remove(&ctx, &other).await.unwrap();
}
