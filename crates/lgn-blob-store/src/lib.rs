//! Legion Blob Store
//!
//! A content-addressable blob store: blobs are identified by the SHA-256 hash
//! of their content and can live on the local filesystem, in an S3-compatible
//! object store or in memory.
//!
//! All backends share the same write discipline: content is staged first,
//! hashed while it is written, then promoted atomically under its hash. A
//! failed or cancelled write never leaves anything reachable under a hash.

// crate-specific lint exceptions:
//#![allow()]

mod batch;
mod config;
mod content_hash;
mod context;
mod errors;
mod hasher;
mod providers;
mod traits;

pub use config::{
    BackendConfig, BucketLookup, LocalBackendConfig, ObjectStoreBackendConfig, StaticCredentials,
};
pub use content_hash::ContentHash;
pub use context::Context;
pub use errors::{Error, ErrorKind, MapIoError, Result};
pub use hasher::HashingReader;
pub use providers::*;
pub use traits::{
    BlobAsyncRead, BlobExistenceChecker, BlobIterator, BlobMetadata, BlobReader, BlobReaderExt,
    BlobRemover, BlobRemoverExt, BlobStore, BlobWriter, BlobWriterExt, FullBlobStore,
    HashedBlobWriter, LocatorSource,
};
