use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    batch::Batcher, BlobAsyncRead, BlobExistenceChecker, BlobIterator, BlobMetadata, BlobReader,
    BlobRemover, BlobWriter, ContentHash, Context, Error, HashedBlobWriter, HashingReader,
    LocalBackendConfig, LocatorSource, MapIoError, Result,
};

/// A `LocalBlobStore` stores blobs on the local filesystem.
///
/// Blobs live under `<assets>/<shard>/<hash>`, where `<shard>` is the first
/// `prefix_size` characters of the hash. Content is first written to a hidden
/// temporary file in the staging directory, then renamed into place once its
/// hash is known.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    staging_path: PathBuf,
    assets_path: PathBuf,
    prefix_size: usize,
    file_mode: u32,
}

impl LocalBlobStore {
    /// Creates a new `LocalBlobStore`, creating its directories if needed.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid or if the staging and assets
    /// directories live on different filesystems, `Error::Configuration` is
    /// returned.
    ///
    /// If a directory cannot be created, `Error::Io` is returned.
    #[instrument(skip_all)]
    pub async fn new(config: LocalBackendConfig) -> Result<Self> {
        config.validate()?;

        for path in [&config.staging_path, &config.assets_path] {
            tokio::fs::create_dir_all(path)
                .await
                .map_io_err(format!("could not create directory `{}`", path.display()))?;
        }

        check_same_filesystem(&config.staging_path, &config.assets_path).await?;

        let store = Self {
            staging_path: config.staging_path,
            assets_path: config.assets_path,
            prefix_size: config.prefix_size,
            file_mode: config.file_mode,
        };

        info!("initialized {}", store);

        Ok(store)
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn assets_path(&self) -> &Path {
        &self.assets_path
    }

    fn shard_path(&self, hash: &ContentHash) -> Result<PathBuf> {
        Ok(self.assets_path.join(hash.prefix(self.prefix_size)?))
    }

    fn blob_path(&self, hash: &ContentHash) -> Result<PathBuf> {
        Ok(self.shard_path(hash)?.join(hash.to_string()))
    }

    /// Writes the whole content of `reader` to a new staging file and returns
    /// it along with the hash of the content.
    ///
    /// The staging file is deleted when the returned `TempPath` is dropped,
    /// unless it was persisted first.
    async fn stage(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(TempPath, ContentHash)> {
        let staging_path = self.staging_path.clone();

        let (file, path) =
            tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(staging_path))
                .await
                .map_io_err("staging file creation was interrupted")?
                .map_io_err(format!(
                    "failed to create staging file in `{}`",
                    self.staging_path.display()
                ))?
                .into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let mut reader = HashingReader::new(reader);

        let res = async {
            tokio::io::copy(&mut reader, &mut file)
                .await
                .map_io_err(format!("failed to write staging file `{}`", path.display()))?;
            file.flush()
                .await
                .map_io_err(format!("failed to flush staging file `{}`", path.display()))?;
            file.sync_all()
                .await
                .map_io_err(format!("failed to sync staging file `{}`", path.display()))
        }
        .await;

        drop(file);

        match res {
            Ok(()) => {
                debug!(
                    "staged {} byte(s) in `{}`",
                    reader.bytes_read(),
                    path.display()
                );

                Ok((path, reader.finalize()))
            }
            Err(err) => Err(discard(path, err)),
        }
    }

    /// Moves a staging file to its final location, unless a blob already
    /// exists there.
    async fn promote(&self, staged: TempPath, hash: &ContentHash) -> Result<()> {
        let target = self.blob_path(hash)?;

        match path_exists(&target).await {
            Ok(true) => {
                debug!(%hash, "blob already exists: discarding staging file");

                // The blob is in place: a leftover staging file only wastes
                // space.
                let path = staged.to_path_buf();

                if let Err(err) = staged.close() {
                    warn!(
                        "failed to delete staging file `{}`, leaving it behind: {}",
                        path.display(),
                        err
                    );
                }

                return Ok(());
            }
            Ok(false) => {}
            Err(err) => return Err(discard(staged, err)),
        }

        let shard_path = self.shard_path(hash)?;
        let file_mode = self.file_mode;

        tokio::task::spawn_blocking(move || persist(staged, &shard_path, &target, file_mode))
            .await
            .map_io_err("blob promotion was interrupted")??;

        debug!(%hash, "promoted blob");

        Ok(())
    }
}

fn persist(staged: TempPath, shard_path: &Path, target: &Path, file_mode: u32) -> Result<()> {
    if let Err(err) = std::fs::create_dir_all(shard_path) {
        let err = Error::io(
            format!("failed to create shard directory `{}`", shard_path.display()),
            err,
        );

        return Err(discard(staged, err));
    }

    rename_into_shard(staged, shard_path, target)?;

    apply_file_mode(target, file_mode)
        .map_io_err(format!("failed to set mode of `{}`", target.display()))
}

/// Renames a staging file onto `target`.
///
/// A concurrent removal may delete the shard directory between its creation
/// and the rename: in that case it is created again and the rename is retried
/// once.
fn rename_into_shard(staged: TempPath, shard_path: &Path, target: &Path) -> Result<()> {
    let err = match staged.persist(target) {
        Ok(()) => return Ok(()),
        Err(err) if err.error.kind() == std::io::ErrorKind::NotFound => err,
        Err(err) => return Err(discard(err.path, rename_error(target, err.error))),
    };

    debug!(
        "shard directory `{}` vanished: retrying",
        shard_path.display()
    );

    if let Err(mkdir_err) = std::fs::create_dir_all(shard_path) {
        let mkdir_err = Error::io(
            format!("failed to create shard directory `{}`", shard_path.display()),
            mkdir_err,
        );

        return Err(discard(err.path, mkdir_err));
    }

    err.path
        .persist(target)
        .map_err(|err| discard(err.path, rename_error(target, err.error)))
}

fn rename_error(target: &Path, err: std::io::Error) -> Error {
    Error::io(
        format!("failed to rename staging file to `{}`", target.display()),
        err,
    )
}

/// Deletes a staging file after `err` occurred, keeping track of both
/// failures if the deletion fails too.
fn discard(staged: TempPath, err: Error) -> Error {
    match staged.close() {
        Ok(()) => err,
        Err(cleanup) => err.cleanup_failed(cleanup),
    }
}

async fn path_exists(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::io(
            format!("failed to check existence of `{}`", path.display()),
            err,
        )),
    }
}

#[cfg(unix)]
fn apply_file_mode(path: &Path, file_mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(file_mode))
}

#[cfg(not(unix))]
fn apply_file_mode(_path: &Path, _file_mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn check_same_filesystem(staging_path: &Path, assets_path: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let device = |path: &Path| {
        let path = path.to_path_buf();

        async move {
            tokio::fs::metadata(&path)
                .await
                .map(|metadata| metadata.dev())
                .map_io_err(format!("failed to read metadata of `{}`", path.display()))
        }
    };

    if device(staging_path).await? != device(assets_path).await? {
        return Err(Error::Configuration(format!(
            "the staging directory `{}` and the assets directory `{}` must be on the same filesystem",
            staging_path.display(),
            assets_path.display()
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
async fn check_same_filesystem(_staging_path: &Path, _assets_path: &Path) -> Result<()> {
    Ok(())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

impl Display for LocalBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "local (assets: {}, staging: {})",
            self.assets_path.display(),
            self.staging_path.display()
        )
    }
}

#[async_trait]
impl BlobWriter for LocalBlobStore {
    #[instrument(skip_all, fields(store = %self))]
    async fn store(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _metadata: &BlobMetadata,
    ) -> Result<ContentHash> {
        ctx.run(async {
            let (staged, hash) = self.stage(reader).await?;

            self.promote(staged, &hash).await?;

            Ok(hash)
        })
        .await
    }
}

#[async_trait]
impl HashedBlobWriter for LocalBlobStore {
    #[instrument(skip(self, ctx, reader, _metadata), fields(store = %self))]
    async fn store_hashed(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        hash: &ContentHash,
        _metadata: &BlobMetadata,
    ) -> Result<()> {
        ctx.run(async {
            if path_exists(&self.blob_path(hash)?).await? {
                debug!("blob already exists: skipping");

                return Ok(());
            }

            let (staged, actual) = self.stage(reader).await?;

            if actual != *hash {
                return Err(discard(staged, Error::hash_mismatch(*hash, actual)));
            }

            self.promote(staged, hash).await
        })
        .await
    }
}

#[async_trait]
impl BlobReader for LocalBlobStore {
    async fn fetch(&self, ctx: &Context, hash: &ContentHash) -> Result<BlobAsyncRead> {
        ctx.run(async {
            let path = self.blob_path(hash)?;

            match tokio::fs::File::open(&path).await {
                Ok(file) => Ok(Box::pin(file) as BlobAsyncRead),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::not_found(*hash))
                }
                Err(err) => Err(Error::io(
                    format!("could not open file at `{}`", path.display()),
                    err,
                )),
            }
        })
        .await
    }

    async fn size(&self, ctx: &Context, hash: &ContentHash) -> Result<u64> {
        ctx.run(async {
            let path = self.blob_path(hash)?;

            match tokio::fs::metadata(&path).await {
                Ok(metadata) => Ok(metadata.len()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::not_found(*hash))
                }
                Err(err) => Err(Error::io(
                    format!("could not get metadata for file at `{}`", path.display()),
                    err,
                )),
            }
        })
        .await
    }
}

#[async_trait]
impl BlobExistenceChecker for LocalBlobStore {
    async fn exists(&self, ctx: &Context, hash: &ContentHash) -> Result<bool> {
        ctx.run(async { path_exists(&self.blob_path(hash)?).await })
            .await
    }
}

#[async_trait]
impl BlobIterator for LocalBlobStore {
    #[instrument(skip(self, ctx, visit), fields(store = %self))]
    async fn iterate(
        &self,
        ctx: &Context,
        batch_size: usize,
        visit: &mut (dyn FnMut(Vec<ContentHash>) -> Result<()> + Send),
    ) -> Result<()> {
        let mut batcher = Batcher::new(batch_size, visit)?;

        ctx.run(async {
            let mut directories = vec![self.assets_path.clone()];

            while let Some(directory) = directories.pop() {
                ctx.check()?;

                let mut entries = Vec::new();
                let mut read_dir = tokio::fs::read_dir(&directory).await.map_io_err(format!(
                    "failed to read directory `{}`",
                    directory.display()
                ))?;

                while let Some(entry) = read_dir.next_entry().await.map_io_err(format!(
                    "failed to read directory `{}`",
                    directory.display()
                ))? {
                    let file_type = entry.file_type().await.map_io_err(format!(
                        "failed to read file type of `{}`",
                        entry.path().display()
                    ))?;

                    entries.push((entry.file_name(), entry.path(), file_type.is_dir()));
                }

                entries.sort_by(|a, b| a.0.cmp(&b.0));

                let mut subdirectories = Vec::new();

                for (name, path, is_dir) in entries {
                    let name = match name.to_str() {
                        Some(name) => name,
                        None => {
                            warn!("skipping non UTF-8 entry `{}`", path.display());
                            continue;
                        }
                    };

                    if is_hidden(name) {
                        continue;
                    }

                    if is_dir {
                        subdirectories.push(path);
                        continue;
                    }

                    match name.parse::<ContentHash>() {
                        Ok(hash) => batcher.push(hash)?,
                        Err(err) => warn!("skipping `{}`: {}", path.display(), err),
                    }
                }

                // Keep the lexical order when popping.
                directories.extend(subdirectories.into_iter().rev());
            }

            Ok(())
        })
        .await?;

        batcher.finish()
    }
}

#[async_trait]
impl BlobRemover for LocalBlobStore {
    #[instrument(skip(self, ctx), fields(store = %self))]
    async fn remove(&self, ctx: &Context, hash: &ContentHash) -> Result<()> {
        ctx.run(async {
            let shard_path = self.shard_path(hash)?;
            let path = shard_path.join(hash.to_string());

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::not_found(*hash));
                }
                Err(err) => {
                    return Err(Error::io(
                        format!("failed to remove `{}`", path.display()),
                        err,
                    ));
                }
            }

            // Only succeeds if the shard is now empty. A concurrent store or
            // removal may race us here, which is fine either way.
            match tokio::fs::remove_dir(&shard_path).await {
                Ok(()) => {
                    debug!("removed empty shard directory `{}`", shard_path.display());
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::DirectoryNotEmpty | std::io::ErrorKind::NotFound
                    ) => {}
                Err(err) => {
                    return Err(Error::io(
                        format!(
                            "failed to remove shard directory `{}`",
                            shard_path.display()
                        ),
                        err,
                    ));
                }
            }

            Ok(())
        })
        .await
    }
}

impl LocatorSource for LocalBlobStore {
    fn locator(&self, hash: &ContentHash) -> Result<String> {
        Ok(format!(
            "local:///{}/{}",
            hash.prefix(self.prefix_size)?,
            hash
        ))
    }
}
