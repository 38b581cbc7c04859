use std::{
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::ContentHash;

/// An `AsyncRead` adapter that feeds every byte it reads into a SHA-256
/// digest, so that content can be hashed while it is being persisted.
#[pin_project]
pub struct HashingReader<R> {
    #[pin]
    inner: R,
    digest: Sha256,
    bytes_read: u64,
}

impl<R: AsyncRead> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// The number of bytes that went through the reader so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consumes the reader and returns the hash of everything read.
    pub fn finalize(self) -> ContentHash {
        let digest: [u8; 32] = self.digest.finalize().into();

        digest.into()
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = &buf.filled()[before..];

                this.digest.update(read);
                *this.bytes_read += read.len() as u64;

                Poll::Ready(Ok(()))
            }
            poll => poll,
        }
    }
}
