use crate::{ContentHash, Error, Result};

/// Accumulates hashes and hands them to a visitor in batches of a fixed size.
///
/// Every backend enumerates its blobs through a `Batcher` so that batching
/// and stop-on-error behave the same regardless of how the listing is
/// produced: the visitor is called once per full batch, once more for a
/// trailing partial batch, and the first error it returns is final.
pub(crate) struct Batcher<F> {
    batch_size: usize,
    batch: Vec<ContentHash>,
    visit: F,
}

impl<F> Batcher<F>
where
    F: FnMut(Vec<ContentHash>) -> Result<()>,
{
    pub(crate) fn new(batch_size: usize, visit: F) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument(
                "the iteration batch size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            batch_size,
            batch: Vec::with_capacity(batch_size),
            visit,
        })
    }

    pub(crate) fn push(&mut self, hash: ContentHash) -> Result<()> {
        self.batch.push(hash);

        if self.batch.len() == self.batch_size {
            let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));

            (self.visit)(batch)?;
        }

        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        if self.batch.is_empty() {
            Ok(())
        } else {
            (self.visit)(std::mem::take(&mut self.batch))
        }
    }
}
