//! Id partitioning for batch dispatch
//!
//! Ids are enumerated from a collection in large super-batches and then
//! re-split into worker-sized batches. Every id ends up in exactly one
//! batch, in enumeration order.

use crate::error::{PipelineError, Result};

/// Super-batch multiplier used when enumerating ids from a collection.
pub const ID_FEED_FACTOR: usize = 10;

/// Id enumeration batch size for worker batches of `batch_size`.
pub fn id_feed_size(batch_size: usize) -> usize {
    batch_size.saturating_mul(ID_FEED_FACTOR)
}

/// Number of batches needed for `total` items: `ceil(total / batch_size)`.
pub fn batch_count(total: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    total.div_ceil(batch_size)
}

/// Split `ids` into consecutive batches of at most `batch_size`.
pub fn iter_n(ids: &[String], batch_size: usize) -> impl Iterator<Item = Vec<String>> + '_ {
    ids.chunks(batch_size.max(1)).map(<[String]>::to_vec)
}

/// Re-split a stream of super-batches into batches of at most `batch_size`.
///
/// Batch boundaries follow super-batch boundaries, so a short trailing batch
/// can appear at the end of each super-batch.
pub fn repartition<I>(super_batches: I, batch_size: usize) -> Repartition<I::IntoIter>
where
    I: IntoIterator<Item = Result<Vec<String>>>,
{
    Repartition {
        inner: super_batches.into_iter(),
        current: Vec::new(),
        offset: 0,
        batch_size: batch_size.max(1),
        failed: false,
    }
}

pub struct Repartition<I> {
    inner: I,
    current: Vec<String>,
    offset: usize,
    batch_size: usize,
    failed: bool,
}

impl<I> Iterator for Repartition<I>
where
    I: Iterator<Item = Result<Vec<String>>>,
{
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.offset >= self.current.len() {
            match self.inner.next()? {
                Ok(batch) => {
                    self.current = batch;
                    self.offset = 0;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        let end = self.offset.saturating_add(self.batch_size).min(self.current.len());
        let batch = self.current[self.offset..end].to_vec();
        self.offset = end;
        Some(Ok(batch))
    }
}

/// Reject a zero batch size before any work is scheduled.
pub fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(PipelineError::Config("batch_size must be > 0".into()));
    }
    Ok(())
}
