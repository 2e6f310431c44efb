//! Record id allocation.
//!
//! Ids are reserved from the server in batches and handed out from a local
//! pool. An id is never handed out twice, even across refills.

use std::future::Future;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use examsync_core::RecordId;
use rand::Rng;

use crate::error::AllocatorError;

/// Reserves a contiguous range of unused ids.
pub trait IdSource: Send + Sync + 'static {
    fn reserve(&self, count: u32)
    -> impl Future<Output = Result<Range<i64>, AllocatorError>> + Send;
}

impl<S: IdSource> IdSource for Arc<S> {
    fn reserve(
        &self,
        count: u32,
    ) -> impl Future<Output = Result<Range<i64>, AllocatorError>> + Send {
        (**self).reserve(count)
    }
}

#[derive(Debug, Default)]
struct Pool {
    next: i64,
    end: i64,
    high_water: i64,
}

impl Pool {
    fn take(&mut self) -> Option<RecordId> {
        if self.next >= self.end {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(RecordId::new(id))
    }

    fn install(&mut self, range: Range<i64>) -> Result<(), AllocatorError> {
        if range.is_empty() {
            return Err(AllocatorError::EmptyRange);
        }
        if range.start < self.high_water {
            return Err(AllocatorError::Overlap {
                start: range.start,
                end: range.end,
            });
        }
        self.next = range.start;
        self.end = range.end;
        self.high_water = range.end;
        Ok(())
    }
}

pub struct IdAllocator<S> {
    source: S,
    batch_size: u32,
    pool: Mutex<Pool>,
    refill: tokio::sync::Mutex<()>,
}

impl<S: IdSource> IdAllocator<S> {
    pub fn new(source: S, batch_size: u32) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            pool: Mutex::new(Pool::default()),
            refill: tokio::sync::Mutex::new(()),
        }
    }

    /// Take an id from the pool without reserving more.
    pub fn try_allocate(&self) -> Option<RecordId> {
        self.pool().take()
    }

    pub fn available(&self) -> usize {
        let pool = self.pool();
        usize::try_from(pool.end - pool.next).unwrap_or(0)
    }

    /// Take an id, reserving a new batch when the pool runs dry.
    ///
    /// Concurrent callers share one reservation.
    pub async fn allocate(&self) -> Result<RecordId, AllocatorError> {
        if let Some(id) = self.try_allocate() {
            return Ok(id);
        }
        let _refill = self.refill.lock().await;
        if let Some(id) = self.try_allocate() {
            return Ok(id);
        }
        let range = self.source.reserve(self.batch_size).await?;
        tracing::debug!(start = range.start, end = range.end, "reserved id batch");
        let mut pool = self.pool();
        pool.install(range)?;
        pool.take().ok_or(AllocatorError::EmptyRange)
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Id source that needs no server: ids are the current time in
/// milliseconds times a thousand plus a random suffix, kept strictly
/// increasing within the process.
#[derive(Debug, Default)]
pub struct ClockIdSource {
    last: Mutex<i64>,
}

impl ClockIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve_now(&self, count: u32) -> Result<Range<i64>, AllocatorError> {
        if count == 0 {
            return Err(AllocatorError::EmptyRange);
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AllocatorError::Source(e.to_string()))?
            .as_millis();
        let millis = i64::try_from(millis).map_err(|e| AllocatorError::Source(e.to_string()))?;
        let candidate = millis * 1000 + rand::thread_rng().gen_range(0..1000);

        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = candidate.max(*last);
        let end = start + i64::from(count);
        *last = end;
        Ok(start..end)
    }
}

impl IdSource for ClockIdSource {
    fn reserve(
        &self,
        count: u32,
    ) -> impl Future<Output = Result<Range<i64>, AllocatorError>> + Send {
        std::future::ready(self.reserve_now(count))
    }
}
