//! Fixed send-buffer pool.
//!
//! Bounds the amount of not-yet-consumed outbound data per CLA instance.
//! One slot is held per submitted chunk; the transport releases it by
//! calling [`PoolBuf::complete`] once it has finished with the data, so
//! flow control is tied to transport consumption, not submission.

use crate::ClaError;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool of a fixed number of send-buffer slots.
#[derive(Debug, Clone)]
pub struct SendPool {
    slots: Arc<Semaphore>,
    buf_size: usize,
}

impl SendPool {
    /// Create a pool of `slots` buffers of `buf_size` bytes each.
    pub fn new(slots: usize, buf_size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots)),
            buf_size,
        }
    }

    /// Acquire one slot, waiting if the pool is exhausted.
    ///
    /// Fails only on structural breakage (the pool was closed), never on
    /// contention.
    pub async fn acquire(&self) -> Result<PoolBuf, ClaError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClaError::PoolClosed)?;
        Ok(PoolBuf {
            data: BytesMut::with_capacity(self.buf_size),
            _permit: permit,
        })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// One acquired send buffer.
///
/// The slot is released by [`PoolBuf::complete`]; dropping the buffer
/// without completion also releases it, so a failed transport path cannot
/// leak slots.
#[derive(Debug)]
pub struct PoolBuf {
    /// Chunk bytes to transmit
    pub data: BytesMut,
    _permit: OwnedSemaphorePermit,
}

impl PoolBuf {
    /// Transport-finished-with-this-buffer: release the pool slot.
    pub fn complete(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_slot_released_on_complete() {
        let pool = SendPool::new(1, 64);
        let buf = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        // pool exhausted: a second acquire must wait
        assert!(timeout(Duration::from_millis(20), pool.acquire())
            .await
            .is_err());

        buf.complete();
        assert_eq!(pool.available(), 1);
        let _buf = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_is_a_safety_net() {
        let pool = SendPool::new(2, 64);
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }
}
