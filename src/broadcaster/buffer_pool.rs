use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::trace;

/// A fixed number of transmit buffers that are allocated once and then reused. A buffer is
///  handed out as a [TxBuffer] handle which puts the buffer back into the pool when it is
///  dropped, regardless of whether it was sent or not.
pub struct TxBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
    available: Arc<Semaphore>,
}

impl TxBufferPool {
    pub fn new(buf_size: usize, pool_size: usize) -> Arc<TxBufferPool> {
        let buffers = (0..pool_size)
            .map(|_| BytesMut::with_capacity(buf_size))
            .collect();

        Arc::new(TxBufferPool {
            buf_size,
            buffers: Mutex::new(buffers),
            available: Arc::new(Semaphore::new(pool_size)),
        })
    }

    pub fn num_available(&self) -> usize {
        self.available.available_permits()
    }

    /// Waits up to `max_wait` for a free buffer, returning `None` if none became available
    pub async fn acquire(self: &Arc<Self>, max_wait: Duration) -> Option<TxBuffer> {
        let permit = match timeout(max_wait, self.available.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return None,
        };

        let buf = self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_size));

        trace!("acquired transmit buffer, {} left in pool", self.num_available());
        Some(TxBuffer {
            buf,
            pool: self.clone(),
            _permit: permit,
        })
    }

    fn return_to_pool(&self, mut buf: BytesMut) {
        buf.clear();
        self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }
}


pub struct TxBuffer {
    buf: BytesMut,
    pool: Arc<TxBufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl TxBuffer {
    pub fn put_slice(&mut self, data: &[u8]) {
        assert!(self.buf.len() + data.len() <= self.pool.buf_size,
                "transmit buffer overflow: {} + {} bytes exceeds buffer size {}", self.buf.len(), data.len(), self.pool.buf_size);
        self.buf.put_slice(data);
    }
}

impl Deref for TxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for TxBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Debug for TxBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxBuffer{:?}", self.buf.as_ref())
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        // the permit is released after this, so the buffer is back in place before anybody can
        //  acquire it
        self.pool.return_to_pool(std::mem::take(&mut self.buf));
    }
}
