//! Fixed-capacity FIFO byte ring for decoded bulk-IN payload.

use crate::error::{Error, Result};

/// Bounded byte FIFO. Overfilling is an error, never a silent wrap.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.count
    }

    /// Append `data`. Fails without modifying the ring if it does not fit.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.free() {
            return Err(Error::ProtocolDesync(format!(
                "ring overflow: {} bytes pending, {} arriving, capacity {}",
                self.count,
                data.len(),
                self.capacity()
            )));
        }

        let first = data.len().min(self.buf.len() - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);

        self.head = (self.head + data.len()) % self.buf.len().max(1);
        self.count += data.len();
        Ok(())
    }

    /// Remove exactly `dst.len()` bytes. Asking for more than is buffered is
    /// an underrun and leaves the ring untouched.
    pub fn pop(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.count {
            return Err(Error::ProtocolDesync(format!(
                "ring underrun: {} requested, {} buffered",
                dst.len(),
                self.count
            )));
        }

        let first = dst.len().min(self.buf.len() - self.tail);
        dst[..first].copy_from_slice(&self.buf[self.tail..self.tail + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.buf[..rest]);

        self.tail = (self.tail + dst.len()) % self.buf.len().max(1);
        self.count -= dst.len();
        Ok(())
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}
