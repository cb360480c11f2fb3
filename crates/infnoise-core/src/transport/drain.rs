//! Background drain for the bulk-IN endpoint.
//!
//! In synchronous bit-bang mode every byte written OUT produces a byte IN.
//! If nobody is reading IN while a large OUT transfer streams, the chip's
//! receive FIFO fills and both directions stall. The drain keeps a short
//! timeout read pending for the whole life of the handle, strips the 2-byte
//! modem status header from every USB packet, and queues the payload in a
//! bounded [`RingBuffer`] for [`Drain::read`].
//!
//! The producer never waits on the consumer. Hardware cadence cannot be
//! slowed down, so a full ring is fatal ([`Error::ProtocolDesync`]).

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use super::ring::RingBuffer;
use crate::error::{Error, Result};

/// Default ring capacity for decoded payload.
pub const RING_CAPACITY: usize = 64 * 1024;

/// Status bytes at the start of every FTDI bulk-IN packet.
pub const PACKET_HEADER_LEN: usize = 2;

/// Size of the buffer handed to each background bulk read.
const SCRATCH_LEN: usize = 4096;

/// Outcome of one background bulk-IN poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkRead {
    /// `n` bytes (packet headers included) landed at the start of the buffer.
    Data(usize),
    /// Nothing arrived before the poll timeout. Retried.
    Timeout,
    /// Any other hardware error. Terminal.
    Failed(String),
}

struct State {
    ring: RingBuffer,
    closed: bool,
    fault: Option<Error>,
    /// Bumped by every reset. Transfers armed under an older value are
    /// dropped on arrival.
    generation: u64,
    /// Generation the in-flight transfer was armed under.
    armed: u64,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shut(&self, state: &mut State, fault: Option<Error>) {
        state.closed = true;
        if state.fault.is_none() {
            state.fault = fault;
        }
        self.ready.notify_all();
    }
}

/// Owns the background reader thread and the ring it fills.
pub struct Drain {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drain {
    /// Start draining. `bulk_in` is called in a loop on a dedicated thread
    /// until the drain is closed or it reports [`BulkRead::Failed`].
    /// `packet_size` is the endpoint's max packet size.
    pub fn spawn<F>(capacity: usize, packet_size: usize, bulk_in: F) -> Result<Self>
    where
        F: FnMut(&mut [u8]) -> BulkRead + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                ring: RingBuffer::new(capacity),
                closed: false,
                fault: None,
                generation: 0,
                armed: 0,
            }),
            ready: Condvar::new(),
        });

        let pump_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("infnoise-drain".to_string())
            .spawn(move || pump(&pump_shared, packet_size, bulk_in))
            .map_err(|e| Error::io("spawn drain thread", e))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Block until exactly `dst.len()` payload bytes have been copied out.
    ///
    /// Returns [`Error::Closed`] once the drain is shut down, or the fault
    /// that shut it down.
    pub fn read(&self, dst: &mut [u8]) -> Result<()> {
        let mut state = self.shared.lock();
        let mut filled = 0;

        while filled < dst.len() {
            while !state.closed && state.ring.is_empty() {
                state = self
                    .shared
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.closed {
                return Err(state.fault.clone().unwrap_or(Error::Closed));
            }

            let n = state.ring.len().min(dst.len() - filled);
            state.ring.pop(&mut dst[filled..filled + n])?;
            filled += n;
        }
        Ok(())
    }

    /// Run `purge` with the ring locked, discard everything buffered, and
    /// wait until the background thread has re-armed its read.
    ///
    /// A transfer already in flight when this is called may carry bytes
    /// clocked under the previous wire mode; it is dropped when it lands.
    /// Returns once every later transfer is armed after the purge, so bytes
    /// clocked by the next write are never discarded.
    pub fn reset_with<F>(&self, purge: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(state.fault.clone().unwrap_or(Error::Closed));
        }
        state.generation += 1;
        let result = purge();
        state.ring.clear();

        while !state.closed && state.armed != state.generation {
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        log::debug!("drain: reset to generation {}", state.generation);
        result
    }

    /// Bytes currently queued.
    pub fn buffered(&self) -> usize {
        self.shared.lock().ring.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop the background thread and wake every blocked reader.
    /// Idempotent; returns once the thread has exited.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if !state.closed {
                self.shared.shut(&mut state, None);
            }
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                log::error!("drain thread panicked");
            }
        }
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split a bulk transfer into packets and yield each payload without its
/// status header. Header-only packets yield nothing.
pub fn packet_payloads(data: &[u8], packet_size: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(packet_size.max(PACKET_HEADER_LEN + 1))
        .filter(|pkt| pkt.len() > PACKET_HEADER_LEN)
        .map(|pkt| &pkt[PACKET_HEADER_LEN..])
}

fn pump<F>(shared: &Shared, packet_size: usize, mut bulk_in: F)
where
    F: FnMut(&mut [u8]) -> BulkRead,
{
    let mut scratch = vec![0u8; SCRATCH_LEN];

    loop {
        let generation = {
            let mut state = shared.lock();
            if state.closed {
                return;
            }
            if state.armed != state.generation {
                state.armed = state.generation;
                shared.ready.notify_all();
            }
            state.generation
        };

        let n = match bulk_in(&mut scratch) {
            BulkRead::Data(n) => n.min(scratch.len()),
            BulkRead::Timeout => 0,
            BulkRead::Failed(status) => {
                log::error!("bulk-in drain failed: {status}");
                let mut state = shared.lock();
                shared.shut(&mut state, None);
                return;
            }
        };
        if n == 0 {
            continue;
        }

        let mut state = shared.lock();
        if state.closed {
            return;
        }
        if state.generation != generation {
            log::debug!("drain: dropped {n} bytes clocked before a reset");
            continue;
        }

        log::trace!("drain: {n} bytes in");
        for payload in packet_payloads(&scratch[..n], packet_size) {
            if let Err(e) = state.ring.push(payload) {
                log::error!("drain: {e}");
                shared.shut(&mut state, Some(e));
                return;
            }
        }
        shared.ready.notify_all();
    }
}
