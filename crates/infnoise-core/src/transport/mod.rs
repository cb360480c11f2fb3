//! Byte-level links to the FT240X on the carrier board.
//!
//! Two implementations sit behind the [`Transport`] trait and are chosen at
//! build time:
//!
//! - **libusb** (`libusb` feature, default): raw bulk transfers through
//!   `rusb`, with a background [`Drain`] keeping the IN endpoint serviced.
//! - **D2XX** (`d2xx` feature): FTDI's vendor library, which drains the
//!   endpoint itself, so reads and writes simply alternate on the caller's
//!   thread.
//!
//! Both perform the same bring-up on open: reset, purge both directions,
//! reset the bit mode, minimum latency, then a 30 kHz bit clock.

pub mod drain;
pub mod ring;

#[cfg(feature = "d2xx")]
pub mod d2xx;
#[cfg(feature = "libusb")]
pub mod usb;

pub use drain::{BulkRead, Drain};
pub use ring::RingBuffer;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Bit mode value that leaves bit-bang and returns to the UART.
pub const BITMODE_RESET: u8 = 0x00;
/// Synchronous bit-bang: one byte read back per byte written.
pub const BITMODE_SYNC_BITBANG: u8 = 0x04;

/// Bit clock the board is designed for.
pub const BAUD_RATE: u32 = 30_000;
/// FT240X base clock used to derive the divisor.
pub const BASE_CLOCK: u32 = 3_000_000;
/// Latency timer, the smallest value the chip accepts reliably.
pub const LATENCY_MS: u8 = 2;
/// Per-transfer timeout.
pub const TRANSFER_TIMEOUT_MS: u64 = 5_000;

/// Clock divisor for [`BAUD_RATE`] (100).
pub const fn baud_divisor(baud: u32) -> u16 {
    (BASE_CLOCK / baud) as u16
}

/// Blocking, full-duplex byte link to the board.
///
/// Every method takes `&self` so that [`close`](Transport::close) can be
/// called from another thread while a read is blocked.
pub trait Transport: Send + Sync {
    /// Short name for logs (`"libusb"`, `"d2xx"`, ...).
    fn name(&self) -> &'static str;

    /// Switch the wire mode and purge anything buffered under the old one.
    fn set_bit_mode(&self, mask: u8, mode: u8) -> Result<()>;

    /// Write the whole buffer. A short transfer is an error.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Block until exactly `buf.len()` payload bytes have been read.
    fn read(&self, buf: &mut [u8]) -> Result<()>;

    /// Largest payload one write/read exchange may carry.
    fn max_transfer(&self) -> usize {
        usize::MAX
    }

    /// Release the hardware. Idempotent, and wakes blocked readers.
    fn close(&self) -> Result<()>;
}

/// Fill `buf` through repeated `read_chunk` calls, giving up with
/// [`Error::Closed`] as soon as `closed` is set between calls. A call that
/// returns no bytes is a timeout.
pub fn fill_exact<F>(
    op: &'static str,
    buf: &mut [u8],
    closed: &AtomicBool,
    mut read_chunk: F,
) -> Result<()>
where
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    let mut total = 0;
    while total < buf.len() {
        if closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let got = read_chunk(&mut buf[total..])?;
        if got == 0 {
            return Err(Error::io(
                op,
                format!("timeout: {total} of {} bytes", buf.len()),
            ));
        }
        total += got;
    }
    Ok(())
}

/// Open the first board matching `vendor_id:product_id` with the transport
/// compiled into this build.
#[cfg(feature = "d2xx")]
pub fn open_default(vendor_id: u16, product_id: u16) -> Result<Box<dyn Transport>> {
    Ok(Box::new(d2xx::D2xxTransport::open(vendor_id, product_id)?))
}

/// Open the first board matching `vendor_id:product_id` with the transport
/// compiled into this build.
#[cfg(all(feature = "libusb", not(feature = "d2xx")))]
pub fn open_default(vendor_id: u16, product_id: u16) -> Result<Box<dyn Transport>> {
    Ok(Box::new(usb::UsbTransport::open(vendor_id, product_id)?))
}

/// No hardware transport compiled in: every open fails.
#[cfg(not(any(feature = "libusb", feature = "d2xx")))]
pub fn open_default(vendor_id: u16, product_id: u16) -> Result<Box<dyn Transport>> {
    log::warn!("built without a hardware transport (enable `libusb` or `d2xx`)");
    Err(Error::NotFound {
        vendor_id,
        product_id,
    })
}
