//! FTDI D2XX transport.
//!
//! The vendor library keeps its own IN transfers pending, so no drain thread
//! is needed: every write is followed by a blocking read of the same length
//! on the calling thread. Linked through `build.rs` when the `d2xx` feature
//! is enabled.

use std::ffi::{c_uchar, c_ulong, c_ushort, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    BAUD_RATE, BITMODE_RESET, LATENCY_MS, TRANSFER_TIMEOUT_MS, Transport, fill_exact,
};
use crate::error::{Error, Result};

type FtHandle = *mut c_void;
type FtStatus = c_ulong;
type Dword = u32;

const FT_OK: FtStatus = 0;
const FT_OPEN_BY_SERIAL_NUMBER: Dword = 1;
const FT_PURGE_RX: c_ulong = 1;
const FT_PURGE_TX: c_ulong = 2;
const FT_FLOW_NONE: c_ushort = 0x0000;

/// Driver-side USB request size in each direction.
const USB_TRANSFER_SIZE: usize = 65_536;

/// Largest single `FT_Read`; a pending close is noticed between reads.
const READ_CHUNK: usize = 4096;

/// Bytes exchanged after a mode switch to flush the chip's pipeline.
const PRIME_LEN: usize = 64;

const SETTLE: std::time::Duration = std::time::Duration::from_millis(50);

unsafe extern "system" {
    fn FT_CreateDeviceInfoList(num_devs: *mut Dword) -> FtStatus;
    fn FT_GetDeviceInfoDetail(
        index: Dword,
        flags: *mut Dword,
        dev_type: *mut Dword,
        id: *mut Dword,
        loc_id: *mut Dword,
        serial: *mut c_void,
        description: *mut c_void,
        handle: *mut FtHandle,
    ) -> FtStatus;
    fn FT_OpenEx(arg: *mut c_void, flags: Dword, handle: *mut FtHandle) -> FtStatus;
    fn FT_Close(handle: FtHandle) -> FtStatus;
    fn FT_ResetDevice(handle: FtHandle) -> FtStatus;
    fn FT_Purge(handle: FtHandle, mask: c_ulong) -> FtStatus;
    fn FT_SetUSBParameters(handle: FtHandle, in_size: c_ulong, out_size: c_ulong) -> FtStatus;
    fn FT_SetChars(
        handle: FtHandle,
        event_char: c_uchar,
        event_enabled: c_uchar,
        error_char: c_uchar,
        error_enabled: c_uchar,
    ) -> FtStatus;
    fn FT_SetFlowControl(handle: FtHandle, flow: c_ushort, xon: c_uchar, xoff: c_uchar) -> FtStatus;
    fn FT_SetLatencyTimer(handle: FtHandle, latency: c_uchar) -> FtStatus;
    fn FT_SetTimeouts(handle: FtHandle, read_ms: c_ulong, write_ms: c_ulong) -> FtStatus;
    fn FT_SetBitMode(handle: FtHandle, mask: c_uchar, mode: c_uchar) -> FtStatus;
    fn FT_SetBaudRate(handle: FtHandle, baud: c_ulong) -> FtStatus;
    fn FT_Write(handle: FtHandle, buf: *mut c_void, len: Dword, written: *mut Dword) -> FtStatus;
    fn FT_Read(handle: FtHandle, buf: *mut c_void, len: Dword, returned: *mut Dword) -> FtStatus;
}

/// Owned D2XX handle.
struct RawHandle(FtHandle);

// SAFETY: D2XX handles are plain tokens that may be used from any thread;
// all access goes through the transport's mutex.
unsafe impl Send for RawHandle {}

fn check(op: &'static str, status: FtStatus) -> Result<()> {
    if status == FT_OK {
        Ok(())
    } else {
        Err(Error::io(op, format!("FT_STATUS {status}")))
    }
}

/// Synchronous transport over FTDI's vendor library.
pub struct D2xxTransport {
    handle: Mutex<Option<RawHandle>>,
    /// Set by `close` before it takes the handle lock.
    closed: AtomicBool,
}

impl D2xxTransport {
    /// Open and configure the first device whose id matches.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
        let serial = find_serial(vendor_id, product_id)?;
        let mut serial_z = serial.into_bytes();
        serial_z.push(0);

        let mut raw: FtHandle = std::ptr::null_mut();
        // SAFETY: serial_z is NUL-terminated and outlives the call; raw is a
        // valid out-pointer.
        let status = unsafe {
            FT_OpenEx(
                serial_z.as_mut_ptr().cast(),
                FT_OPEN_BY_SERIAL_NUMBER,
                &mut raw,
            )
        };
        check("FT_OpenEx", status)?;

        let transport = Self {
            handle: Mutex::new(Some(RawHandle(raw))),
            closed: AtomicBool::new(false),
        };
        if let Err(e) = transport.bring_up() {
            let _ = transport.close();
            return Err(e);
        }
        log::info!("opened {vendor_id:04x}:{product_id:04x} via d2xx");
        Ok(transport)
    }

    fn lock(&self) -> MutexGuard<'_, Option<RawHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the handle unless a close is pending.
    fn live(&self) -> Result<MutexGuard<'_, Option<RawHandle>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self.lock())
    }

    fn bring_up(&self) -> Result<()> {
        let guard = self.lock();
        let h = guard.as_ref().ok_or(Error::Closed)?.0;

        // SAFETY: h is an open handle, kept alive by the guard for this block.
        unsafe {
            check("FT_ResetDevice", FT_ResetDevice(h))?;
            check("FT_Purge", FT_Purge(h, FT_PURGE_RX | FT_PURGE_TX))?;
            check(
                "FT_SetUSBParameters",
                FT_SetUSBParameters(h, USB_TRANSFER_SIZE as c_ulong, USB_TRANSFER_SIZE as c_ulong),
            )?;
            check("FT_SetChars", FT_SetChars(h, 0, 0, 0, 0))?;
            check("FT_SetFlowControl", FT_SetFlowControl(h, FT_FLOW_NONE, 0, 0))?;
            check("FT_SetLatencyTimer", FT_SetLatencyTimer(h, LATENCY_MS))?;
            check(
                "FT_SetTimeouts",
                FT_SetTimeouts(h, TRANSFER_TIMEOUT_MS as c_ulong, TRANSFER_TIMEOUT_MS as c_ulong),
            )?;
            check("FT_SetBitMode", FT_SetBitMode(h, 0, BITMODE_RESET))?;
        }

        std::thread::sleep(SETTLE);

        // SAFETY: as above.
        check("FT_SetBaudRate", unsafe { FT_SetBaudRate(h, BAUD_RATE as c_ulong) })?;
        log::info!("bit clock {BAUD_RATE} Hz");
        Ok(())
    }
}

fn write_exact(h: FtHandle, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut written: Dword = 0;
    // SAFETY: data is valid for len bytes; D2XX only reads from the buffer
    // despite the non-const pointer in its signature.
    let status = unsafe {
        FT_Write(
            h,
            data.as_ptr().cast_mut().cast(),
            data.len() as Dword,
            &mut written,
        )
    };
    check("FT_Write", status)?;
    if written as usize != data.len() {
        return Err(Error::io(
            "FT_Write",
            format!("short write: {written} of {} bytes", data.len()),
        ));
    }
    Ok(())
}

fn read_exact(h: FtHandle, buf: &mut [u8], closed: &AtomicBool) -> Result<()> {
    fill_exact("FT_Read", buf, closed, |rest| {
        let len = rest.len().min(READ_CHUNK);
        let mut got: Dword = 0;
        // SAFETY: rest is a valid writable region of at least len bytes.
        let status = unsafe { FT_Read(h, rest.as_mut_ptr().cast(), len as Dword, &mut got) };
        check("FT_Read", status)?;
        Ok(got as usize)
    })
}

impl Transport for D2xxTransport {
    fn name(&self) -> &'static str {
        "d2xx"
    }

    fn set_bit_mode(&self, mask: u8, mode: u8) -> Result<()> {
        let guard = self.live()?;
        let h = guard.as_ref().ok_or(Error::Closed)?.0;

        // SAFETY: h stays open while the guard is held.
        check("FT_SetBitMode", unsafe { FT_SetBitMode(h, mask, mode) })?;

        let mut prime = [0u8; PRIME_LEN];
        write_exact(h, &prime)?;
        read_exact(h, &mut prime, &self.closed)?;

        // SAFETY: as above.
        check("FT_Purge", unsafe { FT_Purge(h, FT_PURGE_RX | FT_PURGE_TX) })?;
        log::debug!("bit mode {mode:#04x}, mask {mask:#04x}");
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let guard = self.live()?;
        let h = guard.as_ref().ok_or(Error::Closed)?.0;
        write_exact(h, data)
    }

    fn read(&self, buf: &mut [u8]) -> Result<()> {
        let guard = self.live()?;
        let h = guard.as_ref().ok_or(Error::Closed)?.0;
        read_exact(h, buf, &self.closed)
    }

    fn max_transfer(&self) -> usize {
        USB_TRANSFER_SIZE
    }

    fn close(&self) -> Result<()> {
        // Readers holding the lock bail out at their next chunk.
        self.closed.store(true, Ordering::Release);

        if let Some(RawHandle(h)) = self.lock().take() {
            // SAFETY: h was opened by FT_OpenEx and is closed exactly once.
            let (reset, close) = unsafe { (FT_SetBitMode(h, 0, BITMODE_RESET), FT_Close(h)) };
            if reset != FT_OK {
                log::debug!("bit mode reset on close: FT_STATUS {reset}");
            }
            if close != FT_OK {
                log::warn!("FT_Close: FT_STATUS {close}");
            }
            log::info!("closed d2xx transport");
        }
        Ok(())
    }
}

impl Drop for D2xxTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Serial number of the first listed device with a matching id.
fn find_serial(vendor_id: u16, product_id: u16) -> Result<String> {
    let not_found = Error::NotFound {
        vendor_id,
        product_id,
    };

    let mut count: Dword = 0;
    // SAFETY: count is a valid out-pointer.
    check("FT_CreateDeviceInfoList", unsafe {
        FT_CreateDeviceInfoList(&mut count)
    })?;

    let want = (u32::from(vendor_id) << 16) | u32::from(product_id);
    for index in 0..count {
        let (mut flags, mut dev_type, mut id, mut loc_id) = (0, 0, 0, 0);
        let mut serial = [0u8; 16];
        let mut description = [0u8; 64];
        let mut unused: FtHandle = std::ptr::null_mut();

        // SAFETY: every pointer refers to a live local of the size D2XX
        // documents (16-byte serial, 64-byte description).
        let status = unsafe {
            FT_GetDeviceInfoDetail(
                index,
                &mut flags,
                &mut dev_type,
                &mut id,
                &mut loc_id,
                serial.as_mut_ptr().cast(),
                description.as_mut_ptr().cast(),
                &mut unused,
            )
        };
        if status != FT_OK || id != want {
            continue;
        }

        let len = serial.iter().position(|&b| b == 0).unwrap_or(serial.len());
        if len == 0 {
            continue;
        }
        return Ok(String::from_utf8_lossy(&serial[..len]).into_owned());
    }
    Err(not_found)
}
