//! libusb transport: FTDI vendor control requests plus raw bulk endpoints.
//!
//! The chip is driven directly, without the kernel's `ftdi_sio` driver (which
//! is detached on claim). The IN endpoint is serviced by a [`Drain`] for the
//! whole time the handle is open.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use super::drain::{BulkRead, Drain, RING_CAPACITY};
use super::{
    BAUD_RATE, BITMODE_RESET, LATENCY_MS, TRANSFER_TIMEOUT_MS, Transport, baud_divisor,
};
use crate::error::{Error, Result};

// FTDI SIO vendor requests.
const SIO_RESET: u8 = 0x00;
const SIO_SET_BAUD_RATE: u8 = 0x03;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0x0000;
const SIO_PURGE_RX: u16 = 0x0001;
const SIO_PURGE_TX: u16 = 0x0002;

const INTERFACE: u8 = 0;
const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;

/// Used when the endpoint descriptor cannot be read (full-speed default).
const FALLBACK_MAX_PACKET: usize = 64;

/// Background read timeout. Expiry is normal and just re-arms the read.
const DRAIN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Settle time after resetting the bit mode, before the clock is set.
const SETTLE: Duration = Duration::from_millis(10);

type Handle = Arc<DeviceHandle<Context>>;

/// Async-drain transport over libusb.
pub struct UsbTransport {
    handle: Mutex<Option<Handle>>,
    drain: Drain,
}

impl UsbTransport {
    /// Open, configure and start draining the first matching device.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
        let context = Context::new().map_err(|e| Error::io("libusb init", e))?;
        let handle = context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(Error::NotFound {
                vendor_id,
                product_id,
            })?;

        claim(&handle)?;
        if let Err(e) = bring_up(&handle) {
            release(&handle);
            return Err(e);
        }

        let max_packet = max_packet_size(&handle);
        log::debug!("bulk-in max packet size: {max_packet}");

        let handle = Arc::new(handle);
        let drain_handle = Arc::clone(&handle);
        let drain = match Drain::spawn(RING_CAPACITY, max_packet, move |buf: &mut [u8]| {
            match drain_handle.read_bulk(EP_IN, buf, DRAIN_POLL_TIMEOUT) {
                Ok(n) => BulkRead::Data(n),
                Err(rusb::Error::Timeout) => BulkRead::Timeout,
                Err(e) => BulkRead::Failed(e.to_string()),
            }
        }) {
            Ok(drain) => drain,
            Err(e) => {
                release(&handle);
                return Err(e);
            }
        };

        log::info!("opened {vendor_id:04x}:{product_id:04x} via libusb");
        Ok(Self {
            handle: Mutex::new(Some(handle)),
            drain,
        })
    }

    fn live_handle(&self) -> Result<Handle> {
        if self.drain.is_closed() {
            return Err(Error::Closed);
        }
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)
    }
}

impl Transport for UsbTransport {
    fn name(&self) -> &'static str {
        "libusb"
    }

    fn set_bit_mode(&self, mask: u8, mode: u8) -> Result<()> {
        let handle = self.live_handle()?;
        control_out(&handle, SIO_SET_BITMODE, u16::from(mask) | (u16::from(mode) << 8))?;
        log::debug!("bit mode {mode:#04x}, mask {mask:#04x}");

        self.drain.reset_with(|| {
            control_out(&handle, SIO_RESET, SIO_PURGE_RX)?;
            control_out(&handle, SIO_RESET, SIO_PURGE_TX)
        })
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let handle = self.live_handle()?;
        let timeout = Duration::from_millis(TRANSFER_TIMEOUT_MS);
        let mut total = 0;

        while total < data.len() {
            let n = handle
                .write_bulk(EP_OUT, &data[total..], timeout)
                .map_err(|e| Error::io("bulk write", e))?;
            if n == 0 {
                return Err(Error::io(
                    "bulk write",
                    format!("short write: {total} of {} bytes", data.len()),
                ));
            }
            total += n;
        }
        log::trace!("wrote {total} bytes");
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.drain.read(buf)
    }

    fn max_transfer(&self) -> usize {
        RING_CAPACITY
    }

    fn close(&self) -> Result<()> {
        self.drain.close();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = control_out(&handle, SIO_SET_BITMODE, u16::from(BITMODE_RESET)) {
                log::debug!("bit mode reset on close: {e}");
            }
            release(&handle);
            log::info!("closed libusb transport");
        }
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn claim(handle: &DeviceHandle<Context>) -> Result<()> {
    // Not supported on every platform; claiming fails loudly if it mattered.
    let _ = handle.set_auto_detach_kernel_driver(true);

    match handle.set_active_configuration(1) {
        Ok(()) | Err(rusb::Error::Busy) => {}
        Err(e) => return Err(Error::io("set configuration", e)),
    }
    handle
        .claim_interface(INTERFACE)
        .map_err(|e| Error::io("claim interface", e))
}

fn bring_up(handle: &DeviceHandle<Context>) -> Result<()> {
    control_out(handle, SIO_RESET, SIO_RESET_SIO)?;
    control_out(handle, SIO_RESET, SIO_PURGE_RX)?;
    control_out(handle, SIO_RESET, SIO_PURGE_TX)?;
    control_out(handle, SIO_SET_BITMODE, u16::from(BITMODE_RESET))?;
    control_out(handle, SIO_SET_LATENCY_TIMER, u16::from(LATENCY_MS))?;

    std::thread::sleep(SETTLE);

    let divisor = baud_divisor(BAUD_RATE);
    control_out(handle, SIO_SET_BAUD_RATE, divisor)?;
    log::info!("bit clock {BAUD_RATE} Hz (divisor {divisor})");
    Ok(())
}

fn release(handle: &DeviceHandle<Context>) {
    if let Err(e) = handle.release_interface(INTERFACE) {
        log::debug!("release interface: {e}");
    }
}

fn max_packet_size(handle: &DeviceHandle<Context>) -> usize {
    let Ok(config) = handle.device().active_config_descriptor() else {
        return FALLBACK_MAX_PACKET;
    };
    config
        .interfaces()
        .flat_map(|iface| iface.descriptors())
        .flat_map(|desc| {
            desc.endpoint_descriptors()
                .filter(|ep| ep.address() == EP_IN)
                .map(|ep| usize::from(ep.max_packet_size()))
                .collect::<Vec<_>>()
        })
        .find(|&mps| mps > 0)
        .unwrap_or(FALLBACK_MAX_PACKET)
}

fn control_out(handle: &DeviceHandle<Context>, request: u8, value: u16) -> Result<()> {
    let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
    let index = u16::from(INTERFACE) + 1;
    handle
        .write_control(
            request_type,
            request,
            value,
            index,
            &[],
            Duration::from_millis(TRANSFER_TIMEOUT_MS),
        )
        .map(|_| ())
        .map_err(|e| Error::io("control request", e))
}
