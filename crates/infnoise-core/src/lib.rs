//! # infnoise-core
//!
//! **A driver for the Infinite Noise TRNG.**
//!
//! The board is a modular-entropy multiplier whose two comparator outputs are
//! sampled through an FTDI FT240X running in synchronous bit-bang mode. This
//! crate drives that chip, turns the sampled pins back into raw bits, watches
//! the raw stream's entropy and whitens it with cSHAKE256.
//!
//! ## Quick Start
//!
//! ```no_run
//! use infnoise_core::{Config, Device};
//!
//! // Open the first board on the bus (0403:6015)
//! let device = Device::open(Config::default())?;
//!
//! // Whitened output
//! let mut key = [0u8; 32];
//! device.read(&mut key)?;
//!
//! // Raw comparator bits, for analysis
//! let mut raw = [0u8; 4096];
//! device.read_raw(&mut raw)?;
//!
//! println!("{}", device.health_report());
//! device.close()?;
//! # Ok::<(), infnoise_core::Error>(())
//! ```
//!
//! ## Architecture
//!
//! Transport → bit-bang codec → health monitor → whitener → output
//!
//! - [`transport`]: libusb (default) or FTDI D2XX byte links behind the
//!   [`Transport`] trait. The libusb link keeps the bulk-IN endpoint drained
//!   on a background thread.
//! - [`codec`]: the 512-byte clock/address pattern written to the chip and
//!   the 8-to-1 decoding of what comes back.
//! - [`health`]: order-7 running entropy estimate, advisory only.
//! - [`whitener`]: one long-lived cSHAKE256 sponge absorbing every raw unit.
//! - [`device`]: ties it together behind a thread-safe handle.

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod transport;
pub mod whitener;

pub use config::Config;
pub use device::Device;
pub use error::{Error, Result};
pub use health::{HealthMonitor, HealthReport};
pub use transport::Transport;
pub use whitener::Whitener;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
