//! Device configuration.
//!
//! Every field has a default matching the stock Infinite Noise board, so an
//! empty JSON object (`{}`) is a valid configuration file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// FTDI vendor id used by the carrier board.
pub const DEFAULT_VENDOR_ID: u16 = 0x0403;
/// FT240X product id used by the carrier board.
pub const DEFAULT_PRODUCT_ID: u16 = 0x6015;
/// Expected entropy per raw bit, from the board's published noise model.
pub const DEFAULT_TARGET_ENTROPY: f64 = 0.864;
/// Allowed relative deviation from [`DEFAULT_TARGET_ENTROPY`].
pub const DEFAULT_TOLERANCE: f64 = 0.05;
/// Bits observed before the health check starts enforcing its bounds.
pub const DEFAULT_HEALTH_WINDOW: u64 = 80_000;

/// Runtime configuration for a [`Device`](crate::Device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// USB vendor id to open.
    pub vendor_id: u16,
    /// USB product id to open.
    pub product_id: u16,
    /// Target entropy per raw bit for the health monitor.
    pub target_entropy: f64,
    /// Relative tolerance around `target_entropy`.
    pub tolerance: f64,
    /// Minimum number of bits before health enforcement begins.
    pub health_window: u64,
    /// Also feed bits from `read_raw` into the health monitor. Off by default.
    pub monitor_raw_reads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            target_entropy: DEFAULT_TARGET_ENTROPY,
            tolerance: DEFAULT_TOLERANCE,
            health_window: DEFAULT_HEALTH_WINDOW,
            monitor_raw_reads: false,
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Override the target entropy per bit.
    pub fn with_target_entropy(mut self, bits: f64) -> Self {
        self.target_entropy = bits;
        self
    }

    /// Override the allowed deviation, as a fraction of the target.
    pub fn with_tolerance(mut self, fraction: f64) -> Self {
        self.tolerance = fraction;
        self
    }

    /// Override the number of bits before enforcement begins.
    pub fn with_health_window(mut self, bits: u64) -> Self {
        self.health_window = bits;
        self
    }

    /// Choose whether raw diagnostic reads feed the health monitor.
    pub fn with_monitor_raw_reads(mut self, enabled: bool) -> Self {
        self.monitor_raw_reads = enabled;
        self
    }

    /// Open a different USB vendor/product pair.
    pub fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    /// Reject values the health monitor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.target_entropy.is_finite()
            || self.target_entropy <= 0.0
            || self.target_entropy > 1.0
        {
            return Err(Error::InvalidConfig(format!(
                "target_entropy must be in (0, 1], got {}",
                self.target_entropy
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "tolerance must be a non-negative fraction, got {}",
                self.tolerance
            )));
        }
        if self.health_window == 0 {
            return Err(Error::InvalidConfig(
                "health_window must be at least one bit".to_string(),
            ));
        }
        Ok(())
    }
}
