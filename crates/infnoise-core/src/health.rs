//! Online entropy estimate of the raw comparator stream.
//!
//! Each bit is scored against an order-7 Markov model built from everything
//! seen so far: the preceding 7 bits select one of 128 contexts, and the
//! surprise of the bit is `-log2(P(bit | context))` using the cumulative
//! counts for that context. The running mean surprise converges on the
//! source's entropy per bit. A healthy board sits close to its design value
//! (0.864 bits/bit); a stuck comparator collapses towards 0 and a board that
//! suddenly looks perfectly random is just as suspicious.
//!
//! The monitor is advisory. It never fails a read; callers poll
//! [`HealthMonitor::is_healthy`] and decide what to do.

use serde::{Deserialize, Serialize};

use crate::config::{Config, DEFAULT_HEALTH_WINDOW, DEFAULT_TARGET_ENTROPY, DEFAULT_TOLERANCE};

const CONTEXTS: usize = 128;
const CONTEXT_MASK: u8 = 0x7F;

/// Cumulative order-7 entropy estimator.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    counts: Box<[[u32; 2]; CONTEXTS]>,
    history: u8,
    total_bits: u64,
    entropy_sum: f64,

    target_entropy: f64,
    tolerance: f64,
    window: u64,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Bits observed since the monitor was created.
    pub total_bits: u64,
    /// Running entropy estimate in bits per bit.
    pub entropy_per_bit: f64,
    /// Configured target.
    pub target_entropy: f64,
    /// Configured relative tolerance.
    pub tolerance: f64,
    /// Bits required before enforcement begins.
    pub window: u64,
    /// Whether the bounds are being enforced yet.
    pub enforcing: bool,
    /// Current verdict.
    pub healthy: bool,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_ENTROPY, DEFAULT_TOLERANCE, DEFAULT_HEALTH_WINDOW)
    }
}

impl HealthMonitor {
    pub fn new(target_entropy: f64, tolerance: f64, window: u64) -> Self {
        Self {
            counts: Box::new([[0; 2]; CONTEXTS]),
            history: 0,
            total_bits: 0,
            entropy_sum: 0.0,
            target_entropy,
            tolerance,
            window,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.target_entropy, config.tolerance, config.health_window)
    }

    /// Score every bit of `data` (MSB-first) and update the model.
    /// Returns [`is_healthy`](Self::is_healthy) afterwards.
    pub fn add(&mut self, data: &[u8]) -> bool {
        for &byte in data {
            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1;
                self.score(bit);
            }
        }
        self.is_healthy()
    }

    fn score(&mut self, bit: u8) {
        let ctx = &mut self.counts[usize::from(self.history)];
        let seen = ctx[usize::from(bit)];
        let total = u64::from(ctx[0]) + u64::from(ctx[1]);

        if total == 0 {
            // Nothing known about this context: even odds, one bit of surprise.
            self.entropy_sum += 1.0;
        } else if seen > 0 {
            let p = f64::from(seen) / total as f64;
            self.entropy_sum -= p.log2();
        }

        ctx[usize::from(bit)] = seen.saturating_add(1);
        self.history = ((self.history << 1) | bit) & CONTEXT_MASK;
        self.total_bits += 1;
    }

    /// True until `window` bits have been seen; afterwards true iff the
    /// estimate is within `target × tolerance` of the target.
    pub fn is_healthy(&self) -> bool {
        if self.total_bits < self.window {
            return true;
        }
        let diff = (self.estimated_entropy() - self.target_entropy).abs();
        diff <= self.target_entropy * self.tolerance
    }

    /// Running entropy estimate in bits per bit; 0 before any data.
    pub fn estimated_entropy(&self) -> f64 {
        if self.total_bits == 0 {
            return 0.0;
        }
        self.entropy_sum / self.total_bits as f64
    }

    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            total_bits: self.total_bits,
            entropy_per_bit: self.estimated_entropy(),
            target_entropy: self.target_entropy,
            tolerance: self.tolerance,
            window: self.window,
            enforcing: self.total_bits >= self.window,
            healthy: self.is_healthy(),
        }
    }
}

impl std::fmt::Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if !self.enforcing {
            "warming up"
        } else if self.healthy {
            "healthy"
        } else {
            "DEGRADED"
        };
        writeln!(f, "  Bits observed:    {}", self.total_bits)?;
        writeln!(
            f,
            "  Entropy estimate: {:.4} bits/bit (target {:.3} ± {:.1}%)",
            self.entropy_per_bit,
            self.target_entropy,
            self.tolerance * 100.0
        )?;
        writeln!(f, "  Window:           {} bits", self.window)?;
        write!(f, "  Status:           {status}")
    }
}
