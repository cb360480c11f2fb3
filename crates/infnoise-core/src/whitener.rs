//! cSHAKE256 whitening.
//!
//! One sponge lives as long as the device and absorbs every raw unit ever
//! pulled from it. Output is squeezed from a clone of the sponge after each
//! absorption, so squeezing never disturbs the running absorb state and each
//! block depends on the whole raw history so far.
//!
//! ```text
//! raw unit 1 ─▶ absorb ─┬─▶ clone ─▶ squeeze 2048 bytes ─▶ pool
//! raw unit 2 ─▶ absorb ─┼─▶ clone ─▶ squeeze 2048 bytes ─▶ pool
//!        ...            ▼
//! ```

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{CShake256, CShake256Core};

use crate::error::Result;

/// Raw bytes absorbed per round (2048 bits).
pub const ABSORB_UNIT: usize = 256;
/// Whitened bytes squeezed per round.
pub const SQUEEZE_BLOCK: usize = 2048;
/// cSHAKE customization string.
pub const CUSTOMIZATION: &[u8] = b"infnoise";

/// Long-lived sponge plus the pool of squeezed bytes not yet handed out.
#[derive(Clone)]
pub struct Whitener {
    sponge: CShake256,
    raw: [u8; ABSORB_UNIT],
    raw_len: usize,
    pool: Box<[u8; SQUEEZE_BLOCK]>,
    pool_pos: usize,
    rounds: u64,
}

impl Default for Whitener {
    fn default() -> Self {
        Self::new()
    }
}

impl Whitener {
    pub fn new() -> Self {
        Self {
            sponge: CShake256::from_core(CShake256Core::new(CUSTOMIZATION)),
            raw: [0u8; ABSORB_UNIT],
            raw_len: 0,
            pool: Box::new([0u8; SQUEEZE_BLOCK]),
            // Empty pool: the first read triggers an absorption.
            pool_pos: SQUEEZE_BLOCK,
            rounds: 0,
        }
    }

    /// Whitened bytes available without touching the hardware.
    pub fn available(&self) -> usize {
        SQUEEZE_BLOCK - self.pool_pos
    }

    /// Absorption rounds completed so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Fill `buf` with whitened bytes.
    ///
    /// `pull_raw` is asked to fill a slice completely with raw decoded bits;
    /// it is only called when the pool runs dry. If it fails the error is
    /// returned as is. Bytes already taken from the pool stay consumed and
    /// the partially collected raw unit only keeps complete pulls.
    pub fn read<F>(&mut self, buf: &mut [u8], mut pull_raw: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> Result<()>,
    {
        let mut n = 0;
        while n < buf.len() {
            if self.available() > 0 {
                let take = self.available().min(buf.len() - n);
                buf[n..n + take].copy_from_slice(&self.pool[self.pool_pos..self.pool_pos + take]);
                self.pool_pos += take;
                n += take;
                continue;
            }

            if self.raw_len < ABSORB_UNIT {
                pull_raw(&mut self.raw[self.raw_len..])?;
                self.raw_len = ABSORB_UNIT;
            }
            self.absorb_and_squeeze();
        }
        Ok(())
    }

    fn absorb_and_squeeze(&mut self) {
        self.sponge.update(&self.raw);
        self.raw_len = 0;

        self.sponge.clone().finalize_xof().read(&mut self.pool[..]);
        self.pool_pos = 0;
        self.rounds += 1;
        log::debug!("whitener: round {} absorbed, pool refilled", self.rounds);
    }
}
