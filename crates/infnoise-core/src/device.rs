//! The Infinite Noise device: transport, wire codec, whitener and health
//! monitor behind one lock.
//!
//! ```text
//! pattern ─▶ Transport::write ─▶ (board) ─▶ Transport::read ─▶ decode ─┬─▶ read_raw
//!                                                                     ├─▶ HealthMonitor
//!                                                                     └─▶ Whitener ─▶ read
//! ```
//!
//! All public operations take `&self` and serialize on an internal mutex.
//! [`Device::close`] does not need that mutex to start: it shuts the
//! transport first, which makes any read blocked inside the lock return.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::codec::{self, OUTPUT_MASK, PATTERN_LEN, RAW_BYTES_PER_BYTE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, HealthReport};
use crate::transport::{self, BITMODE_SYNC_BITBANG, Transport};
use crate::whitener::Whitener;

/// Output pattern repetitions per exchange.
const BATCH_PATTERNS: usize = 64;
/// Largest single write/read exchange (32 KiB).
pub const IO_BATCH: usize = PATTERN_LEN * BATCH_PATTERNS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Closed,
}

/// Write/read cadence over a transport.
struct RawLink {
    transport: Option<Arc<dyn Transport>>,
    out_batch: Box<[u8]>,
    in_batch: Box<[u8]>,
}

impl RawLink {
    fn new() -> Self {
        let pattern = codec::build_pattern();
        let out_batch: Vec<u8> = pattern
            .iter()
            .copied()
            .cycle()
            .take(IO_BATCH)
            .collect();
        Self {
            transport: None,
            out_batch: out_batch.into_boxed_slice(),
            in_batch: vec![0u8; IO_BATCH].into_boxed_slice(),
        }
    }

    /// Fill `buf` with decoded bits, exchanging at most one batch per loop.
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let transport = self.transport.as_ref().ok_or(Error::NotStarted)?;
        let ceiling = self.out_batch.len().min(transport.max_transfer());

        let mut n = 0;
        while n < buf.len() {
            let need_out = buf.len() - n;
            let need_in = need_out.saturating_mul(RAW_BYTES_PER_BYTE).min(ceiling)
                & !(RAW_BYTES_PER_BYTE - 1);
            if need_in == 0 {
                return Err(Error::ProtocolDesync(format!(
                    "transfer ceiling of {ceiling} bytes cannot carry one decode group"
                )));
            }

            transport.write(&self.out_batch[..need_in])?;
            transport.read(&mut self.in_batch[..need_in])?;
            log::trace!("exchanged {need_in} raw bytes");

            let count = (need_in / RAW_BYTES_PER_BYTE).min(need_out);
            codec::decode_into(
                &self.in_batch[..count * RAW_BYTES_PER_BYTE],
                &mut buf[n..n + count],
            )?;
            n += count;
        }
        Ok(())
    }
}

struct Inner {
    phase: Phase,
    link: RawLink,
    whitener: Whitener,
    health: HealthMonitor,
    was_healthy: bool,
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Idle => Err(Error::NotStarted),
            Phase::Closed => Err(Error::Closed),
        }
    }

    fn ensure_startable(&self) -> Result<()> {
        match self.phase {
            Phase::Idle => Ok(()),
            Phase::Running => Err(Error::InvalidConfig("device already started".to_string())),
            Phase::Closed => Err(Error::Closed),
        }
    }

    fn note_health(&mut self) {
        let healthy = self.health.is_healthy();
        if healthy != self.was_healthy {
            if healthy {
                log::warn!(
                    "raw entropy back within bounds: {:.4} bits/bit",
                    self.health.estimated_entropy()
                );
            } else {
                log::warn!(
                    "raw entropy out of bounds: {:.4} bits/bit after {} bits",
                    self.health.estimated_entropy(),
                    self.health.total_bits()
                );
            }
            self.was_healthy = healthy;
        }
    }
}

/// Handle to one Infinite Noise board.
pub struct Device {
    config: Config,
    inner: Mutex<Inner>,
    /// Second reference to the open transport so `close` can reach it
    /// without waiting for `inner`.
    link: Mutex<Option<Arc<dyn Transport>>>,
}

impl Device {
    /// Create an idle device. Nothing is opened until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let health = HealthMonitor::from_config(&config);
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                link: RawLink::new(),
                whitener: Whitener::new(),
                health,
                was_healthy: true,
            }),
            link: Mutex::new(None),
        })
    }

    /// Create and start a device with the build's default transport.
    pub fn open(config: Config) -> Result<Self> {
        let device = Self::new(config)?;
        device.start()?;
        Ok(device)
    }

    /// Validated configuration the device was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the board through the transport compiled into this build and
    /// switch it to synchronous bit-bang.
    pub fn start(&self) -> Result<()> {
        self.lock().ensure_startable()?;
        let transport = transport::open_default(self.config.vendor_id, self.config.product_id)?;
        self.start_with(transport)
    }

    /// Start on an already opened transport.
    pub fn start_with(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut inner = self.lock();
        if let Err(e) = inner.ensure_startable() {
            let _ = transport.close();
            return Err(e);
        }

        if let Err(e) = transport.set_bit_mode(OUTPUT_MASK, BITMODE_SYNC_BITBANG) {
            let _ = transport.close();
            return Err(e);
        }

        let transport: Arc<dyn Transport> = Arc::from(transport);
        log::info!("device started on {} transport", transport.name());
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&transport));
        inner.link.transport = Some(transport);
        inner.phase = Phase::Running;
        Ok(())
    }

    /// Fill `buf` with decoded comparator bits: no whitening, no health
    /// gating. Feeds the health monitor only if `monitor_raw_reads` is set.
    pub fn read_raw(&self, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_running()?;
        if buf.is_empty() {
            return Ok(());
        }

        inner.link.read(buf)?;
        if self.config.monitor_raw_reads {
            inner.health.add(buf);
            inner.note_health();
        }
        Ok(())
    }

    /// Fill `buf` with whitened bytes. Every raw byte pulled for whitening
    /// also goes through the health monitor.
    ///
    /// On error the contents of `buf` are unspecified: a prefix may already
    /// hold whitened bytes. Those bytes are consumed and never served again,
    /// so a retry continues with fresh output. Raw bytes from a failed pull
    /// are not absorbed.
    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_running()?;

        let inner = &mut *guard;
        let (link, health) = (&mut inner.link, &mut inner.health);
        let result = inner.whitener.read(buf, |chunk| {
            link.read(chunk)?;
            health.add(chunk);
            Ok(())
        });
        inner.note_health();
        result
    }

    /// Health verdict from the monitor. Advisory only.
    pub fn is_healthy(&self) -> bool {
        self.lock().health.is_healthy()
    }

    /// Running entropy estimate of the raw stream, bits per bit.
    pub fn estimated_entropy(&self) -> f64 {
        self.lock().health.estimated_entropy()
    }

    pub fn health_report(&self) -> HealthReport {
        self.lock().health.report()
    }

    /// Whether the device has been started and not closed.
    pub fn is_running(&self) -> bool {
        self.lock().phase == Phase::Running
    }

    /// Release the board. Idempotent and safe to call from another thread
    /// while a read is blocked; that read returns [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let transport = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match transport {
            Some(t) => t.close(),
            None => Ok(()),
        };

        let mut inner = self.lock();
        if inner.phase != Phase::Closed {
            log::info!("device closed");
        }
        inner.phase = Phase::Closed;
        inner.link.transport = None;
        result
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::io::Read for Device {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut &*self, buf)
    }
}

impl std::io::Read for &Device {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Device::read(self, buf)?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{COMP1, COMP2};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Synchronous loopback: each written frame comes back with both
    /// comparator pins set to a fixed level.
    struct Loopback {
        level: bool,
        pending: Mutex<Vec<u8>>,
        writes: AtomicUsize,
        max_transfer: usize,
        closed: std::sync::atomic::AtomicBool,
    }

    impl Loopback {
        fn new(level: bool) -> Self {
            Self {
                level,
                pending: Mutex::new(Vec::new()),
                writes: AtomicUsize::new(0),
                max_transfer: usize::MAX,
                closed: Default::default(),
            }
        }
    }

    impl Transport for Arc<Loopback> {
        fn name(&self) -> &'static str {
            "loopback"
        }
        fn set_bit_mode(&self, _mask: u8, _mode: u8) -> Result<()> {
            self.pending.lock().unwrap().clear();
            Ok(())
        }
        fn write(&self, data: &[u8]) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let comp = if self.level { (1 << COMP1) | (1 << COMP2) } else { 0 };
            self.pending
                .lock()
                .unwrap()
                .extend(data.iter().map(|&frame| frame | comp));
            Ok(())
        }
        fn read(&self, buf: &mut [u8]) -> Result<()> {
            let mut pending = self.pending.lock().unwrap();
            if pending.len() < buf.len() {
                return Err(Error::ProtocolDesync("loopback underrun".into()));
            }
            buf.copy_from_slice(&pending[..buf.len()]);
            pending.drain(..buf.len());
            Ok(())
        }
        fn max_transfer(&self) -> usize {
            self.max_transfer
        }
        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn started(level: bool) -> (Device, Arc<Loopback>) {
        let hw = Arc::new(Loopback::new(level));
        let dev = Device::new(Config::default()).unwrap();
        dev.start_with(Box::new(Arc::clone(&hw))).unwrap();
        (dev, hw)
    }

    #[test]
    fn operations_before_start_fail() {
        let dev = Device::new(Config::default()).unwrap();
        assert_eq!(dev.read_raw(&mut [0u8; 4]), Err(Error::NotStarted));
        assert_eq!(dev.read(&mut [0u8; 4]), Err(Error::NotStarted));
        assert!(!dev.is_running());
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = Config::default().with_tolerance(-1.0);
        assert!(matches!(Device::new(bad), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn raw_read_decodes_levels() {
        let (dev, _) = started(true);
        let mut buf = [0u8; 100];
        dev.read_raw(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));

        let (dev, _) = started(false);
        dev.read_raw(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn empty_raw_read_does_no_io() {
        let (dev, hw) = started(true);
        dev.read_raw(&mut []).unwrap();
        assert_eq!(hw.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn large_raw_read_is_batched() {
        let (dev, hw) = started(true);
        // 5000 output bytes need 40,000 raw bytes: two 32 KiB exchanges.
        let mut buf = vec![0u8; 5000];
        dev.read_raw(&mut buf).unwrap();
        assert_eq!(hw.writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transfer_ceiling_is_respected() {
        let mut lb = Loopback::new(true);
        lb.max_transfer = 100; // rounds down to 96 raw bytes = 12 output bytes
        let hw = Arc::new(lb);
        let dev = Device::new(Config::default()).unwrap();
        dev.start_with(Box::new(Arc::clone(&hw))).unwrap();

        let mut buf = [0u8; 24];
        dev.read_raw(&mut buf).unwrap();
        assert_eq!(hw.writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tiny_ceiling_is_desync() {
        let mut lb = Loopback::new(true);
        lb.max_transfer = 7;
        let dev = Device::new(Config::default()).unwrap();
        dev.start_with(Box::new(Arc::new(lb))).unwrap();
        assert!(matches!(
            dev.read_raw(&mut [0u8; 1]),
            Err(Error::ProtocolDesync(_))
        ));
    }

    #[test]
    fn whitened_read_feeds_health() {
        let (dev, _) = started(false);
        let mut buf = vec![0u8; 4096];
        dev.read(&mut buf).unwrap();
        // Two squeeze blocks need two absorption units of raw bits.
        assert_eq!(dev.health_report().total_bits, 2 * 256 * 8);
        // Stuck-at-zero input still whitens to non-constant output.
        assert!(buf.iter().any(|&b| b != buf[0]));
    }

    #[test]
    fn raw_reads_skip_health_by_default() {
        let (dev, _) = started(false);
        dev.read_raw(&mut [0u8; 64]).unwrap();
        assert_eq!(dev.health_report().total_bits, 0);
    }

    #[test]
    fn raw_reads_feed_health_when_configured() {
        let hw = Arc::new(Loopback::new(false));
        let config = Config::default()
            .with_monitor_raw_reads(true)
            .with_health_window(512);
        let dev = Device::new(config).unwrap();
        dev.start_with(Box::new(hw)).unwrap();

        dev.read_raw(&mut [0u8; 64]).unwrap();
        assert_eq!(dev.health_report().total_bits, 512);
        assert!(!dev.is_healthy());
        assert!(dev.estimated_entropy() < 0.01);
    }

    #[test]
    fn close_is_idempotent() {
        let (dev, _) = started(true);
        dev.close().unwrap();
        dev.close().unwrap();
        assert_eq!(dev.read(&mut [0u8; 1]), Err(Error::Closed));
        assert_eq!(dev.read_raw(&mut [0u8; 1]), Err(Error::Closed));
        assert_eq!(dev.start(), Err(Error::Closed));
    }

    #[test]
    fn second_start_is_rejected() {
        let (dev, _) = started(true);
        let other = Arc::new(Loopback::new(true));
        assert!(dev.start_with(Box::new(Arc::clone(&other))).is_err());
        // The rejected transport is released.
        assert!(other.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_whitened_read_does_not_reserve_bytes() {
        let (dev, hw) = started(false);
        dev.read(&mut [0u8; 16]).unwrap();

        hw.close().unwrap();
        let mut buf = vec![0u8; 4096];
        assert_eq!(dev.read(&mut buf), Err(Error::Closed));

        // The rest of the first block was handed out before the pull failed.
        let (fresh, _) = started(false);
        let mut reference = vec![0u8; 2048];
        fresh.read(&mut reference).unwrap();
        assert_eq!(buf[..2032], reference[16..]);
    }

    #[test]
    fn config_is_kept() {
        let dev = Device::new(Config::default().with_health_window(1234)).unwrap();
        assert_eq!(dev.config().health_window, 1234);
    }

    #[test]
    fn io_read_fills_buffer() {
        use std::io::Read;
        let (mut dev, _) = started(true);
        let mut buf = [0u8; 33];
        assert_eq!(Read::read(&mut dev, &mut buf).unwrap(), 33);
    }
}
