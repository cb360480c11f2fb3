//! Integration tests for infnoise-core.
//!
//! These run the full pipeline against a simulated board:
//! pattern write → drained bulk-IN packets → decode → health → whitening.
//! Tests that need a real Infinite Noise on the bus are `#[ignore]`d.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use infnoise_core::codec::{COMP1, COMP2, OUTPUT_MASK, PATTERN_LEN, build_pattern};
use infnoise_core::transport::drain::{BulkRead, RING_CAPACITY};
use infnoise_core::transport::{BITMODE_SYNC_BITBANG, Drain};
use infnoise_core::{Config, Device, Error, Result, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PACKET_SIZE: usize = 64;
const MODEM_STATUS: [u8; 2] = [0x01, 0x60];

/// What the comparators put on the wire.
#[derive(Clone, Copy)]
enum Line {
    /// Fair coin per sample, from a seeded generator.
    Noise(u64),
    /// Comparators stuck low.
    Stuck,
    /// Board stops answering.
    Silent,
}

/// FT240X model: every written frame comes back, with the comparator pins
/// filled in, as 64-byte bulk packets picked up by a background drain.
struct SimBoard {
    line: Line,
    rng: Mutex<StdRng>,
    packets: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    drain: Drain,
    bit_mode: Mutex<Option<(u8, u8)>>,
    written: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    max_transfer: usize,
}

impl SimBoard {
    fn new(line: Line) -> Arc<Self> {
        Self::with_ceiling(line, RING_CAPACITY)
    }

    fn with_ceiling(line: Line, max_transfer: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let drain = Drain::spawn(RING_CAPACITY, PACKET_SIZE, move |buf: &mut [u8]| {
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(pkt) => {
                    buf[..pkt.len()].copy_from_slice(&pkt);
                    BulkRead::Data(pkt.len())
                }
                Err(mpsc::RecvTimeoutError::Timeout) => BulkRead::Timeout,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    BulkRead::Failed("device unplugged".to_string())
                }
            }
        })
        .unwrap();

        let seed = match line {
            Line::Noise(seed) => seed,
            _ => 0,
        };
        Arc::new(Self {
            line,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            packets: Mutex::new(Some(tx)),
            drain,
            bit_mode: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            max_transfer,
        })
    }

    fn sample(&self, frame: u8) -> u8 {
        let high = match self.line {
            Line::Noise(_) => self.rng.lock().unwrap().random_bool(0.5),
            Line::Stuck | Line::Silent => false,
        };
        let comp = if high { (1 << COMP1) | (1 << COMP2) } else { 0 };
        (frame & OUTPUT_MASK) | comp
    }
}

/// The device's handle on a shared [`SimBoard`].
struct Link(Arc<SimBoard>);

impl Transport for Link {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn set_bit_mode(&self, mask: u8, mode: u8) -> Result<()> {
        *self.0.bit_mode.lock().unwrap() = Some((mask, mode));
        self.0.drain.reset_with(|| Ok(()))
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.0.drain.is_closed() {
            return Err(Error::Closed);
        }
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        self.0.written.lock().unwrap().extend_from_slice(data);
        if let Line::Silent = self.0.line {
            return Ok(());
        }

        let echoed: Vec<u8> = data.iter().map(|&f| self.0.sample(f)).collect();
        let packets = self.0.packets.lock().unwrap();
        let tx = packets.as_ref().ok_or(Error::Closed)?;
        for payload in echoed.chunks(PACKET_SIZE - MODEM_STATUS.len()) {
            let mut pkt = MODEM_STATUS.to_vec();
            pkt.extend_from_slice(payload);
            tx.send(pkt)
                .map_err(|_| Error::ProtocolDesync("drain gone".to_string()))?;
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.0.drain.read(buf)
    }

    fn max_transfer(&self) -> usize {
        self.0.max_transfer
    }

    fn close(&self) -> Result<()> {
        self.0.drain.close();
        self.0.packets.lock().unwrap().take();
        Ok(())
    }
}

fn start(board: &Arc<SimBoard>, config: Config) -> Device {
    let device = Device::new(config).unwrap();
    device.start_with(Box::new(Link(Arc::clone(board)))).unwrap();
    device
}

#[test]
fn start_enters_sync_bitbang() {
    let board = SimBoard::new(Line::Stuck);
    let device = start(&board, Config::default());
    assert!(device.is_running());
    assert_eq!(
        *board.bit_mode.lock().unwrap(),
        Some((0xED, BITMODE_SYNC_BITBANG))
    );
}

#[test]
fn written_frames_repeat_the_pattern() {
    let board = SimBoard::new(Line::Stuck);
    let device = start(&board, Config::default());

    let mut raw = vec![0u8; 3 * PATTERN_LEN / 8];
    device.read_raw(&mut raw).unwrap();

    let written = board.written.lock().unwrap();
    assert_eq!(written.len(), 3 * PATTERN_LEN);
    let pattern = build_pattern();
    for frame in written.chunks(PATTERN_LEN) {
        assert_eq!(frame, &pattern[..]);
    }
}

#[test]
fn raw_bits_follow_the_comparators() {
    let board = SimBoard::new(Line::Stuck);
    let device = start(&board, Config::default());
    let mut raw = vec![0xAAu8; 1000];
    device.read_raw(&mut raw).unwrap();
    assert!(raw.iter().all(|&b| b == 0));

    let board = SimBoard::new(Line::Noise(7));
    let device = start(&board, Config::default());
    let mut raw = vec![0u8; 10_000];
    device.read_raw(&mut raw).unwrap();
    let ones: u32 = raw.iter().map(|b| b.count_ones()).sum();
    let fraction = f64::from(ones) / 80_000.0;
    assert!((fraction - 0.5).abs() < 0.02, "ones fraction {fraction}");
}

#[test]
fn empty_raw_read_touches_nothing() {
    let board = SimBoard::new(Line::Noise(1));
    let device = start(&board, Config::default());
    device.read_raw(&mut []).unwrap();
    assert_eq!(board.writes.load(Ordering::SeqCst), 0);
}

#[test]
fn oversized_request_loops_under_ceiling() {
    let board = SimBoard::with_ceiling(Line::Noise(3), 4096);
    let device = start(&board, Config::default());

    let mut raw = vec![0u8; 2000]; // 16,000 raw bytes in 4096-byte exchanges
    device.read_raw(&mut raw).unwrap();
    assert_eq!(board.writes.load(Ordering::SeqCst), 4);
    assert_eq!(board.written.lock().unwrap().len(), 16_000);
}

#[test]
fn same_noise_same_whitened_stream() {
    let a = SimBoard::new(Line::Noise(0xfeed));
    let b = SimBoard::new(Line::Noise(0xfeed));
    let c = SimBoard::new(Line::Noise(0xbeef));
    let (da, db, dc) = (
        start(&a, Config::default()),
        start(&b, Config::default()),
        start(&c, Config::default()),
    );

    let mut out_a = vec![0u8; 5000];
    let mut out_b = vec![0u8; 5000];
    let mut out_c = vec![0u8; 5000];
    da.read(&mut out_a).unwrap();
    db.read(&mut out_b).unwrap();
    dc.read(&mut out_c).unwrap();
    assert_eq!(out_a, out_b);
    assert_ne!(out_a, out_c);
}

#[test]
fn stuck_line_fails_health_but_still_whitens() {
    let board = SimBoard::new(Line::Stuck);
    let device = start(&board, Config::default().with_health_window(8_000));

    let mut out = vec![0u8; 8192]; // four absorption units: 8,192 raw bits
    device.read(&mut out).unwrap();

    assert!(!device.is_healthy());
    assert!(device.estimated_entropy() < 0.01);
    let report = device.health_report();
    assert_eq!(report.total_bits, 8192);
    assert!(report.enforcing);
    assert!(out.iter().any(|&b| b != 0));
}

#[test]
fn fair_noise_passes_matching_target() {
    let board = SimBoard::new(Line::Noise(99));
    let config = Config::default()
        .with_target_entropy(1.0)
        .with_tolerance(0.1)
        .with_health_window(8_000);
    let device = start(&board, config);

    let mut out = vec![0u8; 32 * 1024]; // 32,768 raw bits
    device.read(&mut out).unwrap();
    assert!(device.is_healthy(), "{}", device.health_report());
}

#[test]
fn operations_outside_lifecycle() {
    let device = Device::new(Config::default()).unwrap();
    assert_eq!(device.read(&mut [0u8; 8]), Err(Error::NotStarted));

    let board = SimBoard::new(Line::Noise(5));
    let device = start(&board, Config::default());
    device.close().unwrap();
    device.close().unwrap();
    assert_eq!(device.read(&mut [0u8; 8]), Err(Error::Closed));
    assert_eq!(device.read_raw(&mut [0u8; 8]), Err(Error::Closed));
    assert!(!device.is_running());
}

#[test]
fn close_unblocks_a_stalled_reader() {
    let board = SimBoard::new(Line::Silent);
    let device = Arc::new(start(&board, Config::default()));

    let reader = {
        let device = Arc::clone(&device);
        std::thread::spawn(move || device.read_raw(&mut [0u8; 16]))
    };
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    device.close().unwrap();
    let result = reader.join().unwrap();
    assert_eq!(result, Err(Error::Closed));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn io_read_adapter() {
    use std::io::Read;

    let board = SimBoard::new(Line::Noise(11));
    let device = start(&board, Config::default());
    let mut reader = &device;
    let mut buf = [0u8; 100];
    let n = Read::read(&mut reader, &mut buf).unwrap();
    assert_eq!(n, 100);

    device.close().unwrap();
    let err = Read::read(&mut reader, &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

#[test]
#[ignore] // Run with: cargo test -- --ignored (needs an Infinite Noise attached)
fn hardware_produces_whitened_bytes() {
    let device = Device::open(Config::default()).unwrap();
    let mut out = vec![0u8; 64 * 1024];
    device.read(&mut out).unwrap();
    assert!(out.iter().any(|&b| b != out[0]));

    let report = device.health_report();
    assert!(report.total_bits > 0);
    println!("{report}");
    device.close().unwrap();
}

#[test]
#[ignore] // Run with: cargo test -- --ignored (needs an Infinite Noise attached)
fn hardware_raw_entropy_near_design_value() {
    let config = Config::default().with_monitor_raw_reads(true);
    let device = Device::open(config).unwrap();
    let mut raw = vec![0u8; 20_000];
    device.read_raw(&mut raw).unwrap();
    assert!(device.is_healthy(), "{}", device.health_report());
}
