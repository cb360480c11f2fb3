use infnoise_core::{Config, HealthMonitor};

const CHUNK: usize = 4096;

pub fn run(config: Config, bits: u64, output_path: Option<&str>) {
    let device = super::open_device(config);
    let mut monitor = HealthMonitor::from_config(device.config());

    let n_bytes = usize::try_from(bits.div_ceil(8)).unwrap_or(usize::MAX);
    println!("Sampling {} raw bits...", n_bytes * 8);

    let mut buf = vec![0u8; CHUNK];
    let mut remaining = n_bytes;
    while remaining > 0 {
        let data = &mut buf[..remaining.min(CHUNK)];
        if let Err(e) = device.read_raw(data) {
            eprintln!("Error reading device: {e}");
            let _ = device.close();
            std::process::exit(1);
        }
        monitor.add(data);
        remaining -= data.len();
    }
    let _ = device.close();

    let report = monitor.report();
    println!("{report}");

    if let Some(path) = output_path {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => match std::fs::write(path, json) {
                Ok(()) => println!("\nReport written to {path}"),
                Err(e) => {
                    eprintln!("Error writing {path}: {e}");
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                std::process::exit(1);
            }
        }
    }

    if report.enforcing && !report.healthy {
        std::process::exit(2);
    }
}
