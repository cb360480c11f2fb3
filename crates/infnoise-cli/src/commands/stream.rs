use std::io::Write;

use infnoise_core::Config;

const CHUNK: usize = 4096;

pub fn run(config: Config, format: &str, n_bytes: usize, raw: bool) {
    // Raw streams skip the whitener, so let them feed the monitor directly.
    let config = if raw {
        config.with_monitor_raw_reads(true)
    } else {
        config
    };
    let device = super::open_device(config);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0usize;

    loop {
        if n_bytes > 0 && total >= n_bytes {
            break;
        }
        let want = if n_bytes == 0 {
            CHUNK
        } else {
            CHUNK.min(n_bytes - total)
        };
        let data = &mut buf[..want];

        let read = if raw {
            device.read_raw(data)
        } else {
            device.read(data)
        };
        if let Err(e) = read {
            eprintln!("Error reading device: {e}");
            let _ = device.close();
            std::process::exit(1);
        }

        if write_chunk(&mut out, data, format).is_err() {
            break; // Broken pipe
        }
        let _ = out.flush();
        total += want;
    }

    if let Err(e) = device.close() {
        log::warn!("close: {e}");
    }
}

fn write_chunk(out: &mut impl Write, data: &[u8], format: &str) -> std::io::Result<()> {
    match format {
        "hex" => out.write_all(to_hex(data).as_bytes()),
        _ => out.write_all(data),
    }
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
