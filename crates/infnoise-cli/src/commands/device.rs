use std::io::Write;
use std::sync::Arc;

use infnoise_core::Config;

pub fn run(config: Config, path: &str, buffer_size: usize) {
    let buffer_size = if buffer_size > 0 { buffer_size } else { 4096 };

    // Create FIFO if it doesn't exist; verify it's a FIFO if it does.
    if std::path::Path::new(path).exists() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            match std::fs::metadata(path) {
                Ok(meta) if meta.file_type().is_fifo() => {}
                Ok(_) => {
                    eprintln!("Error: {path} exists and is not a FIFO.");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Error: {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
    } else {
        #[cfg(unix)]
        {
            use std::ffi::CString;
            let Ok(c_path) = CString::new(path) else {
                eprintln!("Error: FIFO path contains a NUL byte.");
                std::process::exit(1);
            };
            // SAFETY: c_path is a valid NUL-terminated CString.
            let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
            if ret != 0 {
                eprintln!("Error creating FIFO: {}", std::io::Error::last_os_error());
                std::process::exit(1);
            }
            println!("Created FIFO: {path}");
        }
        #[cfg(not(unix))]
        {
            eprintln!("Named pipes not supported on this platform.");
            std::process::exit(1);
        }
    }

    let device = Arc::new(super::open_device(config));
    install_cleanup_handler(Arc::clone(&device), path);

    println!("Feeding whitened bytes to {path} (buffer={buffer_size}B)");
    println!("Press Ctrl+C to stop.");

    let mut buf = vec![0u8; buffer_size];
    'feed: loop {
        match std::fs::OpenOptions::new().write(true).open(path) {
            Ok(mut fifo) => loop {
                if let Err(e) = device.read(&mut buf) {
                    eprintln!("Error reading device: {e}");
                    break 'feed;
                }
                if fifo.write_all(&buf).is_err() {
                    // Reader went away; wait for the next one.
                    break;
                }
                let _ = fifo.flush();
            },
            Err(e) => {
                eprintln!("Error opening FIFO: {e}");
                break;
            }
        }
    }

    let _ = device.close();
    let _ = std::fs::remove_file(path);
}

/// Close the board and remove the FIFO on Ctrl+C / SIGTERM.
fn install_cleanup_handler(device: Arc<infnoise_core::Device>, path: &str) {
    let path = path.to_string();
    let result = ctrlc::set_handler(move || {
        let _ = device.close();
        let _ = std::fs::remove_file(&path);
        std::process::exit(0);
    });
    if let Err(e) = result {
        log::warn!("could not install Ctrl+C handler: {e}");
    }
}
