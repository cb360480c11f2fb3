pub mod device;
pub mod health;
pub mod stream;

use infnoise_core::{Config, Device};

/// Load `--config` (or defaults) and apply the per-field overrides.
pub fn build_config(
    path: Option<&str>,
    target_entropy: Option<f64>,
    tolerance: Option<f64>,
    window: Option<u64>,
) -> infnoise_core::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_json_path(path)?,
        None => Config::default(),
    };
    if let Some(target) = target_entropy {
        config = config.with_target_entropy(target);
    }
    if let Some(tolerance) = tolerance {
        config = config.with_tolerance(tolerance);
    }
    if let Some(window) = window {
        config = config.with_health_window(window);
    }
    config.validate()?;
    Ok(config)
}

/// Open the board or exit with a message.
pub fn open_device(config: Config) -> Device {
    let (vid, pid) = (config.vendor_id, config.product_id);
    match Device::open(config) {
        Ok(device) => {
            let c = device.config();
            log::info!(
                "opened {vid:04x}:{pid:04x} (target {:.3} bits/bit ± {:.1}%, window {} bits)",
                c.target_entropy,
                c.tolerance * 100.0,
                c.health_window
            );
            device
        }
        Err(e) => {
            eprintln!("Error opening Infinite Noise ({vid:04x}:{pid:04x}): {e}");
            std::process::exit(1);
        }
    }
}
