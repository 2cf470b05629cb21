//! Tracing subscriber setup

use std::fs::{File, OpenOptions};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use vrshim_core::config::base_dir;
use vrshim_core::CoreConfig;

/// Install the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` wins over the config; otherwise `vrshim=info`, or
/// `vrshim=debug` with `debug = true`.
pub(crate) fn init(config: &CoreConfig) {
    let default = if config.debug {
        "vrshim=debug"
    } else {
        "vrshim=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = match open_log_file(config) {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(target: "vrshim::plugin", "Logging initialised");
    }
}

fn open_log_file(config: &CoreConfig) -> Option<File> {
    let name = config.log_file.as_deref()?;
    let path = base_dir().ok()?.join(name);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("vrshim: cannot open log file {}: {e}", path.display());
            None
        }
    }
}
