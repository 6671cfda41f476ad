//! Logging bootstrap

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::{Dispatch, Level};
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::engine::TRACE_TARGET;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "hil_channel=info,hil_proxy=info,hil_sim=info";

/// Install the global `tracing` subscriber
///
/// Honors `RUST_LOG`, falling back to [`DEFAULT_FILTER`]. Calling it again
/// (or after another subscriber was installed) is a no-op; returns whether
/// this call installed the subscriber.
pub fn init_logging() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Dispatcher writing traffic events to a file
///
/// Creates missing parent directories and truncates an existing file.
/// Only events on [`TRACE_TARGET`] are written.
pub fn trace_file_dispatch(path: &Path) -> io::Result<Dispatch> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(path)?;
    let layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_filter(Targets::new().with_target(TRACE_TARGET, Level::TRACE));
    Ok(Dispatch::new(tracing_subscriber::registry().with(layer)))
}
