pub mod auth;
pub mod autosave;
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod notes;
pub mod remote;
pub mod tasks;
pub mod view;

use std::sync::atomic::{AtomicBool, Ordering};

pub use error::{Error, Result};

/// Whether debug logging is active, shared between the logger filter and the config/flag.
static DEBUG_LOGGING: AtomicBool = AtomicBool::new(false);

pub fn set_debug_logging(enabled: bool) {
    DEBUG_LOGGING.store(enabled, Ordering::Relaxed);
}

pub fn debug_logging() -> bool {
    DEBUG_LOGGING.load(Ordering::Relaxed)
}
