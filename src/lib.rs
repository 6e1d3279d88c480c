use log::debug;
use once_cell::sync::{Lazy, OnceCell};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic;
use std::sync::Arc;
use std::time::Instant;

pub mod codec;
pub mod commands;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod logger;
pub mod plc;
pub mod recipe;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod terminal;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{PlcError, PlcResult};
    pub use log::{debug, error, info, trace, warn};
}

static HOSTNAME: OnceCell<String> = OnceCell::new();
static STARTUP_TIME: OnceCell<Instant> = OnceCell::new();

static TERM_FLAG: Lazy<Arc<atomic::AtomicBool>> =
    Lazy::new(|| Arc::new(atomic::AtomicBool::new(false)));

pub fn sigterm_received() -> bool {
    TERM_FLAG.load(atomic::Ordering::SeqCst)
}

/// # Panics
///
/// Will panic if unable to register SIGTERM/SIGINT handlers.
pub fn register_signals() {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&TERM_FLAG)).unwrap();
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&TERM_FLAG)).unwrap();
}

#[inline]
pub fn hostname() -> &'static str {
    HOSTNAME.get_or_init(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    })
}

#[inline]
pub fn uptime() -> std::time::Duration {
    STARTUP_TIME.get().map(Instant::elapsed).unwrap_or_default()
}

/// Directory for PID files, discovery caches, and DLQ spill files.
/// Mirrors the teacher's `PLC_VAR_DIR`-or-tmp-dir fallback.
pub fn var_dir() -> PathBuf {
    env::var("PLC_VAR_DIR").map_or_else(|_| env::temp_dir(), |p| Path::new(&p).to_owned())
}

/// Initializes process-wide logging the way every terminal needs it set
/// up before doing anything else: `VERBOSE=1` raises the level to
/// trace, `SYSLOG=1` routes through syslog instead of stdout.
///
/// # Panics
///
/// Will panic if `SYSLOG=1` is set but a syslog connection can't be
/// established.
pub fn init_logging() {
    STARTUP_TIME.get_or_init(Instant::now);
    let _ = hostname();

    let verbose = config::verbose();
    let use_syslog = config::syslog_enabled();

    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_USER,
            hostname: None,
            process: "aldctl".to_owned(),
            pid: std::process::id(),
        };
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
            syslog::unix(formatter).expect("connect to syslog"),
        )))
        .expect("install syslog logger");
        log::set_max_level(if verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        });
    } else {
        env_logger::Builder::new()
            .target(env_logger::Target::Stdout)
            .filter_level(if verbose {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Info
            })
            .init();
    }
    debug!("log initialization completed, hostname={}", hostname());
    register_signals();
}
