//! Process-wide logger setup.
//!
//! Disk threads are named `disk-io-<disk>-<thread>`, so every line carries
//! the thread name to tell reads on different disks apart. The crate's level
//! comes from `DISKIO_LOG_LEVEL` (default `info`); `RUST_LOG` is applied last
//! and overrides both.

use std::io::Write;
use std::sync::Once;
use std::thread;

use env_logger::Builder;
use log::LevelFilter;

pub const LOG_LEVEL_ENV: &str = "DISKIO_LOG_LEVEL";

static INIT: Once = Once::new();

pub fn initialize_logger() {
    // Use call_once_force to recover if an earlier initialization attempt panicked.
    INIT.call_once_force(|_| {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|value| parse_level(&value))
            .unwrap_or(LevelFilter::Info);

        let mut builder = Builder::new();
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("diskio", level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} [{}] {}: {}",
                    buf.timestamp_millis(),
                    record.level(),
                    thread::current().name().unwrap_or("unnamed"),
                    record.target(),
                    record.args()
                )
            })
            .parse_default_env();

        // Avoid panicking if the logger was already initialized elsewhere.
        let _ = builder.try_init();
    });
}

/// Parses a level name such as `debug` or `WARN`.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse().ok()
}
