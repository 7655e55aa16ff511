//! Kernel logging subsystem.
//!
//! Kernel code logs through the `log` facade; this crate is the sink that
//! turns those records into one tagged, coloured line on stderr.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// The sink installed into the `log` facade.
///
/// The output lock keeps each record on its own line when several kernel
/// threads log at once.
struct KernelLogger {
    output: Mutex<()>,
}

static LOGGER: KernelLogger = KernelLogger {
    output: Mutex::new(()),
};

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = Level::from(record.level());
        let _guard = self.output.lock();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "{}[{}]\x1b[0m {}: {}",
            level.color(),
            level.as_str(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the kernel logger at `Info`.
pub fn init() {
    init_with_level(LevelFilter::Info);
}

/// Install the kernel logger with an explicit maximum level.
///
/// Installing twice is harmless: the first sink stays, only the level moves.
pub fn init_with_level(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
