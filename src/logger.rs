//! Kernel logging
//!
//! Routes the `log` facade to the serial port. Every line carries the tick
//! count, the logical core and the level:
//!
//! ```text
//! [    42] cpu0 INFO  memory: 8192 pages available
//! ```

use core::fmt::Write;
use log::{Level, Log, Metadata, Record};

use crate::config::LOG_LEVEL;

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ticks = crate::core::interrupts::timer::ticks();
        let core = crate::smp::current_core_id();
        let mut serial = crate::SERIAL.lock();
        let _ = writeln!(
            serial,
            "[{:>6}] cpu{} {} {}",
            ticks,
            core,
            level_label(record.level()),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Fixed-width label so messages line up.
pub fn level_label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Install the serial logger. A second call is ignored.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LOG_LEVEL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_have_equal_width() {
        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
            assert_eq!(level_label(level).len(), 5);
        }
    }

    #[test]
    fn configured_level_gates_records() {
        let logger = KernelLogger;
        let error = Metadata::builder().level(Level::Error).build();
        let trace = Metadata::builder().level(Level::Trace).build();
        assert!(logger.enabled(&error));
        assert_eq!(logger.enabled(&trace), LOG_LEVEL >= log::LevelFilter::Trace);
    }
}
