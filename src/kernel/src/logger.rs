//! `log` backend writing to the serial port.

use core::fmt;
use log::Record;

/// One log record as printed: `[LEVEL] message`.
pub struct LogLine<'a, 'r>(pub &'a Record<'r>);

impl fmt::Display for LogLine<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.level(), self.0.args())
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod serial_logger {
    use super::LogLine;
    use log::{LevelFilter, Metadata, Record};

    /// Serial port logger.
    struct SerialLogger;

    static LOGGER: SerialLogger = SerialLogger;

    impl log::Log for SerialLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                crate::serial_println!("{}", LogLine(record));
            }
        }

        fn flush(&self) {}
    }

    /// Installs the serial logger with `level` as the maximum level.
    ///
    /// A second call only changes the level.
    pub fn init(level: LevelFilter) {
        if log::set_logger(&LOGGER).is_err() {
            log::debug!("logger already installed");
        }
        log::set_max_level(level);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use serial_logger::init;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use log::Level;

    #[test]
    fn test_line_is_level_then_message() {
        let line = LogLine(
            &Record::builder()
                .level(Level::Warn)
                .target("vireo_kernel::timer")
                .args(format_args!("timer table full ({} slots)", 64))
                .build(),
        )
        .to_string();
        assert_eq!(line, "[WARN] timer table full (64 slots)");
    }

    #[test]
    fn test_line_has_no_escape_codes() {
        let line = LogLine(
            &Record::builder()
                .level(Level::Error)
                .args(format_args!("boom"))
                .build(),
        )
        .to_string();
        assert!(!line.contains('\x1b'));
        assert!(line.starts_with("[ERROR] "));
    }
}
