use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Where log lines go: the console, a serial port, a debug port.
///
/// Shared by every context that logs, interrupt handlers included, so it
/// takes `&self`.
pub trait LogSink: Send + Sync {
    fn write_fmt(&self, args: fmt::Arguments<'_>);
}

pub struct KernelLogger<S: LogSink> {
    sink: S,
    max_level: LevelFilter,
}

impl<S: LogSink> KernelLogger<S> {
    #[must_use]
    pub const fn new(sink: S, max_level: LevelFilter) -> Self {
        Self { sink, max_level }
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Call this once during early init.
    ///
    /// # Errors
    /// If a logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl<S: LogSink> Log for KernelLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        self.sink.write_fmt(format_args!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use std::string::String;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Buffer(Mutex<String>);

    impl LogSink for Buffer {
        fn write_fmt(&self, args: fmt::Arguments<'_>) {
            use fmt::Write;
            let _ = self.0.lock().unwrap().write_fmt(args);
        }
    }

    #[test]
    fn formats_level_target_and_message() {
        let logger = KernelLogger::new(Buffer::default(), LevelFilter::Debug);
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("kernel::fault")
                .args(format_args!("segmentation fault at {:#x}", 0x10))
                .build(),
        );
        assert_eq!(
            *logger.sink().0.lock().unwrap(),
            "[WARN] kernel::fault: segmentation fault at 0x10\n"
        );
    }

    #[test]
    fn records_above_the_level_are_dropped() {
        let logger = KernelLogger::new(Buffer::default(), LevelFilter::Info);
        logger.log(
            &Record::builder()
                .level(Level::Trace)
                .args(format_args!("link page"))
                .build(),
        );
        assert!(logger.sink().0.lock().unwrap().is_empty());
    }
}
