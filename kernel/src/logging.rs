//! Kernel logging through the [`log`] facade.
//!
//! The kernel has no idea where text ends up; whoever boots it hands
//! [`init`] a [`Console`] (VGA text buffer, serial port, or a capture buffer
//! in tests).

use alloc::{boxed::Box, string::String};
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::race::OnceBox;

/// A sink for kernel text output.
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);

    /// Write raw bytes from a user buffer.
    fn write_bytes(&self, bytes: &[u8]) {
        self.write_str(&String::from_utf8_lossy(bytes));
    }
}

struct ConsoleWriter<'a>(&'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

pub struct KernelLogger {
    console: Box<dyn Console>,
    level: LevelFilter,
}

impl KernelLogger {
    pub fn new(console: Box<dyn Console>, level: LevelFilter) -> Self {
        Self { console, level }
    }

    pub fn console(&self) -> &dyn Console {
        self.console.as_ref()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut writer = ConsoleWriter(self.console.as_ref());
        // ConsoleWriter never fails.
        let _ = writeln!(
            writer,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: OnceBox<KernelLogger> = OnceBox::new();

/// Install the kernel logger. Only the first call has any effect; later
/// calls return `false` and drop `console`.
pub fn init(console: Box<dyn Console>, level: LevelFilter) -> bool {
    if LOGGER
        .set(Box::new(KernelLogger::new(console, level)))
        .is_err()
    {
        return false;
    }

    let Some(logger) = LOGGER.get() else {
        return false;
    };

    if log::set_logger(logger).is_err() {
        return false;
    }
    log::set_max_level(level);
    true
}

/// Write raw bytes to the console, if one was installed.
pub fn console_write(bytes: &[u8]) {
    if let Some(logger) = LOGGER.get() {
        logger.console().write_bytes(bytes);
    }
}
