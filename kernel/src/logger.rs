// SPDX-License-Identifier: MPL-2.0

//! The kernel logger: routes the `log` facade to the platform console.

use log::{LevelFilter, Metadata, Record};

use crate::arch;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = alloc::format!(
            "[{:>5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        arch::platform().console_write(&line);
    }

    fn flush(&self) {}
}

/// Installs the logger; harmless to call more than once.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
