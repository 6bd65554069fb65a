//! Serial logger backing the `log` facade on bare metal.
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;
use uart_16550::SerialPort;

/// I/O port of the first serial controller (COM1).
const COM1: u16 = 0x3F8;

static LOGGER: SerialLogger = SerialLogger {
    // SAFETY: COM1 is a standard port, it is only accessed through this mutex.
    port: Mutex::new(unsafe { SerialPort::new(COM1) }),
};
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

struct SerialLogger {
    port: Mutex<SerialPort>,
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // Nothing sensible to do if the serial port rejects the write.
            let _ = write_record(&mut *self.port.lock(), record);
        }
    }

    fn flush(&self) {}
}

/// Formats a record as a single `[LEVEL | target] message` line.
fn write_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
    write!(
        out,
        "[{} | {}] {}\n",
        record.level(),
        record.target(),
        record.args()
    )
}

/// Installs the serial logger, subsequent calls are ignored.
pub fn init(level: LevelFilter) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            LOGGER.port.lock().init();
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(level);
            }
        }
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_format() {
        let mut line = String::new();
        write_record(
            &mut line,
            &Record::builder()
                .level(log::Level::Warn)
                .target("vmx::vmcs")
                .args(format_args!("vCPU {}: VMCLEAR failed", 2))
                .build(),
        )
        .unwrap();
        assert_eq!(line, "[WARN | vmx::vmcs] vCPU 2: VMCLEAR failed\n");
    }
}
