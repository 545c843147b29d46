//! Logging infrastructure.
//!
//! The teacher's `CombinedLogger` hard-coded its two destinations (serial,
//! CBMEM console). This core has no fixed output surface of its own — a
//! USB bus driver in DXE and an Opal unlock engine in SMM log to whatever
//! the host payload provides (serial UART, an SMM communication buffer, an
//! EDK2 `DEBUG()` shim) — so destinations are collaborators implementing
//! `LogSink` rather than modules this crate owns.

use core::fmt::Write;
use core::sync::atomic::{AtomicU64, Ordering};
use heapless::Vec;
use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Maximum number of sinks `init` can register. A USB+Opal firmware image
/// typically wires one (serial) or two (serial + SMM comm buffer).
const MAX_SINKS: usize = 4;

/// A log output destination. Implementations write one already-formatted
/// line; they are responsible for their own framing (newline, truncation).
pub trait LogSink: Sync {
    fn write_line(&self, line: &str);
}

struct CombinedLogger {
    sinks: Mutex<Vec<&'static dyn LogSink, MAX_SINKS>>,
}

static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Ticks (in thousands, for readable log columns) since `init` was called.
///
/// Only meaningful with the `tsc-timestamps` feature, which is x86_64-only;
/// without it timestamps read as a constant `0`.
#[cfg(all(feature = "tsc-timestamps", target_arch = "x86_64"))]
pub fn get_timestamp_k() -> u64 {
    let current = crate::arch::x86_64::rdtsc();
    let boot = BOOT_TSC.load(Ordering::Relaxed);
    current.saturating_sub(boot) / 1000
}

#[cfg(not(all(feature = "tsc-timestamps", target_arch = "x86_64")))]
pub fn get_timestamp_k() -> u64 {
    0
}

impl log::Log for CombinedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let ts = get_timestamp_k();

        // heapless doesn't give us a String; format into a fixed buffer
        // large enough for any line this crate emits.
        let mut buf: heapless::String<256> = heapless::String::new();
        if write!(buf, "[{:>10}] [{}] {}", ts, level_str, record.args()).is_err() {
            return;
        }

        for sink in self.sinks.lock().iter() {
            sink.write_line(buf.as_str());
        }
    }

    fn flush(&self) {}
}

static LOGGER: CombinedLogger = CombinedLogger {
    sinks: Mutex::new(Vec::new()),
};

/// Register a log destination. Call before `init` so boot-time messages
/// aren't dropped; additional sinks may be added later (e.g. once an SMM
/// comm buffer collaborator becomes available partway through boot).
///
/// Returns `false` if `MAX_SINKS` destinations are already registered.
pub fn add_sink(sink: &'static dyn LogSink) -> bool {
    LOGGER.sinks.lock().push(sink).is_ok()
}

/// Initialize the `log` facade at the given level.
#[cfg(all(feature = "tsc-timestamps", target_arch = "x86_64"))]
pub fn init(level: LevelFilter) {
    BOOT_TSC.store(crate::arch::x86_64::rdtsc(), Ordering::Relaxed);
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(level));
}

#[cfg(not(all(feature = "tsc-timestamps", target_arch = "x86_64")))]
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(level));
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
