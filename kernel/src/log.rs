// Kernel Logging Subsystem
//
// Implements the Cinder kernel's structured logging framework, providing
// multi-level log output for diagnostics, debugging, and crash analysis
// during development.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error, Panic)
// - Attach timestamps and subsystem origin to every log entry
// - Include source location only for DEBUG entries (file:line)
// - Output logs to the serial port unconditionally
//
// Design principles:
// - Zero-cost filtering: log messages below the current level are dropped early
// - Early-boot friendly: works before full scheduler or user space exists
// - Deterministic output suitable for debugging kernel bring-up
// - Minimal formatting logic inside the hot path
//
// Implementation details:
// - Log level is stored in a global atomic (`CURRENT_LOG_LEVEL`)
// - Timestamps are derived from kernel timer ticks (coarse but monotonic);
//   the external timer interrupt advances the counter via `tick`
// - Serial output is always enabled and considered the ground truth
// - Each log includes severity, timestamp, subsystem origin, and message
//
// Developer ergonomics:
// - Convenience macros (`log_debug!`, `log_info!`, etc.) wrap `_log`
// - Macros automatically capture `file!()` and `line!()` for debug context
//
// Intended usage:
// - Kernel initialization tracing and subsystem bring-up
// - Debugging faults, eviction behavior, and memory management
// - Panic-time diagnostics when the system cannot continue

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
#[allow(dead_code)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Panic = 4,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    fn from_raw(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Panic,
        }
    }
}

static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    set_level(LogLevel::Debug);
}

pub fn set_level(level: LogLevel) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_raw(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Advance the coarse log clock by one timer tick (10 ms granularity).
/// Called by the platform timer interrupt.
#[allow(dead_code)]
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

fn get_timestamp_ms() -> u64 {
    TICKS.load(Ordering::Relaxed) * 10
}

fn format_timestamp(ms: u64) -> (u64, u64) {
    let seconds = ms / 1000;
    let milliseconds = ms % 1000;
    (seconds, milliseconds)
}

pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    if level < get_level() {
        return;
    }

    let timestamp_ms = get_timestamp_ms();
    let (seconds, milliseconds) = format_timestamp(timestamp_ms);

    let level_str = level.as_str();

    if level == LogLevel::Debug {
        serial::_print(format_args!(
            "[t={}.{:03}s] [{}] [{}] {} ({}:{})\n",
            seconds,
            milliseconds,
            level_str,
            origin,
            args,
            file,
            line
        ));
    } else {
        serial::_print(format_args!(
            "[t={}.{:03}s] [{}] [{}] {}\n",
            seconds,
            milliseconds,
            level_str,
            origin,
            args
        ));
    }
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_panic {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Panic,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}
