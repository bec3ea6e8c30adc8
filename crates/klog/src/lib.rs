//! Logging facade for the SMM MP core.
//!
//! The rendezvous core is not allowed to call into an allocator or a
//! real console, so this is the same shape as a typical embedded
//! logging facade: level-gated free functions over a serial sink, no
//! buffering, no async. Diagnostic counts from the arrival gate
//! (§4.2) and the BSP/AP state machines (§4.3/§4.4) all go through
//! this module rather than calling `khal::serial` directly, so the
//! minimum level can be turned down across the whole core in one
//! place.
#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

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

/// Minimum level that actually reaches the serial sink. Stored as the
/// raw discriminant so it can live in a plain `AtomicU8` in `no_std`.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Initialize the kernel logger (sets up serial port)
pub fn init() {
    khal::serial::init();
}

/// Raise or lower the minimum level that reaches the serial sink.
///
/// SMM runs on the critical path of every SMI; a platform that wants
/// Trace-level arrival-gate diagnostics during bring-up but only
/// Warn-and-above in production calls this once during `smm-core`
/// init rather than recompiling.
pub fn set_min_level(level: Level) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Log a message with a specific level
pub fn log(level: Level, args: fmt::Arguments) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    khal::serial::write_str(level.color());
    khal::serial::write_str("[");
    khal::serial::write_str(level.as_str());
    khal::serial::write_str("]\x1b[0m ");
    khal::serial::write_fmt(args);
    khal::serial::write_str("\n");
}

/// Print to serial without formatting
pub fn print(args: fmt::Arguments) {
    khal::serial::write_fmt(args);
}

/// Log at TRACE level
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Trace, format_args!($($arg)*))
    };
}

/// Log at DEBUG level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, format_args!($($arg)*))
    };
}

/// Log at INFO level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Log at WARN level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at ERROR level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, format_args!($($arg)*))
    };
}

/// Print without newline
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::print(format_args!($($arg)*))
    };
}

/// Print with newline
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {{
        $crate::print(format_args!($($arg)*));
        $crate::print(format_args!("\n"));
    }};
}
