//! Device-prefixed leveled logging to stderr
//!
//! Modelled on the kernel's `dev_err`/`dev_info` family: every line names
//! the device that produced it.
//!
//! # Environment Variables
//!
//! - `GPR_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `GPR_FLUSH_LOG=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use gpuring_core::{dev_err, dev_info};
//!
//! dev_info!(name, "ring {} initialized, {} dwords", ring, size);
//! dev_err!(name, "switch-complete irq while idle");
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown strings give `None`
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "err" | "1" => LogLevel::Error,
            "warn" | "warning" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "dbg" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => return None,
        })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "err",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "dbg",
            LogLevel::Trace => "trace",
        }
    }
}

static FLUSH: AtomicBool = AtomicBool::new(false);
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static ENV: Once = Once::new();

fn load_env() {
    ENV.call_once(|| {
        if let Ok(val) = std::env::var("GPR_FLUSH_LOG") {
            FLUSH.store(matches!(val.as_str(), "1" | "true" | "yes" | "on"), Ordering::Relaxed);
        }
        if let Some(level) = std::env::var("GPR_LOG_LEVEL").ok().as_deref().and_then(LogLevel::parse) {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
    });
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    load_env();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Override the level; wins over `GPR_LOG_LEVEL`
pub fn set_log_level(level: LogLevel) {
    load_env();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

#[doc(hidden)]
pub fn _dev_log(level: LogLevel, dev: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = write!(out, "gpuring {} {}: ", dev, level.tag());
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! dev_err {
    ($dev:expr, $($arg:tt)*) => {
        $crate::log::_dev_log($crate::log::LogLevel::Error, $dev, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! dev_warn {
    ($dev:expr, $($arg:tt)*) => {
        $crate::log::_dev_log($crate::log::LogLevel::Warn, $dev, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! dev_info {
    ($dev:expr, $($arg:tt)*) => {
        $crate::log::_dev_log($crate::log::LogLevel::Info, $dev, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! dev_dbg {
    ($dev:expr, $($arg:tt)*) => {
        $crate::log::_dev_log($crate::log::LogLevel::Debug, $dev, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! dev_trace {
    ($dev:expr, $($arg:tt)*) => {
        $crate::log::_dev_log($crate::log::LogLevel::Trace, $dev, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" 1 "), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(42), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        dev_err!("gpu0", "error {}", 1);
        dev_warn!("gpu0", "warn");
        dev_info!("gpu0", "info");
        dev_dbg!("gpu0", "debug {:?}", (1, 2));
        dev_trace!("gpu0", "trace");
    }
}
