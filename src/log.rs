//! # Logging
//!
//! Leveled log macros with zero cost when compiled out. Output is written
//! straight to stderr through the locked writer: a heap debugger cannot
//! afford a logging layer that itself allocates.
//!
//! The cargo feature (`no_logs` / `log_error` / `log_info` / `log_debug` /
//! `log_trace`) caps what is compiled in; runtime flags such as
//! `LOG_TRANS` decide which transactions are narrated at all.

use core::fmt;
use std::io::Write;

pub const P_ERROR: &str = "[ERROR] ";
pub const P_WARN: &str = "[WARN]  ";
pub const P_INFO: &str = "[INFO]  ";
pub const P_DEBUG: &str = "[DEBUG] ";
pub const P_TRACE: &str = "[TRACE] ";
pub const P_PLAIN: &str = "";

/// Write one prefixed line to stderr. Formatting streams directly into
/// the writer; nothing is buffered on the heap.
pub fn emit(prefix: &str, args: fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = out.write_all(b"anvil: ");
    let _ = out.write_all(prefix.as_bytes());
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
}

/// Error log. Always active except under `no_logs`.
#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! derror {
    ($($arg:tt)*) => {{
        $crate::log::emit($crate::log::P_ERROR, format_args!($($arg)*));
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! derror {
    ($($t:tt)*) => {{}};
}

/// Warn log. Always active except under `no_logs`.
#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! dwarn {
    ($($arg:tt)*) => {{
        $crate::log::emit($crate::log::P_WARN, format_args!($($arg)*));
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! dwarn {
    ($($t:tt)*) => {{}};
}

/// Info log. Active with `log_info` and above.
#[cfg(any(feature = "log_info", feature = "log_debug", feature = "log_trace"))]
#[macro_export]
macro_rules! dinfo {
    ($($arg:tt)*) => {{
        $crate::log::emit($crate::log::P_INFO, format_args!($($arg)*));
    }};
}

#[cfg(not(any(feature = "log_info", feature = "log_debug", feature = "log_trace")))]
#[macro_export]
macro_rules! dinfo {
    ($($t:tt)*) => {{}};
}

/// Debug log. Active with `log_debug` and above.
#[cfg(any(feature = "log_debug", feature = "log_trace"))]
#[macro_export]
macro_rules! ddebug {
    ($($arg:tt)*) => {{
        $crate::log::emit($crate::log::P_DEBUG, format_args!($($arg)*));
    }};
}

#[cfg(not(any(feature = "log_debug", feature = "log_trace")))]
#[macro_export]
macro_rules! ddebug {
    ($($t:tt)*) => {{}};
}

/// Trace log. Active only with `log_trace`.
#[cfg(feature = "log_trace")]
#[macro_export]
macro_rules! dtrace {
    ($($arg:tt)*) => {{
        $crate::log::emit($crate::log::P_TRACE, format_args!($($arg)*));
    }};
}

#[cfg(not(feature = "log_trace"))]
#[macro_export]
macro_rules! dtrace {
    ($($t:tt)*) => {{}};
}

/// Report line without a level prefix. Used by the statistics and
/// changed-pointer reports, which run only when explicitly requested.
#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! dreport {
    ($($arg:tt)*) => {{
        $crate::log::emit($crate::log::P_PLAIN, format_args!($($arg)*));
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! dreport {
    ($($t:tt)*) => {{}};
}

/// Display adapter that renders raw bytes printably: ASCII stays as-is,
/// common escapes become `\n`-style pairs, everything else is `\ooo`
/// octal. Used when dumping fence regions and stale user data.
pub struct DumpBytes<'a>(pub &'a [u8]);

impl fmt::Display for DumpBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            match b {
                b'\n' => f.write_str("\\n")?,
                b'\r' => f.write_str("\\r")?,
                b'\t' => f.write_str("\\t")?,
                b'\\' => f.write_str("\\\\")?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\{:03o}", b)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_escapes_bytes() {
        let shown = format!("{}", DumpBytes(&[b'a', 0, 0xca, b'\n', b'%']));
        assert_eq!(shown, "a\\000\\312\\n%");
    }
}
