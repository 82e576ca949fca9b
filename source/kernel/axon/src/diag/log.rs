// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel log lines on the serial console
//! OWNERS: @kernel-team
//! PUBLIC API: log_{error,warn,info,debug,trace}! macros, emit(level, target, args), Level
//! DEPENDS_ON: uart::KernelUart
//! INVARIANTS: One `[LEVEL target] message` line per call, written under a single console
//!             lock; Debug/Trace compiled out of release builds

use core::fmt::{self, Arguments, Write};

/// Log severity, most severe first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Least severe level emitted by this build.
pub const MAX_LEVEL: Level = if cfg!(debug_assertions) { Level::Trace } else { Level::Info };

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    pub fn enabled(self) -> bool {
        self <= MAX_LEVEL
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Writes one log line if `level` is enabled for this build.
///
/// `args` must not log itself; the console lock is held while it is formatted.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    let mut console = crate::uart::KernelUart::lock();
    let _ = writeln!(console, "[{level} {target}] {args}");
}

#[doc(hidden)]
#[macro_export]
macro_rules! __axon_log {
    ($level:ident, target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::$level, $target, format_args!($($arg)+))
    };
    ($level:ident, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::$level, module_path!(), format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::__axon_log!(Error, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::__axon_log!(Warn, $($arg)+) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::__axon_log!(Info, $($arg)+) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => { $crate::__axon_log!(Debug, $($arg)+) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)+) => { $crate::__axon_log!(Trace, $($arg)+) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order_by_severity() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Debug < Level::Trace);
        assert!(Level::Error.enabled());
        assert!(Level::Info.enabled());
        assert_eq!(Level::Trace.enabled(), cfg!(debug_assertions));
    }

    #[test]
    fn line_carries_level_and_target() {
        log_warn!(target: "diag-test", "pid {} marker {:#x}", 3, 0xbeef);
        let captured = crate::uart::take_captured();
        assert!(captured.contains("[WARN diag-test] pid 3 marker 0xbeef\n"), "{captured}");
    }
}
