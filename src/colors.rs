//! Canonical color names used throughout logscope.
//!
//! Levels map onto a small official set (`green`, `yellow`, `red`, `purple`,
//! `blue`, `grey`) so every front end colors them the same way.

use crate::logscope_core::LogLevel;

/// Official color names (all lowercase).
pub const OFFICIAL_COLORS: [&str; 6] = ["green", "yellow", "red", "purple", "blue", "grey"];

pub fn level_color_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "grey",
        LogLevel::Debug => "blue",
        LogLevel::Info => "green",
        LogLevel::Warn => "yellow",
        LogLevel::Error => "red",
        LogLevel::Fatal => "purple",
    }
}
