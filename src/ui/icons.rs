//! Emoji used across the terminal output, with plain-text fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("\u{2705} ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("\u{274C} ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("\u{2728} ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("\u{26A0}\u{FE0F}  ", "[!]");

// Loop indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("\u{25B6}\u{FE0F}  ", "[>]");
pub static REVIEW: Emoji<'_, '_> = Emoji("\u{1F50D} ", "[R]");
pub static FEEDBACK: Emoji<'_, '_> = Emoji("\u{1F4AC} ", "[FB]");
pub static DIFF: Emoji<'_, '_> = Emoji("\u{1F4C4} ", "[D]");
pub static PIVOT: Emoji<'_, '_> = Emoji("\u{1F504} ", "[~]");
pub static STOP: Emoji<'_, '_> = Emoji("\u{1F6D1} ", "[STOP]");
