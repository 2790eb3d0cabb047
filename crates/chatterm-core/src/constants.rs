//! Limits shared across crates.

/// Maximum number of command lines kept in an executor's history.
pub const MAX_HISTORY: usize = 50;

/// Buttons per keyboard row.
pub const ROW_BUTTONS: usize = 5;

/// Maximum characters in one outgoing text message.
pub const TEXT_LIMIT: usize = 4096;

/// Highest entry index in a file listing.
pub const FILES_MAX: usize = 99;

/// PTY height. Some applications refuse to work if width or height is 0.
pub const PTY_ROWS: u16 = 100;

/// PTY width.
pub const PTY_COLS: u16 = 100;

/// Interrupt control byte (Ctrl-C).
pub const INTERRUPT: u8 = 0x03;
