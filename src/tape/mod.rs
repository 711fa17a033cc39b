//! Tape media handling: label format and drive opening.

mod file_formats;
pub use file_formats::*;

mod drive;
pub use drive::*;
