//! The on-disk module format.
//!
//! A module starts with the `LYRO` tag and a major/minor version pair,
//! followed by the descriptor sections in a fixed order and finally the
//! bytecode blob. All integers are little-endian; counts and string
//! lengths are `u32`.

use std::fmt;

use crate::{InterpreterCondition, InterpreterStatus};

mod descriptors;
mod reader;
mod writer;

pub use descriptors::*;
pub use reader::ByteReader;
pub use writer::ModuleBuilder;

pub const MAGIC: [u8; 4] = *b"LYRO";
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

/// A decoding failure, with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub offset: usize,
    pub message: String,
}

impl FormatError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.message, self.offset)
    }
}

impl std::error::Error for FormatError {}

impl From<FormatError> for InterpreterStatus {
    fn from(error: FormatError) -> Self {
        InterpreterStatus::for_condition(
            InterpreterCondition::RuntimeInvariant,
            format!("invalid assembly: {error}"),
        )
    }
}
