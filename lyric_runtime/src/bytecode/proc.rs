use crate::{InterpreterStatus, Result};

pub const LEXICAL_ARGUMENT: u8 = 0;
pub const LEXICAL_LOCAL: u8 = 1;

/// Bytes of the fixed header after the size word.
const FIXED_HEADER_SIZE: usize = 6;
const LEXICAL_RECORD_SIZE: usize = 9;

/// A captured variable imported from an enclosing activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcLexical {
    /// Call index of the activation that owns the variable.
    pub activation_call: u32,
    /// Argument or local slot in that activation.
    pub target_offset: u32,
    /// [`LEXICAL_ARGUMENT`] or [`LEXICAL_LOCAL`]; anything else is rejected
    /// when the lexical is imported.
    pub target: u8,
}

/// The header in front of every proc:
/// `size:u32 arguments:u16 locals:u16 lexicals:u16 lexical*`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcHeader {
    pub num_arguments: u16,
    pub num_locals: u16,
    pub lexicals: Vec<ProcLexical>,
}

/// A parsed header plus the code range it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub header: ProcHeader,
    pub code_start: usize,
    pub code_end: usize,
}

impl ProcHeader {
    pub fn new(num_arguments: u16, num_locals: u16) -> Self {
        Self {
            num_arguments,
            num_locals,
            lexicals: Vec::new(),
        }
    }

    pub fn with_lexical(mut self, activation_call: u32, target: u8, target_offset: u32) -> Self {
        self.lexicals.push(ProcLexical {
            activation_call,
            target_offset,
            target,
        });
        self
    }

    pub fn num_lexicals(&self) -> u16 {
        self.lexicals.len() as u16
    }

    /// Appends the encoded header for a proc with `code_len` bytes of code.
    pub fn write(&self, code_len: u32, out: &mut Vec<u8>) {
        let size = FIXED_HEADER_SIZE + LEXICAL_RECORD_SIZE * self.lexicals.len() + code_len as usize;
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(&self.num_arguments.to_le_bytes());
        out.extend_from_slice(&self.num_locals.to_le_bytes());
        out.extend_from_slice(&self.num_lexicals().to_le_bytes());
        for lexical in &self.lexicals {
            out.extend_from_slice(&lexical.activation_call.to_le_bytes());
            out.extend_from_slice(&lexical.target_offset.to_le_bytes());
            out.push(lexical.target);
        }
    }

    /// Parses the proc starting at `offset` in a segment's bytecode.
    pub fn parse(bytecode: &[u8], offset: u32) -> Result<ProcInfo> {
        let offset = offset as usize;
        if offset >= bytecode.len() {
            return Err(InterpreterStatus::invariant("invalid proc offset"));
        }
        let mut pos = offset;
        let mut take = |len: usize| -> Result<usize> {
            let start = pos;
            if start + len > bytecode.len() {
                return Err(InterpreterStatus::invariant("invalid proc header"));
            }
            pos += len;
            Ok(start)
        };
        let u16_at = |at: usize| u16::from_le_bytes([bytecode[at], bytecode[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([
                bytecode[at],
                bytecode[at + 1],
                bytecode[at + 2],
                bytecode[at + 3],
            ])
        };

        let size = u32_at(take(4)?) as usize;
        let num_arguments = u16_at(take(2)?);
        let num_locals = u16_at(take(2)?);
        let num_lexicals = u16_at(take(2)?) as usize;

        let header_size = FIXED_HEADER_SIZE + LEXICAL_RECORD_SIZE * num_lexicals;
        if size < header_size {
            return Err(InterpreterStatus::invariant("invalid proc size"));
        }
        let code_end = offset + 4 + size;
        if code_end > bytecode.len() {
            return Err(InterpreterStatus::invariant("invalid proc size"));
        }

        let mut lexicals = Vec::with_capacity(num_lexicals);
        for _ in 0..num_lexicals {
            let record = take(LEXICAL_RECORD_SIZE)?;
            lexicals.push(ProcLexical {
                activation_call: u32_at(record),
                target_offset: u32_at(record + 4),
                target: bytecode[record + 8],
            });
        }

        Ok(ProcInfo {
            header: ProcHeader {
                num_arguments,
                num_locals,
                lexicals,
            },
            code_start: offset + 4 + header_size,
            code_end,
        })
    }
}
