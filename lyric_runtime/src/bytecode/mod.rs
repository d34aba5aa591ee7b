mod builder;
mod decoder;
mod instruction;
mod op;
mod proc;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::BytecodeDecoder;
pub use instruction::Instruction;
pub use op::*;
pub use proc::{LEXICAL_ARGUMENT, LEXICAL_LOCAL, ProcHeader, ProcInfo, ProcLexical};
