use std::fmt;

use crate::bytecode::op::Op;

/// A decoded instruction with its operands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Noop,
    Nil,
    Undef,
    True,
    False,
    I64 { value: i64 },
    Dbl { value: f64 },
    Chr { value: u32 },
    Literal { address: u32 },
    Synthetic { kind: u8 },
    Descriptor { section: u8, address: u32 },
    Load { flags: u8, address: u32 },
    Store { flags: u8, address: u32 },
    VaLoad,
    VaSize,
    Pop,
    Dup,
    Pick { offset: u16 },
    Drop { offset: u16 },
    RPick { offset: u16 },
    RDrop { offset: u16 },
    I64Add,
    I64Sub,
    I64Mul,
    I64Div,
    I64Neg,
    DblAdd,
    DblSub,
    DblMul,
    DblDiv,
    DblNeg,
    BoolCmp,
    I64Cmp,
    DblCmp,
    ChrCmp,
    TypeCmp,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    /// Any of the jump opcodes; `op` selects the condition.
    Jump { op: Op, offset: i16 },
    CallStatic { flags: u8, address: u32, placement: u16 },
    CallVirtual { flags: u8, address: u32, placement: u16 },
    CallAction { flags: u8, address: u32, placement: u16 },
    CallExtension { flags: u8, address: u32, placement: u16 },
    CallExistential { flags: u8, address: u32, placement: u16 },
    Return,
    Trap { flags: u8, address: u32 },
    New { flags: u8, address: u32, placement: u16 },
    TypeOf,
    Interrupt,
    Abort,
    Halt,
}

impl Instruction {
    pub fn op(&self) -> Op {
        match self {
            Instruction::Noop => Op::Noop,
            Instruction::Nil => Op::Nil,
            Instruction::Undef => Op::Undef,
            Instruction::True => Op::True,
            Instruction::False => Op::False,
            Instruction::I64 { .. } => Op::I64,
            Instruction::Dbl { .. } => Op::Dbl,
            Instruction::Chr { .. } => Op::Chr,
            Instruction::Literal { .. } => Op::Literal,
            Instruction::Synthetic { .. } => Op::Synthetic,
            Instruction::Descriptor { .. } => Op::Descriptor,
            Instruction::Load { .. } => Op::Load,
            Instruction::Store { .. } => Op::Store,
            Instruction::VaLoad => Op::VaLoad,
            Instruction::VaSize => Op::VaSize,
            Instruction::Pop => Op::Pop,
            Instruction::Dup => Op::Dup,
            Instruction::Pick { .. } => Op::Pick,
            Instruction::Drop { .. } => Op::Drop,
            Instruction::RPick { .. } => Op::RPick,
            Instruction::RDrop { .. } => Op::RDrop,
            Instruction::I64Add => Op::I64Add,
            Instruction::I64Sub => Op::I64Sub,
            Instruction::I64Mul => Op::I64Mul,
            Instruction::I64Div => Op::I64Div,
            Instruction::I64Neg => Op::I64Neg,
            Instruction::DblAdd => Op::DblAdd,
            Instruction::DblSub => Op::DblSub,
            Instruction::DblMul => Op::DblMul,
            Instruction::DblDiv => Op::DblDiv,
            Instruction::DblNeg => Op::DblNeg,
            Instruction::BoolCmp => Op::BoolCmp,
            Instruction::I64Cmp => Op::I64Cmp,
            Instruction::DblCmp => Op::DblCmp,
            Instruction::ChrCmp => Op::ChrCmp,
            Instruction::TypeCmp => Op::TypeCmp,
            Instruction::LogicalAnd => Op::LogicalAnd,
            Instruction::LogicalOr => Op::LogicalOr,
            Instruction::LogicalNot => Op::LogicalNot,
            Instruction::Jump { op, .. } => *op,
            Instruction::CallStatic { .. } => Op::CallStatic,
            Instruction::CallVirtual { .. } => Op::CallVirtual,
            Instruction::CallAction { .. } => Op::CallAction,
            Instruction::CallExtension { .. } => Op::CallExtension,
            Instruction::CallExistential { .. } => Op::CallExistential,
            Instruction::Return => Op::Return,
            Instruction::Trap { .. } => Op::Trap,
            Instruction::New { .. } => Op::New,
            Instruction::TypeOf => Op::TypeOf,
            Instruction::Interrupt => Op::Interrupt,
            Instruction::Abort => Op::Abort,
            Instruction::Halt => Op::Halt,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.op().name();
        match *self {
            Instruction::I64 { value } => write!(f, "{name} {value}"),
            Instruction::Dbl { value } => write!(f, "{name} {value}"),
            Instruction::Chr { value } => write!(f, "{name} {value:#x}"),
            Instruction::Literal { address } => write!(f, "{name} {address:#x}"),
            Instruction::Synthetic { kind } => write!(f, "{name} {kind}"),
            Instruction::Descriptor { section, address }
            | Instruction::Load {
                flags: section,
                address,
            }
            | Instruction::Store {
                flags: section,
                address,
            }
            | Instruction::Trap {
                flags: section,
                address,
            } => write!(f, "{name} {section} {address:#x}"),
            Instruction::Pick { offset }
            | Instruction::Drop { offset }
            | Instruction::RPick { offset }
            | Instruction::RDrop { offset } => write!(f, "{name} {offset}"),
            Instruction::Jump { offset, .. } => write!(f, "{name} {offset:+}"),
            Instruction::CallStatic {
                flags,
                address,
                placement,
            }
            | Instruction::CallVirtual {
                flags,
                address,
                placement,
            }
            | Instruction::CallAction {
                flags,
                address,
                placement,
            }
            | Instruction::CallExtension {
                flags,
                address,
                placement,
            }
            | Instruction::CallExistential {
                flags,
                address,
                placement,
            }
            | Instruction::New {
                flags,
                address,
                placement,
            } => write!(f, "{name} {flags:#x} {address:#x} {placement}"),
            _ => write!(f, "{name}"),
        }
    }
}
