/// Bytecode opcodes.
///
/// Every instruction is one opcode byte followed by its operands. Operands
/// are little-endian. Addresses are `u32` and use the Near/Far encoding of
/// [`Address`](crate::Address); jump offsets are `i16` relative to the end
/// of the jump instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Do nothing.
    Noop = 0x00,

    /// Push nil.
    Nil,

    /// Push the undefined marker.
    Undef,

    /// Push `true`.
    True,

    /// Push `false`.
    False,

    /// Push an integer immediate.
    /// Operands: `value:i64`
    I64,

    /// Push a float immediate.
    /// Operands: `value:f64`
    Dbl,

    /// Push a character immediate.
    /// Operands: `value:u32`
    Chr,

    /// Push an entry of the current segment's literal pool.
    /// Operands: `address:u32`
    Literal,

    /// Push a value synthesized from the current frame.
    /// Operands: `kind:u8` ([`SYNTHETIC_THIS`] or [`SYNTHETIC_REST`])
    Synthetic,

    /// Push a descriptor cell.
    /// Operands: `section:u8`, `address:u32`
    Descriptor,

    /// Push a value from the frame, a receiver field or module storage.
    /// Operands: `flags:u8` (`LOAD_*`), `address:u32`
    Load,

    /// Pop a value into the frame, a receiver field or module storage.
    /// Operands: `flags:u8` (`STORE_*`), `address:u32`
    Store,

    /// Pop an index and push that rest argument of the current frame.
    VaLoad,

    /// Push the number of rest arguments of the current frame.
    VaSize,

    /// Discard the top of the stack.
    Pop,

    /// Duplicate the top of the stack.
    Dup,

    /// Push a copy of the cell at an absolute stack index.
    /// Operands: `offset:u16`
    Pick,

    /// Remove the cell at an absolute stack index.
    /// Operands: `offset:u16`
    Drop,

    /// Push a copy of the cell `offset` places below the top.
    /// Operands: `offset:u16`
    RPick,

    /// Remove the cell `offset` places below the top.
    /// Operands: `offset:u16`
    RDrop,

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

    /// Pop two values of the same primitive type and push -1, 0 or 1.
    BoolCmp,
    I64Cmp,
    DblCmp,
    ChrCmp,

    /// Pop two type cells and push -1 (lhs extends rhs), 0 (equal),
    /// 1 (lhs is a super type of rhs) or 2 (unrelated).
    TypeCmp,

    LogicalAnd,
    LogicalOr,
    LogicalNot,

    /// Unconditional relative jump.
    /// Operands: `offset:i16`
    Jump,

    /// Conditional jumps. Each pops one value.
    /// Operands: `offset:i16`
    IfNil,
    IfNotNil,
    IfTrue,
    IfFalse,
    IfZero,
    IfNotZero,
    IfLt,
    IfLe,
    IfGt,
    IfGe,

    /// Call a free function.
    /// Operands: `flags:u8`, `address:u32`, `placement:u16`
    CallStatic,

    /// Call a method on a receiver through its virtual table.
    /// Operands: `flags:u8` (`CALL_*`), `address:u32`, `placement:u16`
    CallVirtual,

    /// Call a concept action implemented by the receiver.
    /// Operands: `flags:u8` (`CALL_*`), `address:u32`, `placement:u16`
    CallAction,

    /// Like [`CallAction`](Op::CallAction), but pops the concept descriptor
    /// to dispatch through first.
    /// Operands: `flags:u8` (`CALL_*`), `address:u32`, `placement:u16`
    CallExtension,

    /// Call a method of an existential on any receiver, including
    /// primitive values. Pops the existential descriptor first.
    /// Operands: `flags:u8` (`CALL_*`), `address:u32`, `placement:u16`
    CallExistential,

    /// Return from the current frame.
    Return,

    /// Invoke a native trap of the current segment's plugin.
    /// Operands: `flags:u8` (`TRAP_*`), `address:u32`
    Trap,

    /// Allocate and construct a new object.
    /// Operands: `flags:u8` (kind in the low nibble, `CALL_*` in the high
    /// nibble), `address:u32`, `placement:u16`
    New,

    /// Pop a value and push its type.
    TypeOf,

    /// Pop a value and hand it to the host as an interrupt.
    Interrupt,

    /// End the run with an `Aborted` error.
    Abort,

    /// Stop the interpreter, returning the top of the stack.
    Halt,
}

pub const SYNTHETIC_THIS: u8 = 1;
pub const SYNTHETIC_REST: u8 = 2;

pub const LOAD_ARGUMENT: u8 = 1;
pub const LOAD_LOCAL: u8 = 2;
pub const LOAD_LEXICAL: u8 = 3;
pub const LOAD_FIELD: u8 = 4;
pub const LOAD_STATIC: u8 = 5;
pub const LOAD_INSTANCE: u8 = 6;
pub const LOAD_ENUM: u8 = 7;

pub const STORE_ARGUMENT: u8 = 1;
pub const STORE_LOCAL: u8 = 2;
pub const STORE_LEXICAL: u8 = 3;
pub const STORE_FIELD: u8 = 4;
pub const STORE_STATIC: u8 = 5;

pub const CALL_RECEIVER_FOLLOWS: u8 = 0x1;
pub const CALL_FORWARD_REST: u8 = 0x2;

pub const TRAP_INDEX_FOLLOWS: u8 = 0x1;

pub const NEW_CLASS: u8 = 1;
pub const NEW_ENUM: u8 = 2;
pub const NEW_INSTANCE: u8 = 3;
pub const NEW_STRUCT: u8 = 4;

/// Packs a `NEW_*` kind and `CALL_*` flags into the `New` flags operand.
pub const fn new_flags(kind: u8, call_flags: u8) -> u8 {
    (kind & 0x0F) | (call_flags << 4)
}

pub const fn new_kind(flags: u8) -> u8 {
    flags & 0x0F
}

pub const fn new_call_flags(flags: u8) -> u8 {
    flags >> 4
}

impl Op {
    pub const COUNT: usize = Op::Halt as usize + 1;

    pub const fn name(self) -> &'static str {
        match self {
            Op::Noop => "NOOP",
            Op::Nil => "NIL",
            Op::Undef => "UNDEF",
            Op::True => "TRUE",
            Op::False => "FALSE",
            Op::I64 => "I64",
            Op::Dbl => "DBL",
            Op::Chr => "CHR",
            Op::Literal => "LITERAL",
            Op::Synthetic => "SYNTHETIC",
            Op::Descriptor => "DESCRIPTOR",
            Op::Load => "LOAD",
            Op::Store => "STORE",
            Op::VaLoad => "VA_LOAD",
            Op::VaSize => "VA_SIZE",
            Op::Pop => "POP",
            Op::Dup => "DUP",
            Op::Pick => "PICK",
            Op::Drop => "DROP",
            Op::RPick => "RPICK",
            Op::RDrop => "RDROP",
            Op::I64Add => "I64_ADD",
            Op::I64Sub => "I64_SUB",
            Op::I64Mul => "I64_MUL",
            Op::I64Div => "I64_DIV",
            Op::I64Neg => "I64_NEG",
            Op::DblAdd => "DBL_ADD",
            Op::DblSub => "DBL_SUB",
            Op::DblMul => "DBL_MUL",
            Op::DblDiv => "DBL_DIV",
            Op::DblNeg => "DBL_NEG",
            Op::BoolCmp => "BOOL_CMP",
            Op::I64Cmp => "I64_CMP",
            Op::DblCmp => "DBL_CMP",
            Op::ChrCmp => "CHR_CMP",
            Op::TypeCmp => "TYPE_CMP",
            Op::LogicalAnd => "LOGICAL_AND",
            Op::LogicalOr => "LOGICAL_OR",
            Op::LogicalNot => "LOGICAL_NOT",
            Op::Jump => "JUMP",
            Op::IfNil => "IF_NIL",
            Op::IfNotNil => "IF_NOTNIL",
            Op::IfTrue => "IF_TRUE",
            Op::IfFalse => "IF_FALSE",
            Op::IfZero => "IF_ZERO",
            Op::IfNotZero => "IF_NOTZERO",
            Op::IfLt => "IF_LT",
            Op::IfLe => "IF_LE",
            Op::IfGt => "IF_GT",
            Op::IfGe => "IF_GE",
            Op::CallStatic => "CALL_STATIC",
            Op::CallVirtual => "CALL_VIRTUAL",
            Op::CallAction => "CALL_ACTION",
            Op::CallExtension => "CALL_EXTENSION",
            Op::CallExistential => "CALL_EXISTENTIAL",
            Op::Return => "RETURN",
            Op::Trap => "TRAP",
            Op::New => "NEW",
            Op::TypeOf => "TYPE_OF",
            Op::Interrupt => "INTERRUPT",
            Op::Abort => "ABORT",
            Op::Halt => "HALT",
        }
    }

    /// Whether the opcode is one of the jump instructions.
    pub const fn is_jump(self) -> bool {
        (self as u8) >= (Op::Jump as u8) && (self as u8) <= (Op::IfGe as u8)
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_round_trip_through_bytes() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::try_from(byte).expect("contiguous opcode");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
    }

    #[test]
    fn new_flags_pack_kind_and_call_flags() {
        let flags = new_flags(NEW_STRUCT, CALL_FORWARD_REST);
        assert_eq!(new_kind(flags), NEW_STRUCT);
        assert_eq!(new_call_flags(flags), CALL_FORWARD_REST);
    }

    #[test]
    fn jump_range_covers_conditionals() {
        assert!(Op::Jump.is_jump());
        assert!(Op::IfGe.is_jump());
        assert!(!Op::CallStatic.is_jump());
        assert!(!Op::LogicalNot.is_jump());
    }
}
