use crate::bytecode::instruction::Instruction;
use crate::bytecode::op::Op;
use crate::{InterpreterStatus, Result};

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Module bytecode comes from disk, so every read is bounds checked and
/// unknown opcodes are reported instead of trusted.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// A decoder positioned at `pos` inside `bytes`.
    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction>> {
        if self.is_at_end() {
            return None;
        }
        Some(self.decode())
    }

    /// Decodes every instruction, paired with its offset.
    pub fn decode_all(bytes: &'a [u8]) -> Result<Vec<(usize, Instruction)>> {
        let mut decoder = Self::new(bytes);
        let mut out = Vec::new();
        loop {
            let offset = decoder.offset();
            match decoder.decode_next() {
                Some(instruction) => out.push((offset, instruction?)),
                None => return Ok(out),
            }
        }
    }

    fn decode(&mut self) -> Result<Instruction> {
        let start = self.pos;
        let byte = self.read_u8()?;
        let op = Op::try_from(byte).map_err(|b| {
            InterpreterStatus::invariant(format!("unknown opcode {b:#04x} at offset {start}"))
        })?;

        Ok(match op {
            Op::Noop => Instruction::Noop,
            Op::Nil => Instruction::Nil,
            Op::Undef => Instruction::Undef,
            Op::True => Instruction::True,
            Op::False => Instruction::False,
            Op::I64 => Instruction::I64 {
                value: i64::from_le_bytes(self.array()?),
            },
            Op::Dbl => Instruction::Dbl {
                value: f64::from_le_bytes(self.array()?),
            },
            Op::Chr => Instruction::Chr {
                value: self.read_u32()?,
            },
            Op::Literal => Instruction::Literal {
                address: self.read_u32()?,
            },
            Op::Synthetic => Instruction::Synthetic {
                kind: self.read_u8()?,
            },
            Op::Descriptor => Instruction::Descriptor {
                section: self.read_u8()?,
                address: self.read_u32()?,
            },
            Op::Load => Instruction::Load {
                flags: self.read_u8()?,
                address: self.read_u32()?,
            },
            Op::Store => Instruction::Store {
                flags: self.read_u8()?,
                address: self.read_u32()?,
            },
            Op::VaLoad => Instruction::VaLoad,
            Op::VaSize => Instruction::VaSize,
            Op::Pop => Instruction::Pop,
            Op::Dup => Instruction::Dup,
            Op::Pick => Instruction::Pick {
                offset: self.read_u16()?,
            },
            Op::Drop => Instruction::Drop {
                offset: self.read_u16()?,
            },
            Op::RPick => Instruction::RPick {
                offset: self.read_u16()?,
            },
            Op::RDrop => Instruction::RDrop {
                offset: self.read_u16()?,
            },
            Op::I64Add => Instruction::I64Add,
            Op::I64Sub => Instruction::I64Sub,
            Op::I64Mul => Instruction::I64Mul,
            Op::I64Div => Instruction::I64Div,
            Op::I64Neg => Instruction::I64Neg,
            Op::DblAdd => Instruction::DblAdd,
            Op::DblSub => Instruction::DblSub,
            Op::DblMul => Instruction::DblMul,
            Op::DblDiv => Instruction::DblDiv,
            Op::DblNeg => Instruction::DblNeg,
            Op::BoolCmp => Instruction::BoolCmp,
            Op::I64Cmp => Instruction::I64Cmp,
            Op::DblCmp => Instruction::DblCmp,
            Op::ChrCmp => Instruction::ChrCmp,
            Op::TypeCmp => Instruction::TypeCmp,
            Op::LogicalAnd => Instruction::LogicalAnd,
            Op::LogicalOr => Instruction::LogicalOr,
            Op::LogicalNot => Instruction::LogicalNot,
            Op::Jump
            | Op::IfNil
            | Op::IfNotNil
            | Op::IfTrue
            | Op::IfFalse
            | Op::IfZero
            | Op::IfNotZero
            | Op::IfLt
            | Op::IfLe
            | Op::IfGt
            | Op::IfGe => Instruction::Jump {
                op,
                offset: self.read_u16()? as i16,
            },
            Op::CallStatic => {
                let (flags, address, placement) = self.read_call_operands()?;
                Instruction::CallStatic {
                    flags,
                    address,
                    placement,
                }
            }
            Op::CallVirtual => {
                let (flags, address, placement) = self.read_call_operands()?;
                Instruction::CallVirtual {
                    flags,
                    address,
                    placement,
                }
            }
            Op::CallAction => {
                let (flags, address, placement) = self.read_call_operands()?;
                Instruction::CallAction {
                    flags,
                    address,
                    placement,
                }
            }
            Op::CallExtension => {
                let (flags, address, placement) = self.read_call_operands()?;
                Instruction::CallExtension {
                    flags,
                    address,
                    placement,
                }
            }
            Op::CallExistential => {
                let (flags, address, placement) = self.read_call_operands()?;
                Instruction::CallExistential {
                    flags,
                    address,
                    placement,
                }
            }
            Op::Return => Instruction::Return,
            Op::Trap => Instruction::Trap {
                flags: self.read_u8()?,
                address: self.read_u32()?,
            },
            Op::New => {
                let (flags, address, placement) = self.read_call_operands()?;
                Instruction::New {
                    flags,
                    address,
                    placement,
                }
            }
            Op::TypeOf => Instruction::TypeOf,
            Op::Interrupt => Instruction::Interrupt,
            Op::Abort => Instruction::Abort,
            Op::Halt => Instruction::Halt,
        })
    }

    fn read_call_operands(&mut self) -> Result<(u8, u32, u16)> {
        Ok((self.read_u8()?, self.read_u32()?, self.read_u16()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            InterpreterStatus::invariant(format!("truncated instruction at offset {}", self.pos))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    #[inline(always)]
    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;
    use crate::bytecode::{BytecodeBuilder, CALL_FORWARD_REST, LOAD_LOCAL, NEW_CLASS, new_flags};

    #[test]
    fn decodes_what_the_builder_emits() {
        let mut b = BytecodeBuilder::new();
        b.i64(-3);
        b.dbl(2.5);
        b.load(LOAD_LOCAL, 1);
        b.new_object(NEW_CLASS, CALL_FORWARD_REST, Address::Near(7), 2);
        b.op(Op::I64Add);
        b.call_existential(0, Address::Far(1), 1);
        b.op(Op::Undef);
        b.abort();
        b.halt();

        let decoded = BytecodeDecoder::decode_all(b.as_bytes()).expect("decode");
        let instructions: Vec<_> = decoded.iter().map(|(_, i)| *i).collect();
        assert_eq!(
            instructions,
            vec![
                Instruction::I64 { value: -3 },
                Instruction::Dbl { value: 2.5 },
                Instruction::Load {
                    flags: LOAD_LOCAL,
                    address: 1
                },
                Instruction::New {
                    flags: new_flags(NEW_CLASS, CALL_FORWARD_REST),
                    address: 7,
                    placement: 2
                },
                Instruction::I64Add,
                Instruction::CallExistential {
                    flags: 0,
                    address: Address::Far(1).encode(),
                    placement: 1
                },
                Instruction::Undef,
                Instruction::Abort,
                Instruction::Halt,
            ]
        );
        assert_eq!(decoded[1].0, 9);
    }

    #[test]
    fn jumps_are_relative_to_the_end_of_the_instruction() {
        let mut b = BytecodeBuilder::new();
        let label = b.jump(Op::IfTrue);
        b.op(Op::Nil);
        b.bind(label);
        b.op(Op::True);

        let decoded = BytecodeDecoder::decode_all(b.as_bytes()).expect("decode");
        assert_eq!(
            decoded[0].1,
            Instruction::Jump {
                op: Op::IfTrue,
                offset: 1
            }
        );
    }

    #[test]
    fn rejects_truncated_and_unknown_bytes() {
        let mut decoder = BytecodeDecoder::new(&[Op::I64 as u8, 1, 2]);
        let err = decoder.decode_next().expect("one instruction").unwrap_err();
        assert!(err.message.contains("truncated"), "{err}");

        let mut decoder = BytecodeDecoder::new(&[0xFE]);
        let err = decoder.decode_next().expect("one instruction").unwrap_err();
        assert!(err.message.contains("unknown opcode"), "{err}");

        assert!(BytecodeDecoder::new(&[]).decode_next().is_none());
    }
}
