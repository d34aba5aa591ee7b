use crate::bytecode::op::{Op, new_flags};
use crate::{Address, LinkageSection};

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction (base for relative offset).
    base: usize,
}

/// Builds the code section of a proc.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_call(&mut self, op: Op, flags: u8, address: Address, placement: u16) {
        self.op(op);
        self.emit_u8(flags);
        self.emit_u32(address.encode());
        self.emit_u16(placement);
    }

    /// Emit an opcode without operands, e.g. `POP` or `I64_ADD`.
    pub fn op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    // ── constants ──────────────────────────────────────────────────

    pub fn nil(&mut self) {
        self.op(Op::Nil);
    }

    pub fn bool(&mut self, value: bool) {
        self.op(if value { Op::True } else { Op::False });
    }

    pub fn i64(&mut self, value: i64) {
        self.op(Op::I64);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn dbl(&mut self, value: f64) {
        self.op(Op::Dbl);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn chr(&mut self, value: char) {
        self.op(Op::Chr);
        self.emit_u32(value as u32);
    }

    /// `LITERAL <address>` — push an entry of the literal pool.
    pub fn literal(&mut self, index: u32) {
        self.op(Op::Literal);
        self.emit_u32(Address::Near(index).encode());
    }

    pub fn synthetic(&mut self, kind: u8) {
        self.op(Op::Synthetic);
        self.emit_u8(kind);
    }

    /// `DESCRIPTOR <section:u8> <address>` — push a descriptor cell.
    pub fn descriptor(&mut self, section: LinkageSection, address: Address) {
        self.op(Op::Descriptor);
        self.emit_u8(section as u8);
        self.emit_u32(address.encode());
    }

    // ── frame and storage access ───────────────────────────────────

    /// `LOAD <flags> <index>` — `index` is a slot for frame loads and an
    /// encoded address for field and module storage loads.
    pub fn load(&mut self, flags: u8, index: u32) {
        self.op(Op::Load);
        self.emit_u8(flags);
        self.emit_u32(index);
    }

    pub fn store(&mut self, flags: u8, index: u32) {
        self.op(Op::Store);
        self.emit_u8(flags);
        self.emit_u32(index);
    }

    pub fn pick(&mut self, offset: u16) {
        self.op(Op::Pick);
        self.emit_u16(offset);
    }

    pub fn drop_at(&mut self, offset: u16) {
        self.op(Op::Drop);
        self.emit_u16(offset);
    }

    pub fn rpick(&mut self, offset: u16) {
        self.op(Op::RPick);
        self.emit_u16(offset);
    }

    pub fn rdrop(&mut self, offset: u16) {
        self.op(Op::RDrop);
        self.emit_u16(offset);
    }

    // ── control flow ───────────────────────────────────────────────

    /// Emit a forward jump (`op` must be `JUMP` or one of the `IF_*`
    /// opcodes). Returns a [`Label`] that must be resolved later with
    /// [`bind`](Self::bind).
    pub fn jump(&mut self, op: Op) -> Label {
        debug_assert!(op.is_jump(), "{op:?} is not a jump");
        self.op(op);
        let offset_pos = self.buf.len();
        self.emit_i16(0); // placeholder
        let base = self.buf.len();
        Label { offset_pos, base }
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i16;
        self.buf[label.offset_pos..label.offset_pos + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit a backward jump to `target` (a byte offset obtained from
    /// [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, op: Op, target: usize) {
        debug_assert!(op.is_jump(), "{op:?} is not a jump");
        self.op(op);
        let base = self.buf.len() + 2;
        let offset = (target as isize - base as isize) as i16;
        self.emit_i16(offset);
    }

    pub fn call_static(&mut self, address: Address, placement: u16) {
        self.emit_call(Op::CallStatic, 0, address, placement);
    }

    pub fn call_virtual(&mut self, flags: u8, address: Address, placement: u16) {
        self.emit_call(Op::CallVirtual, flags, address, placement);
    }

    pub fn call_action(&mut self, flags: u8, action: Address, placement: u16) {
        self.emit_call(Op::CallAction, flags, action, placement);
    }

    pub fn call_extension(&mut self, flags: u8, action: Address, placement: u16) {
        self.emit_call(Op::CallExtension, flags, action, placement);
    }

    /// `CALL_EXISTENTIAL` expects the receiver, the arguments and then the
    /// existential descriptor on the stack.
    pub fn call_existential(&mut self, flags: u8, method: Address, placement: u16) {
        self.emit_call(Op::CallExistential, flags, method, placement);
    }

    pub fn return_(&mut self) {
        self.op(Op::Return);
    }

    /// `TRAP <flags> <index>` — invoke a trap of the segment's plugin.
    pub fn trap(&mut self, flags: u8, index: u32) {
        self.op(Op::Trap);
        self.emit_u8(flags);
        self.emit_u32(index);
    }

    /// `NEW <flags> <address> <placement>` — allocate and construct.
    pub fn new_object(&mut self, kind: u8, call_flags: u8, address: Address, placement: u16) {
        self.emit_call(Op::New, new_flags(kind, call_flags), address, placement);
    }

    pub fn interrupt(&mut self) {
        self.op(Op::Interrupt);
    }

    pub fn abort(&mut self) {
        self.op(Op::Abort);
    }

    pub fn halt(&mut self) {
        self.op(Op::Halt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_jumps_land_on_the_target() {
        let mut b = BytecodeBuilder::new();
        b.nil();
        let top = b.current_offset();
        b.op(Op::Pop);
        b.jump_back(Op::Jump, top);

        let bytes = b.into_bytes();
        let offset = i16::from_le_bytes([bytes[3], bytes[4]]);
        // the jump ends at byte 5, the target is byte 1
        assert_eq!(offset, -4);
    }

    #[test]
    fn calls_encode_far_addresses() {
        let mut b = BytecodeBuilder::new();
        b.call_static(Address::Far(2), 3);
        let bytes = b.as_bytes();
        assert_eq!(bytes[0], Op::CallStatic as u8);
        assert_eq!(
            u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            Address::Far(2).encode()
        );
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 3);
    }
}
