use std::sync::Arc;

use crate::{
    BytecodeDecoder, CallCell, DataCell, Instruction, InterpreterCondition, InterpreterStatus,
    ProcInfo, Result, Segment,
};

/// Instruction pointer into the code of one proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BytecodeCursor {
    pos: usize,
    start: usize,
    end: usize,
}

impl BytecodeCursor {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            pos: start,
            start,
            end,
        }
    }

    pub fn for_proc(info: &ProcInfo) -> Self {
        Self::new(info.code_start, info.code_end)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.end
    }
}

fn underflow() -> InterpreterStatus {
    InterpreterStatus::for_condition(InterpreterCondition::InvalidDataStackV1, "data stack underflow")
}

/// The execution state of one task: instruction pointer, current
/// segment, call stack, data stack and the guards left by re-entrant
/// interpreter runs.
#[derive(Debug, Default)]
pub struct StackfulCoroutine {
    sp: Option<Arc<Segment>>,
    ip: BytecodeCursor,
    call_stack: Vec<CallCell>,
    data_stack: Vec<DataCell>,
    guard_stack: Vec<usize>,
}

impl StackfulCoroutine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(&self) -> Option<&Arc<Segment>> {
        self.sp.as_ref()
    }

    pub fn ip(&self) -> BytecodeCursor {
        self.ip
    }

    /// Decodes the instruction at the ip and advances past it. Returns
    /// `None` once the current proc is exhausted or there is no segment.
    pub fn next_instruction(&mut self) -> Option<Result<Instruction>> {
        let segment = self.sp.as_ref()?;
        if self.ip.is_at_end() {
            return None;
        }
        let code = segment.bytecode().get(..self.ip.end)?;
        let mut decoder = BytecodeDecoder::at(code, self.ip.pos);
        let next = decoder.decode_next()?;
        if next.is_ok() {
            self.ip.pos = decoder.offset();
        }
        Some(next)
    }

    /// Moves the ip relative to its current position. The target has to
    /// stay inside the current proc; landing exactly on the end is allowed
    /// and returns to the caller on the next fetch.
    pub fn move_ip(&mut self, delta: i16) -> bool {
        let target = self.ip.pos as isize + delta as isize;
        if target < self.ip.start as isize || target > self.ip.end as isize {
            return false;
        }
        self.ip.pos = target as usize;
        true
    }

    pub fn transfer_control(&mut self, segment: Option<Arc<Segment>>, ip: BytecodeCursor) {
        self.sp = segment;
        self.ip = ip;
    }

    /// Pushes `frame` and continues execution at `ip` in `segment`. The
    /// frame remembers where to return to.
    pub fn push_call(&mut self, mut frame: CallCell, ip: BytecodeCursor, segment: Arc<Segment>) {
        frame.set_return(self.sp.take(), self.ip);
        self.sp = Some(segment);
        self.ip = ip;
        self.call_stack.push(frame);
    }

    pub fn pop_call(&mut self) -> Option<CallCell> {
        self.call_stack.pop()
    }

    pub fn peek_call(&self) -> Result<&CallCell> {
        self.call_stack
            .last()
            .ok_or_else(|| InterpreterStatus::invariant("empty call stack"))
    }

    pub fn peek_call_mut(&mut self) -> Result<&mut CallCell> {
        self.call_stack
            .last_mut()
            .ok_or_else(|| InterpreterStatus::invariant("empty call stack"))
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Live frames, innermost first.
    pub fn calls(&self) -> impl Iterator<Item = &CallCell> {
        self.call_stack.iter().rev()
    }

    /// Lowest data stack index the current frame may touch.
    fn data_floor(&self) -> usize {
        self.call_stack.last().map_or(0, CallCell::stack_guard)
    }

    pub fn data_depth(&self) -> usize {
        self.data_stack.len()
    }

    pub fn data(&self) -> &[DataCell] {
        &self.data_stack
    }

    pub fn push_data(&mut self, cell: DataCell) {
        self.data_stack.push(cell);
    }

    pub fn pop_data(&mut self) -> Result<DataCell> {
        if self.data_stack.len() <= self.data_floor() {
            return Err(underflow());
        }
        self.data_stack.pop().ok_or_else(underflow)
    }

    /// Pops `count` cells, returned in the order they were pushed.
    pub fn pop_data_n(&mut self, count: usize) -> Result<Vec<DataCell>> {
        let start = self.top_n_start(count)?;
        Ok(self.data_stack.split_off(start))
    }

    /// The top `count` cells without removing them.
    pub fn peek_data_n(&self, count: usize) -> Result<&[DataCell]> {
        let start = self.top_n_start(count)?;
        Ok(&self.data_stack[start..])
    }

    fn top_n_start(&self, count: usize) -> Result<usize> {
        let len = self.data_stack.len();
        match len.checked_sub(count) {
            Some(start) if start >= self.data_floor() => Ok(start),
            _ => Err(InterpreterStatus::invariant("not enough values on data stack")),
        }
    }

    /// Resolves a frame-relative offset: non-negative offsets count up
    /// from the frame's guard, negative ones down from the top.
    fn data_index(&self, offset: i32) -> Result<usize> {
        let floor = self.data_floor();
        let len = self.data_stack.len() as i64;
        let index = if offset < 0 {
            len + offset as i64
        } else {
            floor as i64 + offset as i64
        };
        if index < floor as i64 || index >= len {
            return Err(InterpreterStatus::for_condition(
                InterpreterCondition::InvalidOperandOffsetV1,
                "invalid data stack offset",
            ));
        }
        Ok(index as usize)
    }

    pub fn peek_data(&self, offset: i32) -> Result<&DataCell> {
        let index = self.data_index(offset)?;
        Ok(&self.data_stack[index])
    }

    pub fn drop_data(&mut self, offset: i32) -> Result<DataCell> {
        let index = self.data_index(offset)?;
        Ok(self.data_stack.remove(index))
    }

    /// Truncates the data stack to `depth`, carrying the top cell over
    /// when `keep_top` is set.
    pub fn unwind_data(&mut self, depth: usize, keep_top: bool) {
        if self.data_stack.len() <= depth {
            return;
        }
        let top = if keep_top { self.data_stack.pop() } else { None };
        self.data_stack.truncate(depth);
        self.data_stack.extend(top);
    }

    pub fn push_guard(&mut self) {
        self.guard_stack.push(self.call_stack.len());
    }

    pub fn pop_guard(&mut self) -> Option<usize> {
        self.guard_stack.pop()
    }

    pub fn peek_guard(&self) -> Option<usize> {
        self.guard_stack.last().copied()
    }

    pub fn guard_depth(&self) -> usize {
        self.guard_stack.len()
    }

    /// The call stack may never drop below the innermost guard.
    pub fn check_guard(&self) -> bool {
        self.peek_guard()
            .is_none_or(|guard| self.call_stack.len() >= guard)
    }

    /// Every cell reachable from this coroutine.
    pub fn cells(&self) -> impl Iterator<Item = &DataCell> {
        self.data_stack
            .iter()
            .chain(self.call_stack.iter().flat_map(CallCell::cells))
    }

    pub fn reset(&mut self) {
        self.sp = None;
        self.ip = BytecodeCursor::default();
        self.call_stack.clear();
        self.data_stack.clear();
        self.guard_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcHeader;

    fn mk_frame(guard: usize) -> CallCell {
        CallCell::new(0, 0, 0, &ProcHeader::new(0, 0), vec![], true).with_stack_guard(guard)
    }

    fn mk_coro(cells: &[i64]) -> StackfulCoroutine {
        let mut coro = StackfulCoroutine::new();
        for &i in cells {
            coro.push_data(DataCell::for_i64(i));
        }
        coro
    }

    #[test]
    fn pops_stop_at_the_frame_guard() {
        let mut coro = mk_coro(&[1, 2, 3]);
        coro.call_stack.push(mk_frame(2));

        assert_eq!(coro.pop_data().unwrap(), DataCell::I64(3));
        let err = coro.pop_data().unwrap_err();
        assert!(err.is(InterpreterCondition::InvalidDataStackV1));
        assert!(coro.pop_data_n(1).is_err());
        assert_eq!(coro.data_depth(), 2);
    }

    #[test]
    fn offsets_are_frame_relative() {
        let mut coro = mk_coro(&[1, 2, 3, 4]);
        coro.call_stack.push(mk_frame(1));

        assert_eq!(coro.peek_data(0).unwrap(), &DataCell::I64(2));
        assert_eq!(coro.peek_data(-1).unwrap(), &DataCell::I64(4));
        assert!(coro.peek_data(3).is_err());
        assert!(coro.peek_data(-4).is_err());

        assert_eq!(coro.drop_data(1).unwrap(), DataCell::I64(3));
        assert_eq!(coro.pop_data_n(2).unwrap(), vec![DataCell::I64(2), DataCell::I64(4)]);
    }

    #[test]
    fn unwinding_keeps_the_return_value() {
        let mut coro = mk_coro(&[1, 2, 3]);
        coro.unwind_data(1, true);
        assert_eq!(coro.data(), &[DataCell::I64(1), DataCell::I64(3)]);
        coro.unwind_data(0, false);
        assert_eq!(coro.data_depth(), 0);
    }

    #[test]
    fn guards_track_call_depth() {
        let mut coro = StackfulCoroutine::new();
        coro.call_stack.push(mk_frame(0));
        coro.push_guard();
        assert_eq!(coro.peek_guard(), Some(1));
        assert!(coro.check_guard());
        coro.pop_call();
        assert!(!coro.check_guard());
        assert_eq!(coro.pop_guard(), Some(1));
        assert!(coro.check_guard());
    }

    #[test]
    fn jumps_stay_inside_the_proc() {
        let mut coro = StackfulCoroutine::new();
        coro.ip = BytecodeCursor::new(10, 20);
        assert!(coro.move_ip(10));
        assert!(coro.ip().is_at_end());
        assert!(!coro.move_ip(1));
        assert!(!coro.move_ip(-11));
        assert!(coro.move_ip(-10));
        assert_eq!(coro.ip().pos(), 10);
    }
}
