use std::sync::Arc;

use crate::{BytecodeCursor, DataCell, ProcHeader, Segment};

/// One activation frame on a coroutine's call stack.
///
/// `arguments` holds the declared arguments followed by any rest
/// arguments. The frame never pops operands below `stack_guard`.
#[derive(Debug, Clone)]
pub struct CallCell {
    call_index: u32,
    call_segment: u32,
    proc_offset: u32,
    return_segment: Option<Arc<Segment>>,
    return_cursor: BytecodeCursor,
    returns_value: bool,
    receiver: DataCell,
    stack_guard: usize,
    num_arguments: u16,
    arguments: Vec<DataCell>,
    locals: Vec<DataCell>,
    lexicals: Vec<DataCell>,
}

impl CallCell {
    /// Builds a frame for the proc described by `header`. The caller has
    /// already checked that `arguments` covers the declared arity.
    pub fn new(
        call_segment: u32,
        call_index: u32,
        proc_offset: u32,
        header: &ProcHeader,
        arguments: Vec<DataCell>,
        returns_value: bool,
    ) -> Self {
        Self {
            call_index,
            call_segment,
            proc_offset,
            return_segment: None,
            return_cursor: BytecodeCursor::default(),
            returns_value,
            receiver: DataCell::Invalid,
            stack_guard: 0,
            num_arguments: header.num_arguments,
            arguments,
            locals: vec![DataCell::Nil; header.num_locals as usize],
            lexicals: vec![DataCell::Invalid; header.lexicals.len()],
        }
    }

    pub fn with_receiver(mut self, receiver: DataCell) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn with_stack_guard(mut self, stack_guard: usize) -> Self {
        self.stack_guard = stack_guard;
        self
    }

    pub fn call_index(&self) -> u32 {
        self.call_index
    }

    pub fn call_segment(&self) -> u32 {
        self.call_segment
    }

    pub fn proc_offset(&self) -> u32 {
        self.proc_offset
    }

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    pub fn stack_guard(&self) -> usize {
        self.stack_guard
    }

    pub fn receiver(&self) -> &DataCell {
        &self.receiver
    }

    pub fn is_bound(&self) -> bool {
        self.receiver.is_valid()
    }

    pub(crate) fn set_return(&mut self, segment: Option<Arc<Segment>>, cursor: BytecodeCursor) {
        self.return_segment = segment;
        self.return_cursor = cursor;
    }

    pub(crate) fn take_return(&mut self) -> (Option<Arc<Segment>>, BytecodeCursor) {
        (self.return_segment.take(), self.return_cursor)
    }

    pub fn num_arguments(&self) -> usize {
        self.num_arguments as usize
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn num_lexicals(&self) -> usize {
        self.lexicals.len()
    }

    pub fn num_rest(&self) -> usize {
        self.arguments.len() - self.num_arguments()
    }

    pub fn get_argument(&self, index: u32) -> Option<&DataCell> {
        self.arguments[..self.num_arguments()].get(index as usize)
    }

    pub fn set_argument(&mut self, index: u32, value: DataCell) -> bool {
        let declared = self.num_arguments();
        match self.arguments[..declared].get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn get_rest(&self, index: usize) -> Option<&DataCell> {
        self.rest().get(index)
    }

    /// Arguments beyond the declared arity, in call order.
    pub fn rest(&self) -> &[DataCell] {
        &self.arguments[self.num_arguments()..]
    }

    pub fn arguments(&self) -> &[DataCell] {
        &self.arguments
    }

    pub fn get_local(&self, index: u32) -> Option<&DataCell> {
        self.locals.get(index as usize)
    }

    pub fn set_local(&mut self, index: u32, value: DataCell) -> bool {
        match self.locals.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn get_lexical(&self, index: u32) -> Option<&DataCell> {
        self.lexicals.get(index as usize)
    }

    pub fn set_lexical(&mut self, index: u32, value: DataCell) -> bool {
        match self.lexicals.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Every cell the frame keeps alive.
    pub fn cells(&self) -> impl Iterator<Item = &DataCell> {
        std::iter::once(&self.receiver)
            .chain(self.arguments.iter())
            .chain(self.locals.iter())
            .chain(self.lexicals.iter())
    }
}
