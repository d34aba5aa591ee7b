//! The fetch/execute loop.
//!
//! Lazily initialized statics, instances and enums re-enter the loop
//! through [`BytecodeInterpreter::run_subinterpreter`]. Each nested run
//! pushes a guard on the current coroutine and ends when the frame it was
//! started for returns. Task switches only happen in the outermost run.

use std::{cmp::Ordering, sync::Arc};

use crate::{
    CALL_FORWARD_REST, CALL_RECEIVER_FOLLOWS, DataCell, Descriptor, Instruction,
    InterpreterCondition, InterpreterState, InterpreterStatus, LOAD_ARGUMENT, LOAD_ENUM,
    LOAD_FIELD, LOAD_INSTANCE, LOAD_LEXICAL, LOAD_LOCAL, LOAD_STATIC, LinkageSection, NEW_CLASS,
    NEW_ENUM, NEW_INSTANCE, NEW_STRUCT, Op, Result, STORE_ARGUMENT, STORE_FIELD, STORE_LEXICAL,
    STORE_LOCAL, STORE_STATIC, SYNTHETIC_REST, SYNTHETIC_THIS, RestRef, Segment, StackfulCoroutine, TRAP_INDEX_FOLLOWS, TrapContext,
    TaskType, call_action, call_existential, call_extension, call_static, call_virtual, construct_new, init_static,
    new_call_flags, new_kind, return_to_caller,
};

/// Instructions a task runs before the scheduler gets a chance to switch.
pub const TIME_SLICE: u32 = 64;
/// Scheduler polls at the end of a time slice.
pub const FAST_POLL_ITERATIONS: u32 = 4;
pub const MAX_INTERPRETER_RECURSION: u32 = 128;

/// Host hooks around every instruction and at the terminal events of a
/// run. Every hook has a no-op default.
pub trait Inspector {
    fn before_op(&mut self, _op: &Instruction, _state: &InterpreterState) -> Result<()> {
        Ok(())
    }

    fn after_op(&mut self, _op: &Instruction, _state: &InterpreterState) -> Result<()> {
        Ok(())
    }

    /// Called for INTERRUPT with the popped cell. `Some` pushes the value
    /// and resumes; `None` ends the run with `Interrupted`. An error ends
    /// the run as is, without passing through [`Inspector::on_error`].
    fn on_interrupt(
        &mut self,
        _cell: &DataCell,
        _state: &InterpreterState,
    ) -> Result<Option<DataCell>> {
        Ok(None)
    }

    /// Receives the error that ended the run. Returning a value turns the
    /// failure into a normal exit with that value.
    fn on_error(
        &mut self,
        _op: Option<&Instruction>,
        status: InterpreterStatus,
        _state: &InterpreterState,
    ) -> Result<DataCell> {
        Err(status)
    }

    fn on_halt(
        &mut self,
        _op: Option<&Instruction>,
        cell: DataCell,
        _state: &InterpreterState,
    ) -> Result<DataCell> {
        Ok(cell)
    }
}

/// What a finished run hands back to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterExit {
    pub value: DataCell,
    pub instruction_count: u64,
}

enum Flow {
    Continue,
    Exit(DataCell),
}

pub struct BytecodeInterpreter {
    state: InterpreterState,
    inspector: Option<Box<dyn Inspector>>,
    slice_counter: u32,
    instruction_counter: u64,
    recursion_depth: u32,
    last_op: Option<Instruction>,
    halted: Option<DataCell>,
    /// Set when an inspector hook failed and the error must reach the host
    /// untouched.
    escalated: bool,
}

fn status(condition: InterpreterCondition, message: impl Into<String>) -> InterpreterStatus {
    InterpreterStatus::for_condition(condition, message)
}

fn no_coroutine() -> InterpreterStatus {
    InterpreterStatus::invariant("no current coroutine")
}

// ── Operand helpers ───────────────────────────────────────────────────

/// Pops rhs then lhs, both converted by `extract`.
fn pop_pair<T>(
    coro: &mut StackfulCoroutine,
    extract: impl Fn(&DataCell) -> Option<T>,
) -> Result<(T, T)> {
    let rhs = coro.pop_data()?;
    let rhs = extract(&rhs)
        .ok_or_else(|| status(InterpreterCondition::InvalidDataStackV2, "wrong type for rhs"))?;
    let lhs = coro.pop_data()?;
    let lhs = extract(&lhs)
        .ok_or_else(|| status(InterpreterCondition::InvalidDataStackV1, "wrong type for lhs"))?;
    Ok((lhs, rhs))
}

fn pop_one<T>(
    coro: &mut StackfulCoroutine,
    extract: impl Fn(&DataCell) -> Option<T>,
    message: &str,
) -> Result<T> {
    let cell = coro.pop_data()?;
    extract(&cell).ok_or_else(|| status(InterpreterCondition::InvalidDataStackV1, message))
}

fn checked(value: Option<i64>, message: &str) -> Result<DataCell> {
    value
        .map(DataCell::for_i64)
        .ok_or_else(|| status(InterpreterCondition::InvalidDataStackValue, message))
}

fn ordering_cell(ordering: Ordering) -> DataCell {
    DataCell::for_i64(ordering as i64)
}

/// Pops the receiver and `placement` arguments of a method call. The
/// receiver sits below the arguments unless `CALL_RECEIVER_FOLLOWS` is set.
fn pop_call_operands(
    coro: &mut StackfulCoroutine,
    flags: u8,
    placement: u16,
) -> Result<(DataCell, Vec<DataCell>)> {
    let (receiver, mut args) = if flags & CALL_RECEIVER_FOLLOWS != 0 {
        let receiver = coro.pop_data()?;
        (receiver, coro.pop_data_n(placement as usize)?)
    } else {
        let args = coro.pop_data_n(placement as usize)?;
        (coro.pop_data()?, args)
    };
    if flags & CALL_FORWARD_REST != 0 {
        args.extend_from_slice(coro.peek_call()?.rest());
    }
    Ok((receiver, args))
}

fn jump_taken(op: Op, coro: &mut StackfulCoroutine) -> Result<bool> {
    Ok(match op {
        Op::Jump => true,
        Op::IfNil => coro.pop_data()?.is_nil(),
        Op::IfNotNil => !coro.pop_data()?.is_nil(),
        Op::IfTrue | Op::IfFalse => {
            let value = pop_one(coro, DataCell::as_bool, "value must be a boolean")?;
            value == (op == Op::IfTrue)
        }
        _ => {
            let value = pop_one(coro, DataCell::as_i64, "value must be an integer")?;
            match op {
                Op::IfZero => value == 0,
                Op::IfNotZero => value != 0,
                Op::IfLt => value < 0,
                Op::IfLe => value <= 0,
                Op::IfGt => value > 0,
                Op::IfGe => value >= 0,
                other => {
                    return Err(status(
                        InterpreterCondition::InvalidOperandTypeV1,
                        format!("{} is not a jump", other.name()),
                    ));
                }
            }
        }
    })
}

impl BytecodeInterpreter {
    pub fn new(state: InterpreterState, inspector: Option<Box<dyn Inspector>>) -> Self {
        Self {
            state,
            inspector,
            slice_counter: 0,
            instruction_counter: 0,
            recursion_depth: 0,
            last_op: None,
            halted: None,
            escalated: false,
        }
    }

    pub fn state(&self) -> &InterpreterState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut InterpreterState {
        &mut self.state
    }

    pub fn into_state(self) -> InterpreterState {
        self.state
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_counter
    }

    /// Runs the main task to completion. Errors go through
    /// [`Inspector::on_error`] first; interrupts and failed interrupt hooks
    /// do not.
    pub fn run(&mut self) -> Result<InterpreterExit> {
        if !self.state.is_active() {
            return Err(InterpreterStatus::invariant("interpreter is not active"));
        }
        self.escalated = false;
        let value = match self.run_subinterpreter() {
            Ok(value) => value,
            Err(status) if self.escalated || status.is(InterpreterCondition::Interrupted) => {
                return Err(status);
            }
            Err(status) => {
                log::debug!("run failed: {status}");
                match self.inspector.as_mut() {
                    Some(inspector) => {
                        inspector.on_error(self.last_op.as_ref(), status, &self.state)?
                    }
                    None => return Err(status),
                }
            }
        };
        log::debug!("run finished after {} instructions", self.instruction_counter);
        Ok(InterpreterExit {
            value,
            instruction_count: self.instruction_counter,
        })
    }

    /// Executes until the frame on top of the current coroutine returns,
    /// and yields its result.
    pub fn run_subinterpreter(&mut self) -> Result<DataCell> {
        if self.recursion_depth >= MAX_INTERPRETER_RECURSION {
            return Err(status(
                InterpreterCondition::ExceededMaximumRecursion,
                "exceeded maximum interpreter recursion",
            ));
        }
        self.state
            .current_coro_mut()
            .ok_or_else(no_coroutine)?
            .push_guard();
        self.recursion_depth += 1;
        let result = self.run_loop();
        self.recursion_depth -= 1;
        result
    }

    fn run_loop(&mut self) -> Result<DataCell> {
        loop {
            if let Flow::Exit(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    fn step(&mut self) -> Result<Flow> {
        if let Some(value) = &self.halted {
            return Ok(Flow::Exit(value.clone()));
        }

        self.instruction_counter += 1;
        self.slice_counter += 1;
        if self.slice_counter > TIME_SLICE {
            self.slice_counter = 0;
            self.end_time_slice();
        }
        self.ensure_current_task()?;

        let coro = self.state.current_coro_mut().ok_or_else(no_coroutine)?;
        if !coro.check_guard() {
            return Err(InterpreterStatus::invariant("stack invariant violation"));
        }
        let op = match coro.next_instruction() {
            None => return self.do_return(None),
            Some(op) => op?,
        };
        self.last_op = Some(op);

        if let Some(inspector) = self.inspector.as_mut() {
            inspector.before_op(&op, &self.state)?;
        }
        let flow = self.execute(op)?;
        if let Some(inspector) = self.inspector.as_mut() {
            inspector.after_op(&op, &self.state)?;
        }
        Ok(flow)
    }

    fn end_time_slice(&mut self) {
        let scheduler = self.state.scheduler_mut();
        for _ in 0..FAST_POLL_ITERATIONS {
            if !scheduler.poll() {
                break;
            }
        }
        if self.recursion_depth == 1 {
            let previous = scheduler.current_task_id();
            let next = scheduler.select_next_ready();
            if next != previous {
                log::trace!("switched from {previous:?} to {next:?}");
            }
        }
        if self.state.heap().should_collect() {
            self.state.collect_garbage();
        }
    }

    /// Makes sure a task is running, waiting for one to become ready if
    /// necessary.
    fn ensure_current_task(&mut self) -> Result<()> {
        if self.state.scheduler().current_task_id().is_some() {
            return Ok(());
        }
        if self.recursion_depth > 1 {
            return Err(InterpreterStatus::invariant(
                "task suspended inside a nested interpreter run",
            ));
        }
        let scheduler = self.state.scheduler_mut();
        loop {
            if scheduler.select_next_ready().is_some() {
                return Ok(());
            }
            if !scheduler.blocking_poll() {
                return Err(InterpreterStatus::invariant("no runnable tasks"));
            }
        }
    }

    /// Leaves the current frame. Ends the current run when the frame it
    /// was started for returns, halts when the main task's outermost frame
    /// returns and finishes worker tasks the same way.
    fn do_return(&mut self, op: Option<&Instruction>) -> Result<Flow> {
        let scheduler = self.state.scheduler_mut();
        let (id, task_type) = scheduler
            .current_task()
            .map(|task| (task.id(), task.task_type()))
            .ok_or_else(|| InterpreterStatus::invariant("no current task"))?;
        let coro = scheduler.current_coro_mut().ok_or_else(no_coroutine)?;

        let frame = coro.peek_call()?;
        let returns_value = frame.returns_value();
        let produced = coro.data_depth() > frame.stack_guard();
        let reached = coro.peek_guard() == Some(coro.call_depth());
        if reached {
            coro.pop_guard();
        }
        let has_caller = return_to_caller(coro)?;

        // Constructor frames leave their receiver below the guard.
        if has_caller && !reached {
            if returns_value && !produced {
                coro.push_data(DataCell::Nil);
            }
            return Ok(Flow::Continue);
        }
        let value = if produced || !returns_value {
            coro.pop_data().unwrap_or(DataCell::Nil)
        } else {
            DataCell::Nil
        };
        match (has_caller, task_type) {
            (true, _) => Ok(Flow::Exit(value)),
            (false, TaskType::Main) => self.halt(op, value),
            (false, TaskType::Worker) => {
                scheduler.terminate_task(id, value)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn halt(&mut self, op: Option<&Instruction>, value: DataCell) -> Result<Flow> {
        self.state.halt();
        let value = match self.inspector.as_mut() {
            Some(inspector) => inspector.on_halt(op, value, &self.state)?,
            None => value,
        };
        log::debug!("halted with {value}");
        self.halted = Some(value.clone());
        Ok(Flow::Exit(value))
    }

    fn halted_flow(&self) -> Option<Flow> {
        self.halted.clone().map(Flow::Exit)
    }

    fn current_segment(&self) -> Result<Arc<Segment>> {
        self.state
            .current_coro()
            .and_then(|coro| coro.segment().cloned())
            .ok_or_else(|| InterpreterStatus::invariant("no current segment"))
    }

    fn coro(&mut self) -> Result<&mut StackfulCoroutine> {
        self.state.current_coro_mut().ok_or_else(no_coroutine)
    }

    fn push(&mut self, cell: DataCell) -> Result<Flow> {
        self.coro()?.push_data(cell);
        Ok(Flow::Continue)
    }

    // ── Execution ─────────────────────────────────────────────────────

    fn execute(&mut self, op: Instruction) -> Result<Flow> {
        match op {
            Instruction::Noop => Ok(Flow::Continue),
            Instruction::Nil => self.push(DataCell::Nil),
            Instruction::Undef => self.push(DataCell::undef()),
            Instruction::True => self.push(DataCell::for_bool(true)),
            Instruction::False => self.push(DataCell::for_bool(false)),
            Instruction::I64 { value } => self.push(DataCell::for_i64(value)),
            Instruction::Dbl { value } => self.push(DataCell::for_dbl(value)),
            Instruction::Chr { value } => self.push(DataCell::for_char(value)),
            Instruction::Literal { address } => {
                let segment = self.current_segment()?;
                let literal = self.state.segments().resolve_literal(&segment, address)?;
                self.push(literal)
            }
            Instruction::Synthetic { kind } => {
                let frame = self.coro()?.peek_call()?;
                let cell = match kind {
                    SYNTHETIC_THIS => frame.receiver().clone(),
                    SYNTHETIC_REST => {
                        let rest = RestRef::new(frame.rest().to_vec());
                        DataCell::for_ref(self.state.heap_mut().allocate(rest))
                    }
                    _ => {
                        return Err(status(
                            InterpreterCondition::InvalidOperandTypeV1,
                            "unknown SYNTHETIC type",
                        ));
                    }
                };
                self.push(cell)
            }
            Instruction::Descriptor { section, address } => {
                let section = LinkageSection::try_from(section).map_err(|_| {
                    status(InterpreterCondition::InvalidDataStackV1, "invalid descriptor section")
                })?;
                let segment = self.current_segment()?;
                let cell = self
                    .state
                    .segments()
                    .resolve_descriptor(&segment, section, address)?;
                self.push(cell)
            }
            Instruction::Load { flags, address } => self.load(flags, address),
            Instruction::Store { flags, address } => self.store(flags, address),
            Instruction::VaLoad => {
                let coro = self.coro()?;
                let index = pop_one(coro, DataCell::as_i64, "LOAD index must be Integer")?;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|index| coro.peek_call().ok()?.get_rest(index).cloned())
                    .ok_or_else(|| {
                        status(InterpreterCondition::InvalidDataStackV1, "LOAD index out of range")
                    })?;
                self.push(value)
            }
            Instruction::VaSize => {
                let size = self.coro()?.peek_call()?.num_rest();
                self.push(DataCell::for_i64(size as i64))
            }
            Instruction::Pop => {
                self.coro()?.pop_data()?;
                Ok(Flow::Continue)
            }
            Instruction::Dup => {
                let top = self.coro()?.peek_data(-1)?.clone();
                self.push(top)
            }
            Instruction::Pick { offset } => {
                let cell = self.coro()?.peek_data(offset as i32)?.clone();
                self.push(cell)
            }
            Instruction::Drop { offset } => {
                self.coro()?.drop_data(offset as i32)?;
                Ok(Flow::Continue)
            }
            Instruction::RPick { offset } => {
                let cell = self.coro()?.peek_data(-1 - offset as i32)?.clone();
                self.push(cell)
            }
            Instruction::RDrop { offset } => {
                self.coro()?.drop_data(-1 - offset as i32)?;
                Ok(Flow::Continue)
            }
            Instruction::I64Add
            | Instruction::I64Sub
            | Instruction::I64Mul
            | Instruction::I64Div => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_pair(coro, DataCell::as_i64)?;
                let result = match op {
                    Instruction::I64Add => checked(lhs.checked_add(rhs), "integer overflow")?,
                    Instruction::I64Sub => checked(lhs.checked_sub(rhs), "integer overflow")?,
                    Instruction::I64Mul => checked(lhs.checked_mul(rhs), "integer overflow")?,
                    _ if rhs == 0 => checked(None, "division by zero")?,
                    _ => checked(lhs.checked_div(rhs), "integer overflow")?,
                };
                self.push(result)
            }
            Instruction::I64Neg => {
                let coro = self.coro()?;
                let value = pop_one(coro, DataCell::as_i64, "value must be an integer")?;
                let result = checked(value.checked_neg(), "integer overflow")?;
                self.push(result)
            }
            Instruction::DblAdd
            | Instruction::DblSub
            | Instruction::DblMul
            | Instruction::DblDiv => {
                let (lhs, rhs) = pop_pair(self.coro()?, DataCell::as_dbl)?;
                let result = match op {
                    Instruction::DblAdd => lhs + rhs,
                    Instruction::DblSub => lhs - rhs,
                    Instruction::DblMul => lhs * rhs,
                    _ => lhs / rhs,
                };
                self.push(DataCell::for_dbl(result))
            }
            Instruction::DblNeg => {
                let value = pop_one(self.coro()?, DataCell::as_dbl, "value must be a float")?;
                self.push(DataCell::for_dbl(-value))
            }
            Instruction::BoolCmp => {
                let (lhs, rhs) = pop_pair(self.coro()?, DataCell::as_bool)?;
                self.push(ordering_cell(lhs.cmp(&rhs)))
            }
            Instruction::I64Cmp => {
                let (lhs, rhs) = pop_pair(self.coro()?, DataCell::as_i64)?;
                self.push(ordering_cell(lhs.cmp(&rhs)))
            }
            Instruction::DblCmp => {
                let (lhs, rhs) = pop_pair(self.coro()?, DataCell::as_dbl)?;
                let ordering = lhs.partial_cmp(&rhs).ok_or_else(|| {
                    status(InterpreterCondition::InvalidDataStackValue, "cannot compare NaN")
                })?;
                self.push(ordering_cell(ordering))
            }
            Instruction::ChrCmp => {
                let (lhs, rhs) = pop_pair(self.coro()?, DataCell::as_char)?;
                self.push(ordering_cell(lhs.cmp(&rhs)))
            }
            Instruction::TypeCmp => {
                let coro = self.coro()?;
                let rhs = coro.pop_data()?;
                let lhs = coro.pop_data()?;
                let segments = self.state.segments();
                let comparison = self.state.types().compare_types(&segments, &lhs, &rhs)?;
                self.push(DataCell::for_i64(comparison.as_i64()))
            }
            Instruction::LogicalAnd | Instruction::LogicalOr => {
                let (lhs, rhs) = pop_pair(self.coro()?, DataCell::as_bool)?;
                let result = if op == Instruction::LogicalAnd {
                    lhs && rhs
                } else {
                    lhs || rhs
                };
                self.push(DataCell::for_bool(result))
            }
            Instruction::LogicalNot => {
                let value = pop_one(self.coro()?, DataCell::as_bool, "value must be a boolean")?;
                self.push(DataCell::for_bool(!value))
            }
            Instruction::Jump { op, offset } => {
                let coro = self.coro()?;
                if jump_taken(op, coro)? && !coro.move_ip(offset) {
                    return Err(status(
                        InterpreterCondition::InvalidOperandJumpV1,
                        "invalid jump offset",
                    ));
                }
                Ok(Flow::Continue)
            }
            Instruction::CallStatic {
                flags,
                address,
                placement,
            } => {
                let segments = self.state.segments();
                let coro = self.coro()?;
                let mut args = coro.pop_data_n(placement as usize)?;
                if flags & CALL_FORWARD_REST != 0 {
                    args.extend_from_slice(coro.peek_call()?.rest());
                }
                call_static(&segments, coro, address, args)?;
                Ok(Flow::Continue)
            }
            Instruction::CallVirtual {
                flags,
                address,
                placement,
            } => {
                let segments = self.state.segments();
                let (heap, scheduler) = self.state.split_mut();
                let coro = scheduler.current_coro_mut().ok_or_else(no_coroutine)?;
                let (receiver, args) = pop_call_operands(coro, flags, placement)?;
                call_virtual(&segments, heap, coro, receiver, address, args)?;
                Ok(Flow::Continue)
            }
            Instruction::CallAction {
                flags,
                address,
                placement,
            } => {
                let segments = self.state.segments();
                let (heap, scheduler) = self.state.split_mut();
                let coro = scheduler.current_coro_mut().ok_or_else(no_coroutine)?;
                let (receiver, args) = pop_call_operands(coro, flags, placement)?;
                call_action(&segments, heap, coro, receiver, None, address, args)?;
                Ok(Flow::Continue)
            }
            Instruction::CallExtension {
                flags,
                address,
                placement,
            } => {
                let segments = self.state.segments();
                let (heap, scheduler) = self.state.split_mut();
                let coro = scheduler.current_coro_mut().ok_or_else(no_coroutine)?;
                let concept = pop_one(
                    coro,
                    DataCell::as_descriptor,
                    "invalid descriptor for concept call",
                )?;
                let (receiver, args) = pop_call_operands(coro, flags, placement)?;
                call_extension(&segments, heap, coro, receiver, concept, address, args)?;
                Ok(Flow::Continue)
            }
            Instruction::CallExistential {
                flags,
                address,
                placement,
            } => {
                let segments = self.state.segments();
                let coro = self.coro()?;
                let existential = pop_one(
                    coro,
                    DataCell::as_descriptor,
                    "invalid descriptor for existential call",
                )?;
                let (receiver, args) = pop_call_operands(coro, flags, placement)?;
                call_existential(&segments, coro, receiver, existential, address, args)?;
                Ok(Flow::Continue)
            }
            Instruction::Return => self.do_return(Some(&op)),
            Instruction::Trap { flags, address } => self.trap(flags, address),
            Instruction::New {
                flags,
                address,
                placement,
            } => {
                let section = match new_kind(flags) {
                    NEW_CLASS => LinkageSection::Class,
                    NEW_ENUM => LinkageSection::Enum,
                    NEW_INSTANCE => LinkageSection::Instance,
                    NEW_STRUCT => LinkageSection::Struct,
                    _ => {
                        return Err(status(
                            InterpreterCondition::InvalidDataStackV1,
                            "invalid NEW type",
                        ));
                    }
                };
                let segment = self.current_segment()?;
                let cell = self
                    .state
                    .segments()
                    .resolve_descriptor(&segment, section, address)?;
                construct_new(&mut self.state, cell, placement, new_call_flags(flags))?;
                Ok(Flow::Continue)
            }
            Instruction::TypeOf => {
                let value = self.coro()?.pop_data()?;
                let ty = self.state.types().type_of(&value, self.state.heap())?;
                self.push(ty)
            }
            Instruction::Interrupt => {
                let cell = self.coro()?.pop_data()?;
                let resumed = match self.inspector.as_mut() {
                    Some(inspector) => inspector.on_interrupt(&cell, &self.state),
                    None => Ok(None),
                };
                match resumed {
                    Ok(Some(value)) => self.push(value),
                    Ok(None) => Err(status(InterpreterCondition::Interrupted, "interrupted")),
                    Err(error) => {
                        self.escalated = true;
                        Err(error)
                    }
                }
            }
            Instruction::Abort => Err(status(InterpreterCondition::Aborted, "aborted")),
            Instruction::Halt => {
                let value = self.coro()?.pop_data().unwrap_or(DataCell::Nil);
                self.halt(Some(&op), value)
            }
        }
    }

    fn load(&mut self, flags: u8, address: u32) -> Result<Flow> {
        let invalid_slot = |kind: &str| {
            status(
                InterpreterCondition::InvalidOperandAddressV1,
                format!("invalid {kind} {address}"),
            )
        };
        match flags {
            LOAD_ARGUMENT | LOAD_LOCAL | LOAD_LEXICAL => {
                let frame = self.coro()?.peek_call()?;
                let value = match flags {
                    LOAD_ARGUMENT => frame.get_argument(address).ok_or_else(|| invalid_slot("argument")),
                    LOAD_LOCAL => frame.get_local(address).ok_or_else(|| invalid_slot("local")),
                    _ => frame.get_lexical(address).ok_or_else(|| invalid_slot("lexical")),
                }?;
                let value = value.clone();
                self.push(value)
            }
            LOAD_FIELD => {
                let field = self.field_descriptor(address)?;
                let receiver = self.coro()?.pop_data()?;
                let handle = receiver.as_ref_handle().ok_or_else(|| {
                    status(InterpreterCondition::InvalidReceiver, "invalid receiver for LOAD")
                })?;
                let value = self
                    .state
                    .heap()
                    .get(handle)
                    .ok_or_else(|| {
                        InterpreterStatus::invariant(format!("dangling reference {handle}"))
                    })?
                    .get_field(&field)?;
                self.push(value)
            }
            LOAD_STATIC => {
                let segment = self.current_segment()?;
                let segments = self.state.segments();
                if let Some(value) = segments.load_static(&segment, address)? {
                    return self.push(value);
                }
                init_static(&segments, self.coro()?, address)?;
                let value = self.run_subinterpreter()?;
                if let Some(flow) = self.halted_flow() {
                    return Ok(flow);
                }
                segments.store_static(&segment, address, value.clone())?;
                self.push(value)
            }
            LOAD_INSTANCE | LOAD_ENUM => {
                let segment = self.current_segment()?;
                let segments = self.state.segments();
                let (section, existing) = if flags == LOAD_INSTANCE {
                    (LinkageSection::Instance, segments.load_instance(&segment, address)?)
                } else {
                    (LinkageSection::Enum, segments.load_enum(&segment, address)?)
                };
                if let Some(value) = existing {
                    return self.push(value);
                }
                let cell = segments.resolve_descriptor(&segment, section, address)?;
                construct_new(&mut self.state, cell, 0, 0)?;
                let value = self.run_subinterpreter()?;
                if let Some(flow) = self.halted_flow() {
                    return Ok(flow);
                }
                if flags == LOAD_INSTANCE {
                    segments.store_instance(&segment, address, value.clone())?;
                } else {
                    segments.store_enum(&segment, address, value.clone())?;
                }
                self.push(value)
            }
            _ => Err(status(
                InterpreterCondition::InvalidOperandFlagsAddressV1,
                "unknown LOAD flags",
            )),
        }
    }

    fn store(&mut self, flags: u8, address: u32) -> Result<Flow> {
        let invalid_slot = |kind: &str| {
            status(
                InterpreterCondition::InvalidOperandAddressV1,
                format!("invalid {kind} {address}"),
            )
        };
        match flags {
            STORE_ARGUMENT | STORE_LOCAL | STORE_LEXICAL => {
                let coro = self.coro()?;
                let value = coro.pop_data()?;
                let frame = coro.peek_call_mut()?;
                let (stored, kind) = match flags {
                    STORE_ARGUMENT => (frame.set_argument(address, value), "argument"),
                    STORE_LOCAL => (frame.set_local(address, value), "local"),
                    _ => (frame.set_lexical(address, value), "lexical"),
                };
                if !stored {
                    return Err(invalid_slot(kind));
                }
                Ok(Flow::Continue)
            }
            STORE_FIELD => {
                let field = self.field_descriptor(address)?;
                let coro = self.coro()?;
                let value = coro.pop_data()?;
                let receiver = coro.pop_data()?;
                let handle = receiver.as_ref_handle().ok_or_else(|| {
                    status(InterpreterCondition::InvalidReceiver, "invalid receiver for STORE")
                })?;
                self.state
                    .heap_mut()
                    .get_mut(handle)
                    .ok_or_else(|| {
                        InterpreterStatus::invariant(format!("dangling reference {handle}"))
                    })?
                    .set_field(&field, value)?;
                Ok(Flow::Continue)
            }
            STORE_STATIC => {
                let segment = self.current_segment()?;
                let value = self.coro()?.pop_data()?;
                self.state
                    .segments()
                    .store_static(&segment, address, value)?;
                Ok(Flow::Continue)
            }
            _ => Err(status(
                InterpreterCondition::InvalidOperandFlagsAddressV1,
                "unknown STORE flags",
            )),
        }
    }

    fn field_descriptor(&self, address: u32) -> Result<Descriptor> {
        let segment = self.current_segment()?;
        let cell = self
            .state
            .segments()
            .resolve_descriptor(&segment, LinkageSection::Field, address)?;
        cell.as_descriptor()
            .ok_or_else(|| InterpreterStatus::invariant("invalid field descriptor"))
    }

    fn trap(&mut self, flags: u8, address: u32) -> Result<Flow> {
        let index = if flags & TRAP_INDEX_FOLLOWS != 0 {
            if address != 0 {
                return Err(status(
                    InterpreterCondition::InvalidOperandFlagsAddressV2,
                    "invalid trap address operand",
                ));
            }
            let index = pop_one(self.coro()?, DataCell::as_i64, "invalid trap index")?;
            u32::try_from(index)
                .map_err(|_| status(InterpreterCondition::InvalidDataStackV1, "invalid trap index"))?
        } else {
            address
        };
        let segment = self.current_segment()?;
        let func = segment
            .get_trap(index)
            .ok_or_else(|| InterpreterStatus::invariant("no trap found"))?;
        func(&mut TrapContext::new(&mut self.state))?;
        Ok(Flow::Continue)
    }
}
