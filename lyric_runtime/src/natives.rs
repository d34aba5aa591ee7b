//! The `core` plugin: allocators for the prelude classes plus the natives
//! every program can trap into.

use std::{sync::Arc, time::Duration};

use crate::{
    AbstractRef, DataCell, DescriptorKind, FutureRef, InstanceRef, InterpreterCondition,
    InterpreterState, InterpreterStatus, NativePlugin, RefHandle, Result, StackfulCoroutine,
    StringRef, Trap, TrapContext, TrapTable, Utf8Storage, VirtualMethod, VirtualTable, call_proc,
    string_compare,
};

pub const CORE_PLUGIN_LOCATION: &str = "core";

/// Trap indices of the core plugin.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreTrap {
    AllocObject = 0,
    AllocString,
    StringFromLiteral,
    StringLength,
    StringCompare,
    StringConcat,
    StringAt,
    I64ToString,
    Print,
    PromiseCreate,
    PromiseAwait,
    PromiseResolve,
    TaskSpawn,
    Sleep,
    MainArgument,
    MainArgumentCount,
}

impl CoreTrap {
    pub fn index(self) -> u32 {
        self as u32
    }
}

const CORE_TRAPS: [Trap; 16] = [
    Trap::new("alloc_object", alloc_object),
    Trap::new("alloc_string", alloc_string),
    Trap::new("string_from_literal", string_from_literal),
    Trap::new("string_length", string_length),
    Trap::new("string_compare", string_compare_trap),
    Trap::new("string_concat", string_concat),
    Trap::new("string_at", string_at),
    Trap::new("i64_to_string", i64_to_string),
    Trap::new("print", print),
    Trap::new("promise_create", promise_create),
    Trap::new("promise_await", promise_await),
    Trap::new("promise_resolve", promise_resolve),
    Trap::new("task_spawn", task_spawn),
    Trap::new("sleep", sleep),
    Trap::new("main_argument", main_argument),
    Trap::new("main_argument_count", main_argument_count),
];

pub fn core_plugin() -> Arc<dyn NativePlugin> {
    Arc::new(TrapTable::new(CORE_PLUGIN_LOCATION, &CORE_TRAPS))
}

fn wrong_type(expected: &str, cell: &DataCell) -> InterpreterStatus {
    InterpreterStatus::for_condition(
        InterpreterCondition::InvalidDataStackV1,
        format!("expected {expected}, got {}", cell.type_name()),
    )
}

/// The text of a string literal or string ref.
fn string_value(state: &InterpreterState, cell: &DataCell) -> Result<String> {
    match cell {
        DataCell::Utf8Literal(literal) => Ok(literal.to_string()),
        DataCell::Ref(handle) => state
            .heap()
            .get(*handle)
            .and_then(|object| object.utf8_value())
            .map(str::to_owned)
            .ok_or_else(|| wrong_type("a string", cell)),
        other => Err(wrong_type("a string", other)),
    }
}

fn push_string(ctx: &mut TrapContext<'_>, value: String) -> Result<()> {
    let handle = ctx.state.heap_mut().allocate(StringRef::owned(value));
    ctx.push(DataCell::for_ref(handle))
}

// ── Allocators ────────────────────────────────────────────────────────

fn allocation_vtable(ctx: &TrapContext<'_>) -> Result<Arc<VirtualTable>> {
    ctx.vtable
        .clone()
        .ok_or_else(|| InterpreterStatus::invariant("allocator called without a virtual table"))
}

fn alloc_object(ctx: &mut TrapContext<'_>) -> Result<()> {
    let vtable = allocation_vtable(ctx)?;
    let handle = ctx.state.heap_mut().allocate(InstanceRef::new(vtable));
    ctx.allocation = Some(DataCell::for_ref(handle));
    Ok(())
}

fn alloc_string(ctx: &mut TrapContext<'_>) -> Result<()> {
    let vtable = allocation_vtable(ctx)?;
    let string = StringRef::new(Utf8Storage::Owned(Box::from("")), Some(vtable));
    let handle = ctx.state.heap_mut().allocate(string);
    ctx.allocation = Some(DataCell::for_ref(handle));
    Ok(())
}

// ── Strings ───────────────────────────────────────────────────────────

fn string_from_literal(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let DataCell::Utf8Literal(literal) = cell else {
        return Err(wrong_type("a string literal", &cell));
    };
    let handle = ctx.state.heap_mut().allocate(StringRef::from_literal(literal));
    ctx.push(DataCell::for_ref(handle))
}

fn string_length(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let length = string_value(ctx.state, &cell)?.chars().count();
    ctx.push(DataCell::for_i64(length as i64))
}

fn string_compare_trap(ctx: &mut TrapContext<'_>) -> Result<()> {
    let rhs = ctx.pop()?;
    let lhs = ctx.pop()?;
    let ordering = string_compare(&string_value(ctx.state, &lhs)?, &string_value(ctx.state, &rhs)?);
    ctx.push(DataCell::for_i64(ordering as i64))
}

fn string_concat(ctx: &mut TrapContext<'_>) -> Result<()> {
    let rhs = ctx.pop()?;
    let lhs = ctx.pop()?;
    let mut value = string_value(ctx.state, &lhs)?;
    value.push_str(&string_value(ctx.state, &rhs)?);
    push_string(ctx, value)
}

fn string_at(ctx: &mut TrapContext<'_>) -> Result<()> {
    let index = ctx.pop()?;
    let string = ctx.pop()?;
    let index = index
        .as_i64()
        .ok_or_else(|| wrong_type("an integer index", &index))?;
    let value = string_value(ctx.state, &string)?;
    let chr = usize::try_from(index)
        .ok()
        .and_then(|index| value.chars().nth(index))
        .ok_or_else(|| {
            InterpreterStatus::for_condition(
                InterpreterCondition::InvalidDataStackValue,
                format!("string index {index} out of range"),
            )
        })?;
    ctx.push(DataCell::for_char(chr as u32))
}

fn i64_to_string(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let value = cell.as_i64().ok_or_else(|| wrong_type("an integer", &cell))?;
    push_string(ctx, value.to_string())
}

fn print(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let text = match &cell {
        DataCell::Utf8Literal(literal) => literal.to_string(),
        DataCell::Ref(handle) => ctx
            .state
            .heap()
            .get(*handle)
            .map(|object| {
                object
                    .utf8_value()
                    .map_or_else(|| object.to_string_value(), str::to_owned)
            })
            .ok_or_else(|| InterpreterStatus::invariant(format!("dangling reference {handle}")))?,
        other => other.to_string(),
    };
    println!("{text}");
    Ok(())
}

// ── Promises and tasks ────────────────────────────────────────────────

fn future_handle(cell: &DataCell) -> Result<RefHandle> {
    cell.as_ref_handle().ok_or_else(|| wrong_type("a future", cell))
}

fn promise_create(ctx: &mut TrapContext<'_>) -> Result<()> {
    let promise = ctx.state.scheduler_mut().create_promise();
    let handle = ctx.state.heap_mut().allocate(FutureRef::new(promise));
    ctx.state.scheduler_mut().bind_future(promise, handle)?;
    ctx.push(DataCell::for_ref(handle))
}

/// Pushes the future's value, or suspends the current task until the
/// future is resolved.
fn promise_await(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let handle = future_handle(&cell)?;
    let (heap, scheduler) = ctx.state.split_mut();
    let future = heap
        .get(handle)
        .ok_or_else(|| InterpreterStatus::invariant(format!("dangling reference {handle}")))?;
    future.await_future(scheduler)
}

fn promise_resolve(ctx: &mut TrapContext<'_>) -> Result<()> {
    let value = ctx.pop()?;
    let cell = ctx.pop()?;
    let handle = future_handle(&cell)?;
    let (heap, scheduler) = ctx.state.split_mut();
    let future = heap
        .get_mut(handle)
        .ok_or_else(|| InterpreterStatus::invariant(format!("dangling reference {handle}")))?;
    let promise = future.resolve_future(value.clone())?;
    scheduler.resolve_promise(promise, value)
}

/// Starts a worker task running the popped call descriptor and pushes a
/// future of its result.
fn task_spawn(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let call = cell
        .as_descriptor_of(DescriptorKind::Call)
        .ok_or_else(|| wrong_type("a call descriptor", &cell))?;
    let segments = ctx.state.segments();
    let segment = segments.get_segment(call.segment)?;
    let proc_offset = segment
        .object()
        .calls
        .get(call.index as usize)
        .ok_or_else(|| InterpreterStatus::invariant("missing call"))?
        .proc_offset;
    let method = VirtualMethod {
        segment: call.segment,
        call_index: call.index,
        proc_offset,
    };

    let mut coro = StackfulCoroutine::new();
    call_proc(&segments, &mut coro, method, Vec::new(), DataCell::Invalid)?;

    let scheduler = ctx.state.scheduler_mut();
    let task = scheduler.create_task(coro);
    let completion = scheduler
        .task(task)
        .and_then(|task| task.completion())
        .ok_or_else(|| InterpreterStatus::invariant(format!("{task} has no completion")))?;
    let handle = ctx.state.heap_mut().allocate(FutureRef::new(completion));
    ctx.state.scheduler_mut().bind_future(completion, handle)?;
    ctx.push(DataCell::for_ref(handle))
}

fn sleep(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let millis = cell
        .as_i64()
        .and_then(|ms| u64::try_from(ms).ok())
        .ok_or_else(|| wrong_type("a non-negative duration", &cell))?;
    ctx.state
        .scheduler_mut()
        .register_timer(Duration::from_millis(millis))
}

// ── Program arguments ─────────────────────────────────────────────────

/// Pushes the main argument at the popped index, or nil past the end.
fn main_argument(ctx: &mut TrapContext<'_>) -> Result<()> {
    let cell = ctx.pop()?;
    let index = cell
        .as_i64()
        .and_then(|index| usize::try_from(index).ok())
        .ok_or_else(|| wrong_type("a non-negative index", &cell))?;
    let argument = ctx.state.main_argument(index).cloned().unwrap_or(DataCell::Nil);
    ctx.push(argument)
}

fn main_argument_count(ctx: &mut TrapContext<'_>) -> Result<()> {
    let count = ctx.state.num_main_arguments();
    ctx.push(DataCell::for_i64(count as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_entry, mk_loader, mk_module, mk_state_with};
    use crate::{BytecodeBuilder, InterpreterStateOptions, ProcHeader, TaskState};

    fn mk_state() -> InterpreterState {
        mk_state_with(&mk_loader(), mk_module(), 0)
    }

    fn run_trap(state: &mut InterpreterState, trap: CoreTrap, args: Vec<DataCell>) -> Result<()> {
        for arg in args {
            state.current_coro_mut().unwrap().push_data(arg);
        }
        let func = core_plugin().get_trap(trap.index()).unwrap();
        func(&mut TrapContext::new(state))
    }

    fn top_string(state: &InterpreterState) -> String {
        let top = state.current_coro().unwrap().data().last().unwrap().clone();
        string_value(state, &top).unwrap()
    }

    #[test]
    fn trap_names_follow_the_enum() {
        let plugin = core_plugin();
        assert_eq!(plugin.location(), CORE_PLUGIN_LOCATION);
        assert_eq!(plugin.find_trap("alloc_object"), Some(CoreTrap::AllocObject.index()));
        assert_eq!(plugin.find_trap("print"), Some(CoreTrap::Print.index()));
        assert_eq!(plugin.find_trap("sleep"), Some(CoreTrap::Sleep.index()));
        assert_eq!(
            plugin.find_trap("main_argument_count"),
            Some(CoreTrap::MainArgumentCount.index())
        );
        assert_eq!(plugin.traps().len(), CoreTrap::MainArgumentCount.index() as usize + 1);
    }

    #[test]
    fn strings_concatenate_and_compare() {
        let mut state = mk_state();
        let args = vec![
            DataCell::Utf8Literal("caf".into()),
            DataCell::Utf8Literal("é".into()),
        ];
        run_trap(&mut state, CoreTrap::StringConcat, args).unwrap();
        assert_eq!(top_string(&state), "café");

        run_trap(&mut state, CoreTrap::StringLength, vec![]).unwrap();
        let length = state.current_coro_mut().unwrap().pop_data().unwrap();
        assert_eq!(length, DataCell::I64(4));

        let args = vec![
            DataCell::Utf8Literal("apple".into()),
            DataCell::Utf8Literal("banana".into()),
        ];
        run_trap(&mut state, CoreTrap::StringCompare, args).unwrap();
        let ordering = state.current_coro_mut().unwrap().pop_data().unwrap();
        assert_eq!(ordering, DataCell::I64(-1));
    }

    #[test]
    fn string_at_checks_the_index() {
        let mut state = mk_state();
        let args = vec![DataCell::Utf8Literal("🚀x".into()), DataCell::for_i64(1)];
        run_trap(&mut state, CoreTrap::StringAt, args).unwrap();
        let chr = state.current_coro_mut().unwrap().pop_data().unwrap();
        assert_eq!(chr, DataCell::Char32('x' as u32));

        let args = vec![DataCell::Utf8Literal("x".into()), DataCell::for_i64(5)];
        let err = run_trap(&mut state, CoreTrap::StringAt, args).unwrap_err();
        assert!(err.is(InterpreterCondition::InvalidDataStackValue));
    }

    #[test]
    fn integers_format_as_strings() {
        let mut state = mk_state();
        run_trap(&mut state, CoreTrap::I64ToString, vec![DataCell::for_i64(-12)]).unwrap();
        assert_eq!(top_string(&state), "-12");

        let err = run_trap(&mut state, CoreTrap::I64ToString, vec![DataCell::Nil]).unwrap_err();
        assert!(err.is(InterpreterCondition::InvalidDataStackV1));
    }

    #[test]
    fn resolved_promises_are_awaited_without_suspending() {
        let mut state = mk_state();
        run_trap(&mut state, CoreTrap::PromiseCreate, vec![]).unwrap();
        let future = state.current_coro().unwrap().data().last().unwrap().clone();

        let args = vec![future.clone(), DataCell::for_i64(5)];
        run_trap(&mut state, CoreTrap::PromiseResolve, args).unwrap();
        let err = run_trap(&mut state, CoreTrap::PromiseResolve, vec![future.clone(), DataCell::Nil]);
        assert!(err.is_err());

        run_trap(&mut state, CoreTrap::PromiseAwait, vec![future]).unwrap();
        let value = state.current_coro_mut().unwrap().pop_data().unwrap();
        assert_eq!(value, DataCell::I64(5));
    }

    #[test]
    fn awaiting_a_pending_promise_suspends_the_task() {
        let mut state = mk_state();
        run_trap(&mut state, CoreTrap::PromiseCreate, vec![]).unwrap();
        let future = state.current_coro_mut().unwrap().pop_data().unwrap();

        run_trap(&mut state, CoreTrap::PromiseAwait, vec![future]).unwrap();
        assert!(state.scheduler().current_task_id().is_none());
        let main = state.scheduler().main_task();
        assert!(matches!(
            state.scheduler().task(main).unwrap().state(),
            TaskState::Suspended(_)
        ));
    }

    #[test]
    fn spawned_tasks_are_ready_workers() {
        let mut state = mk_state();
        let main = state.segments().find_segment("/main").unwrap();
        let entry = main.object().find_symbol("$entry").unwrap().index;
        let call = DataCell::for_call(main.index(), entry);

        run_trap(&mut state, CoreTrap::TaskSpawn, vec![call]).unwrap();
        assert!(state.scheduler().has_ready());
        assert_eq!(state.scheduler().tasks().count(), 2);
        let future = state.current_coro().unwrap().data().last().unwrap();
        assert!(future.as_ref_handle().is_some());

        let err = run_trap(&mut state, CoreTrap::TaskSpawn, vec![DataCell::Nil]).unwrap_err();
        assert!(err.is(InterpreterCondition::InvalidDataStackV1));
    }

    #[test]
    fn main_arguments_are_indexed_strings() {
        let loader = mk_loader();
        let mut m = mk_module();
        add_entry(&mut m, ProcHeader::new(0, 0), BytecodeBuilder::new());
        loader.insert_object("/main", &m.into_object());
        let options = InterpreterStateOptions {
            loader: Some(loader.clone()),
            main_arguments: vec!["--fast".into()],
            ..Default::default()
        };
        let mut state = InterpreterState::create(options, "/main").unwrap();

        run_trap(&mut state, CoreTrap::MainArgumentCount, vec![]).unwrap();
        let count = state.current_coro_mut().unwrap().pop_data().unwrap();
        assert_eq!(count, DataCell::I64(1));

        run_trap(&mut state, CoreTrap::MainArgument, vec![DataCell::for_i64(0)]).unwrap();
        assert_eq!(top_string(&state), "--fast");
        run_trap(&mut state, CoreTrap::MainArgument, vec![DataCell::for_i64(1)]).unwrap();
        let past_end = state.current_coro_mut().unwrap().pop_data().unwrap();
        assert_eq!(past_end, DataCell::Nil);

        let err = run_trap(&mut state, CoreTrap::MainArgument, vec![DataCell::for_i64(-1)]);
        assert!(err.unwrap_err().is(InterpreterCondition::InvalidDataStackV1));
    }

    #[test]
    fn sleep_rejects_negative_durations() {
        let mut state = mk_state();
        let err = run_trap(&mut state, CoreTrap::Sleep, vec![DataCell::for_i64(-1)]).unwrap_err();
        assert!(err.is(InterpreterCondition::InvalidDataStackV1));

        run_trap(&mut state, CoreTrap::Sleep, vec![DataCell::for_i64(0)]).unwrap();
        assert!(state.scheduler().current_task_id().is_none());
    }
}
