mod bytecode;
mod call;
mod cell;
mod construct;
mod coroutine;
mod format;
mod heap;
mod interpreter;
mod loader;
mod natives;
mod plugin;
mod prelude;
mod refs;
mod scheduler;
mod segment;
mod segment_manager;
mod state;
mod status;
mod subroutine;
mod types;
mod vtable;

#[cfg(test)]
mod testing;

pub use bytecode::*;
pub use call::CallCell;
pub use cell::*;
pub use construct::construct_new;
pub use coroutine::{BytecodeCursor, StackfulCoroutine};
pub use format::*;
pub use heap::{
    GarbageCollectionStats, HeapCreateInfo, HeapManager, HeapSettings, HostHandle, RefHandle,
};
pub use interpreter::{
    BytecodeInterpreter, FAST_POLL_ITERATIONS, Inspector, InterpreterExit,
    MAX_INTERPRETER_RECURSION, TIME_SLICE,
};
pub use loader::{AbstractLoader, ChainLoader, DirectoryLoader, MemoryLoader};
pub use natives::{CORE_PLUGIN_LOCATION, CoreTrap, core_plugin};
pub use plugin::{NativeFunc, NativePlugin, Trap, TrapContext, TrapTable};
pub use prelude::{PRELUDE_LOCATION, build_prelude};
pub use refs::{
    AbstractRef, FutureRef, InstanceRef, RefBase, RestRef, StringRef, Utf8Storage, string_compare,
};
pub use scheduler::{
    AsyncHandle, PromiseId, SchedulerCreateInfo, SchedulerSettings, SystemScheduler, Task, TaskId,
    TaskState, TaskType, WaitReason,
};
pub use segment::{LinkEntry, Segment};
pub use segment_manager::SegmentManager;
pub use state::{ENTRY_SYMBOL, InterpreterState, InterpreterStateOptions};
pub use status::*;
pub use subroutine::{
    call_action, call_existential, call_extension, call_proc, call_static, call_virtual,
    init_static, return_to_caller,
};
pub use types::{TypeComparison, TypeManager};
pub use vtable::{ExistentialTable, VirtualMember, VirtualMethod, VirtualTable};
