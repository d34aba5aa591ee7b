use std::{fmt, sync::Arc};

use crate::{DataCell, InterpreterStatus, InterpreterState, Result, StackfulCoroutine, VirtualTable};

pub type NativeFunc = fn(&mut TrapContext<'_>) -> Result<()>;

/// One entry of a plugin's trap table.
#[derive(Clone, Copy)]
pub struct Trap {
    pub name: &'static str,
    pub func: NativeFunc,
}

impl Trap {
    pub const fn new(name: &'static str, func: NativeFunc) -> Self {
        Self { name, func }
    }
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trap").field("name", &self.name).finish()
    }
}

/// What a native function sees when it runs.
///
/// Ordinary traps take their inputs from and push their results onto the
/// current coroutine's data stack. Allocator traps additionally receive the
/// virtual table being instantiated and report the new object through
/// `allocation`.
pub struct TrapContext<'a> {
    pub state: &'a mut InterpreterState,
    pub vtable: Option<Arc<VirtualTable>>,
    pub allocation: Option<DataCell>,
}

impl<'a> TrapContext<'a> {
    pub fn new(state: &'a mut InterpreterState) -> Self {
        Self {
            state,
            vtable: None,
            allocation: None,
        }
    }

    pub fn for_allocation(state: &'a mut InterpreterState, vtable: Arc<VirtualTable>) -> Self {
        Self {
            state,
            vtable: Some(vtable),
            allocation: None,
        }
    }

    pub fn coro(&mut self) -> Result<&mut StackfulCoroutine> {
        self.state
            .current_coro_mut()
            .ok_or_else(|| InterpreterStatus::invariant("no current coroutine"))
    }

    pub fn pop(&mut self) -> Result<DataCell> {
        self.coro()?.pop_data()
    }

    pub fn push(&mut self, cell: DataCell) -> Result<()> {
        self.coro()?.push_data(cell);
        Ok(())
    }
}

/// A native library a segment binds its traps to.
pub trait NativePlugin: Send + Sync {
    fn location(&self) -> &str;

    fn traps(&self) -> &[Trap];

    fn get_trap(&self, index: u32) -> Option<NativeFunc> {
        self.traps().get(index as usize).map(|trap| trap.func)
    }

    fn find_trap(&self, name: &str) -> Option<u32> {
        self.traps()
            .iter()
            .position(|trap| trap.name == name)
            .map(|i| i as u32)
    }

    /// Called once for every segment that binds this plugin.
    fn on_load(&self, _segment: u32) -> Result<()> {
        Ok(())
    }

    fn on_unload(&self, _segment: u32) {}
}

/// A plugin that is nothing more than a static trap table.
#[derive(Debug)]
pub struct TrapTable {
    location: String,
    traps: Vec<Trap>,
}

impl TrapTable {
    pub fn new(location: &str, traps: &[Trap]) -> Self {
        Self {
            location: location.to_owned(),
            traps: traps.to_vec(),
        }
    }
}

impl NativePlugin for TrapTable {
    fn location(&self) -> &str {
        &self.location
    }

    fn traps(&self) -> &[Trap] {
        &self.traps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: &mut TrapContext<'_>) -> Result<()> {
        Ok(())
    }

    fn fail(_ctx: &mut TrapContext<'_>) -> Result<()> {
        Err(InterpreterStatus::invariant("fail"))
    }

    #[test]
    fn traps_are_addressed_by_index_and_name() {
        let table = TrapTable::new("test", &[Trap::new("noop", noop), Trap::new("fail", fail)]);
        assert_eq!(table.location(), "test");
        assert!(table.get_trap(1).is_some());
        assert!(table.get_trap(2).is_none());
        assert_eq!(table.find_trap("fail"), Some(1));
        assert_eq!(table.find_trap("missing"), None);
        assert!(table.on_load(0).is_ok());
    }
}
