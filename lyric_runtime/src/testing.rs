//! Fixtures shared by the unit tests.

use std::sync::Arc;

use crate::{
    BytecodeBuilder, CORE_PLUGIN_LOCATION, CallDescriptor, CallMode, CoreTrap, DataCell, DeclFlags,
    DefinitionDescriptor, ENTRY_SYMBOL, ImportFlags, InterpreterState, InterpreterStateOptions,
    LinkageSection, MemoryLoader, ModuleBuilder, PRELUDE_LOCATION, ProcHeader, Result,
    build_prelude, core_plugin, BytecodeInterpreter,
};

/// A loader serving the prelude and the core plugin.
pub(crate) fn mk_loader() -> Arc<MemoryLoader> {
    let loader = MemoryLoader::new();
    loader.insert_object(PRELUDE_LOCATION, &build_prelude());
    loader.insert_plugin(core_plugin());
    Arc::new(loader)
}

/// An empty module bootstrapped from the prelude and bound to the core
/// plugin.
pub(crate) fn mk_module() -> ModuleBuilder {
    let mut m = ModuleBuilder::new();
    m.add_import(PRELUDE_LOCATION, ImportFlags::SYSTEM_BOOTSTRAP);
    m.add_plugin(CORE_PLUGIN_LOCATION);
    m
}

/// Adds an empty bound constructor.
pub(crate) fn mk_ctor(m: &mut ModuleBuilder, name: &str) -> u32 {
    let proc_offset = m.add_proc(&ProcHeader::new(0, 0), BytecodeBuilder::new());
    m.add_call(CallDescriptor {
        name: name.to_owned(),
        flags: DeclFlags::BOUND,
        mode: CallMode::Constructor,
        receiver: None,
        proc_offset,
    })
}

/// A class allocated by the core object allocator.
pub(crate) fn mk_class(name: &str, ctor: u32) -> DefinitionDescriptor {
    DefinitionDescriptor {
        name: name.to_owned(),
        flags: DeclFlags::empty(),
        super_type: None,
        type_index: 0,
        allocator: Some(CoreTrap::AllocObject.index()),
        ctor,
        members: Vec::new(),
        methods: Vec::new(),
        impls: Vec::new(),
        sealed_subtypes: Vec::new(),
    }
}

/// Appends `$entry` with the given header and code. Returns its call index.
pub(crate) fn add_entry(m: &mut ModuleBuilder, header: ProcHeader, code: BytecodeBuilder) -> u32 {
    let proc_offset = m.add_proc(&header, code);
    let call = m.add_call(CallDescriptor {
        name: ENTRY_SYMBOL.to_owned(),
        flags: DeclFlags::empty(),
        mode: CallMode::Normal,
        receiver: None,
        proc_offset,
    });
    m.add_symbol(ENTRY_SYMBOL, LinkageSection::Call, call);
    call
}

fn create_state(loader: &Arc<MemoryLoader>, m: ModuleBuilder) -> InterpreterState {
    loader.insert_object("/main", &m.into_object());
    let options = InterpreterStateOptions {
        loader: Some(loader.clone()),
        ..Default::default()
    };
    match InterpreterState::create(options, "/main") {
        Ok(state) => state,
        Err(status) => panic!("failed to create state: {status}"),
    }
}

/// Serves `m` as `/main` with an empty `$entry` that has `num_locals`
/// locals, and creates the state for it.
pub(crate) fn mk_state_with(
    loader: &Arc<MemoryLoader>,
    mut m: ModuleBuilder,
    num_locals: u16,
) -> InterpreterState {
    add_entry(&mut m, ProcHeader::new(0, num_locals), BytecodeBuilder::new());
    create_state(loader, m)
}

/// Like [`mk_state_with`], but `m` already carries its `$entry`.
pub(crate) fn mk_program(loader: &Arc<MemoryLoader>, m: ModuleBuilder) -> InterpreterState {
    create_state(loader, m)
}

/// Runs `code` as the body of `$entry` in an otherwise empty module.
pub(crate) fn run_code(num_locals: u16, code: BytecodeBuilder) -> Result<DataCell> {
    let mut m = mk_module();
    add_entry(&mut m, ProcHeader::new(0, num_locals), code);
    run_module(m)
}

pub(crate) fn run_module(m: ModuleBuilder) -> Result<DataCell> {
    let state = mk_program(&mk_loader(), m);
    let mut interpreter = BytecodeInterpreter::new(state, None);
    interpreter.run().map(|exit| exit.value)
}
