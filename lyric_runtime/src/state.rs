use std::sync::Arc;

use crate::{
    AbstractLoader, DataCell, GarbageCollectionStats, HeapCreateInfo, HeapManager, HeapSettings,
    InterpreterCondition, InterpreterStatus, LinkageSection, Result, SchedulerCreateInfo,
    SchedulerSettings, SegmentManager, StackfulCoroutine, StringRef, SystemScheduler,
    TypeManager, VirtualMethod, call_proc,
};

/// The symbol every runnable assembly exports as its entry call.
pub const ENTRY_SYMBOL: &str = "$entry";

/// Everything needed to build an [`InterpreterState`].
#[derive(Default)]
pub struct InterpreterStateOptions {
    pub loader: Option<Arc<dyn AbstractLoader>>,
    /// Overrides the SYSTEM_BOOTSTRAP import of the main assembly.
    pub prelude_location: Option<String>,
    pub heap: HeapCreateInfo,
    pub scheduler: SchedulerCreateInfo,
    /// Program arguments, exposed to bytecode as strings.
    pub main_arguments: Vec<String>,
}

/// The runtime a [`BytecodeInterpreter`](crate::BytecodeInterpreter)
/// drives: loaded segments, the heap, the tasks and the type tables.
pub struct InterpreterState {
    segments: Arc<SegmentManager>,
    heap: HeapManager,
    scheduler: SystemScheduler,
    types: TypeManager,
    main_location: String,
    main_arguments: Vec<DataCell>,
    active: bool,
}

impl InterpreterState {
    /// Loads `main_location` and its bootstrap assembly, then pushes the
    /// main task's entry frame.
    pub fn create(options: InterpreterStateOptions, main_location: &str) -> Result<Self> {
        let loader = options
            .loader
            .ok_or_else(|| InterpreterStatus::invariant("loader must be specified"))?;
        let mut heap = HeapManager::new(HeapSettings::from_create_info(&options.heap)?);
        let mut scheduler =
            SystemScheduler::new(SchedulerSettings::from_create_info(&options.scheduler));

        let segments = Arc::new(SegmentManager::new(loader));
        let main = segments.load_assembly(main_location)?;

        let bootstrap_location = match options.prelude_location {
            Some(location) => location,
            None => {
                let mut bootstraps = main
                    .object()
                    .imports
                    .iter()
                    .filter(|import| import.is_system_bootstrap());
                let first = bootstraps.next().ok_or_else(|| {
                    InterpreterStatus::invariant("missing system bootstrap import")
                })?;
                if bootstraps.next().is_some() {
                    return Err(InterpreterStatus::invariant(
                        "duplicate system bootstrap detected",
                    ));
                }
                first.location.clone()
            }
        };
        let bootstrap = segments.load_assembly(&bootstrap_location)?;
        let types = TypeManager::new(&bootstrap)?;

        let entry = main
            .object()
            .find_symbol(ENTRY_SYMBOL)
            .filter(|symbol| symbol.section == LinkageSection::Call)
            .ok_or_else(|| {
                InterpreterStatus::for_condition(
                    InterpreterCondition::MissingSymbol,
                    format!("missing symbol {ENTRY_SYMBOL}"),
                )
            })?;
        let call = main
            .object()
            .calls
            .get(entry.index as usize)
            .ok_or_else(|| InterpreterStatus::invariant("missing call"))?;
        let method = VirtualMethod {
            segment: main.index(),
            call_index: entry.index,
            proc_offset: call.proc_offset,
        };
        let coro = scheduler
            .current_coro_mut()
            .ok_or_else(|| InterpreterStatus::invariant("no current coroutine"))?;
        call_proc(&segments, coro, method, Vec::new(), DataCell::Invalid)?;

        let main_arguments = options
            .main_arguments
            .into_iter()
            .map(|argument| DataCell::for_ref(heap.allocate(StringRef::owned(argument))))
            .collect();

        log::info!("loaded {main_location} with bootstrap {bootstrap_location}");
        Ok(Self {
            segments,
            heap,
            scheduler,
            types,
            main_location: main_location.to_owned(),
            main_arguments,
            active: true,
        })
    }

    pub fn segments(&self) -> Arc<SegmentManager> {
        self.segments.clone()
    }

    pub fn heap(&self) -> &HeapManager {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut HeapManager {
        &mut self.heap
    }

    pub fn scheduler(&self) -> &SystemScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SystemScheduler {
        &mut self.scheduler
    }

    /// Borrows the heap and the scheduler at the same time.
    pub fn split_mut(&mut self) -> (&mut HeapManager, &mut SystemScheduler) {
        (&mut self.heap, &mut self.scheduler)
    }

    pub fn types(&self) -> &TypeManager {
        &self.types
    }

    pub fn current_coro(&self) -> Option<&StackfulCoroutine> {
        self.scheduler.current_coro()
    }

    pub fn current_coro_mut(&mut self) -> Option<&mut StackfulCoroutine> {
        self.scheduler.current_coro_mut()
    }

    pub fn main_location(&self) -> &str {
        &self.main_location
    }

    pub fn main_argument(&self, index: usize) -> Option<&DataCell> {
        self.main_arguments.get(index)
    }

    pub fn num_main_arguments(&self) -> usize {
        self.main_arguments.len()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn halt(&mut self) {
        self.active = false;
    }

    /// Collects everything not reachable from a task, a segment's module
    /// storage, a main argument or a host handle. Resolved promise values move into their
    /// futures first; promises nobody can observe any more are dropped.
    pub fn collect_garbage(&mut self) -> GarbageCollectionStats {
        for (future, value) in self.scheduler.drain_resolved() {
            if let Some(future) = self.heap.get_mut(future) {
                future.settle_future(value);
            }
        }

        let mut roots = Vec::new();
        let mut visit = |cell: &DataCell| {
            if let Some(handle) = cell.as_ref_handle() {
                roots.push(handle);
            }
        };
        self.scheduler.visit_roots(&mut visit);
        self.main_arguments.iter().for_each(&mut visit);
        for segment in self.segments.segments() {
            segment.visit_roots(&mut visit);
        }
        let stats = self.heap.collect_garbage(&roots);
        let heap = &self.heap;
        let dropped = self.scheduler.prune_promises(|future| heap.contains(future));
        if dropped > 0 {
            log::debug!("gc: dropped {dropped} unobservable promises");
        }
        stats
    }
}

impl Drop for InterpreterState {
    fn drop(&mut self) {
        self.segments.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_entry, mk_loader, mk_module, mk_state_with};
    use crate::{
        AbstractRef, BytecodeBuilder, CORE_PLUGIN_LOCATION, ProcHeader, Descriptor, DescriptorKind, FutureRef, ImportFlags,
        InstanceRef, ModuleBuilder, PRELUDE_LOCATION, StaticDescriptor,
    };

    #[test]
    fn creation_pushes_the_entry_frame() {
        let state = mk_state_with(&mk_loader(), mk_module(), 2);
        let coro = state.current_coro().unwrap();
        assert_eq!(coro.call_depth(), 1);
        assert_eq!(coro.peek_call().unwrap().num_locals(), 2);
        assert!(state.is_active());
        assert_eq!(state.main_location(), "/main");
    }

    #[test]
    fn a_loader_is_required() {
        let err = InterpreterState::create(InterpreterStateOptions::default(), "/main")
            .err()
            .unwrap();
        assert_eq!(err.message, "loader must be specified");
    }

    #[test]
    fn missing_assemblies_and_entries_are_reported() {
        let loader = mk_loader();
        let options = || InterpreterStateOptions {
            loader: Some(loader.clone()),
            ..Default::default()
        };
        let err = InterpreterState::create(options(), "/nowhere").err().unwrap();
        assert!(err.is(InterpreterCondition::MissingAssembly));

        loader.insert_object("/empty", &mk_module().into_object());
        let err = InterpreterState::create(options(), "/empty").err().unwrap();
        assert!(err.is(InterpreterCondition::MissingSymbol));
    }

    #[test]
    fn exactly_one_bootstrap_import_is_allowed() {
        let loader = mk_loader();
        let options = || InterpreterStateOptions {
            loader: Some(loader.clone()),
            ..Default::default()
        };

        let mut twice = mk_module();
        twice.add_import(PRELUDE_LOCATION, ImportFlags::SYSTEM_BOOTSTRAP);
        loader.insert_object("/twice", &twice.into_object());
        let err = InterpreterState::create(options(), "/twice").err().unwrap();
        assert_eq!(err.message, "duplicate system bootstrap detected");

        let mut none = ModuleBuilder::new();
        none.add_plugin(CORE_PLUGIN_LOCATION);
        loader.insert_object("/none", &none.into_object());
        let err = InterpreterState::create(options(), "/none").err().unwrap();
        assert_eq!(err.message, "missing system bootstrap import");
    }

    #[test]
    fn collection_keeps_stack_and_static_roots() {
        let loader = mk_loader();
        let mut m = mk_module();
        let counter = m.add_static(StaticDescriptor {
            name: "counter".into(),
            flags: Default::default(),
            type_index: 0,
            initializer: None,
        });
        m.add_symbol("counter", LinkageSection::Static, counter);
        let mut state = mk_state_with(&loader, m, 0);

        let on_stack = state.heap_mut().allocate(StringRef::owned("stack".into()));
        let in_static = state.heap_mut().allocate(StringRef::owned("static".into()));
        let garbage = state.heap_mut().allocate(StringRef::owned("garbage".into()));
        state
            .current_coro_mut()
            .unwrap()
            .push_data(DataCell::for_ref(on_stack));
        let main = state.segments().find_segment("/main").unwrap();
        state
            .segments()
            .store_static(&main, counter, DataCell::for_ref(in_static))
            .unwrap();

        let stats = state.collect_garbage();
        assert_eq!(stats.freed, 1);
        assert!(state.heap().contains(on_stack));
        assert!(state.heap().contains(in_static));
        assert!(!state.heap().contains(garbage));
    }

    #[test]
    fn resolved_promises_do_not_pin_their_values() {
        let mut state = mk_state_with(&mk_loader(), mk_module(), 0);
        let value = state.heap_mut().allocate(StringRef::owned("result".into()));
        let promise = state.scheduler_mut().create_promise();
        state
            .scheduler_mut()
            .resolve_promise(promise, DataCell::for_ref(value))
            .unwrap();

        for _ in 0..3 {
            state.collect_garbage();
        }
        assert!(!state.heap().contains(value));
        assert_eq!(state.scheduler().promise_count(), 0);
    }

    #[test]
    fn futures_keep_resolved_values_alive() {
        let mut state = mk_state_with(&mk_loader(), mk_module(), 0);
        let value = state.heap_mut().allocate(StringRef::owned("result".into()));
        let promise = state.scheduler_mut().create_promise();
        let future = state.heap_mut().allocate(FutureRef::new(promise));
        state.scheduler_mut().bind_future(promise, future).unwrap();
        state
            .current_coro_mut()
            .unwrap()
            .push_data(DataCell::for_ref(future));
        state
            .scheduler_mut()
            .resolve_promise(promise, DataCell::for_ref(value))
            .unwrap();

        state.collect_garbage();
        assert!(state.heap().contains(value));
        assert_eq!(state.scheduler().promise_count(), 0);

        let (heap, scheduler) = state.split_mut();
        heap.get(future).unwrap().await_future(scheduler).unwrap();
        let coro = state.current_coro_mut().unwrap();
        assert_eq!(coro.pop_data().unwrap(), DataCell::for_ref(value));
        coro.pop_data().unwrap();

        state.collect_garbage();
        assert!(!state.heap().contains(future));
        assert!(!state.heap().contains(value));
    }

    #[test]
    fn pending_promises_of_dead_futures_are_dropped() {
        let mut state = mk_state_with(&mk_loader(), mk_module(), 0);
        let promise = state.scheduler_mut().create_promise();
        let future = state.heap_mut().allocate(FutureRef::new(promise));
        state.scheduler_mut().bind_future(promise, future).unwrap();
        let raw = state.scheduler_mut().create_promise();

        state.collect_garbage();
        assert!(!state.heap().contains(future));
        assert_eq!(state.scheduler().promise_count(), 1);
        assert!(state.scheduler_mut().resolve_promise(raw, DataCell::Nil).is_ok());
    }

    #[test]
    fn main_arguments_are_rooted_strings() {
        let loader = mk_loader();
        let mut m = mk_module();
        add_entry(&mut m, ProcHeader::new(0, 0), BytecodeBuilder::new());
        loader.insert_object("/main", &m.into_object());
        let options = InterpreterStateOptions {
            loader: Some(loader.clone()),
            main_arguments: vec!["first".into(), "second".into()],
            ..Default::default()
        };
        let mut state = InterpreterState::create(options, "/main").unwrap();
        assert_eq!(state.num_main_arguments(), 2);
        assert!(state.main_argument(2).is_none());

        state.collect_garbage();
        let second = state.main_argument(1).unwrap().as_ref_handle().unwrap();
        assert_eq!(state.heap().get(second).unwrap().utf8_value(), Some("second"));
    }

    #[test]
    fn object_vtables_resolve_from_the_prelude() {
        let state = mk_state_with(&mk_loader(), mk_module(), 0);
        let (prelude, symbol) = state.segments().find_symbol(PRELUDE_LOCATION, "Object").unwrap();
        let object = Descriptor::new(DescriptorKind::Class, prelude.index(), symbol.index);
        let vtable = state.segments().get_virtual_table(&object).unwrap();
        let instance = InstanceRef::new(vtable);
        assert_eq!(instance.get_virtual_table().unwrap().descriptor(), object);
    }
}
