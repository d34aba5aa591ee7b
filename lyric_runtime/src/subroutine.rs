//! Frame setup and teardown for every kind of call.
//!
//! Each entry point validates and builds the new frame completely before
//! touching the coroutine, so a failed call leaves it unchanged.

use std::sync::Arc;

use crate::{
    Address, BytecodeCursor, CallCell, CallMode, DataCell, Descriptor, DescriptorKind,
    HeapManager, InterpreterCondition, InterpreterStatus, LEXICAL_ARGUMENT, LEXICAL_LOCAL,
    LinkageSection, ProcHeader, Result, Segment, SegmentManager, StackfulCoroutine, VirtualMethod,
    VirtualTable,
};

/// Checks an argument count against a proc's declared arity.
pub(crate) fn process_arguments(header: &ProcHeader, num_args: usize) -> Result<()> {
    if num_args > u16::MAX as usize {
        return Err(InterpreterStatus::invariant("too many arguments"));
    }
    if num_args < header.num_arguments as usize {
        return Err(InterpreterStatus::invariant("not enough arguments"));
    }
    Ok(())
}

/// Copies every lexical the proc captures out of the closest live frame
/// of the activation that owns it.
pub(crate) fn import_lexicals(
    header: &ProcHeader,
    coro: &StackfulCoroutine,
    segment: u32,
    frame: &mut CallCell,
) -> Result<()> {
    for (i, lexical) in header.lexicals.iter().enumerate() {
        let owner = coro
            .calls()
            .find(|call| {
                call.call_segment() == segment && call.call_index() == lexical.activation_call
            })
            .ok_or_else(|| InterpreterStatus::invariant("missing lexical"))?;
        let value = match lexical.target {
            LEXICAL_ARGUMENT => owner.get_argument(lexical.target_offset),
            LEXICAL_LOCAL => owner.get_local(lexical.target_offset),
            _ => {
                return Err(InterpreterStatus::invariant(format!(
                    "invalid lexical target at offset {i}"
                )));
            }
        }
        .cloned()
        .ok_or_else(|| InterpreterStatus::invariant(format!("invalid lexical offset at {i}")))?;
        frame.set_lexical(i as u32, value);
    }
    Ok(())
}

/// Enters `method` with `args` on `coro`. The new frame owns every data
/// stack cell pushed after this point.
pub fn call_proc(
    segments: &SegmentManager,
    coro: &mut StackfulCoroutine,
    method: VirtualMethod,
    args: Vec<DataCell>,
    receiver: DataCell,
) -> Result<()> {
    let segment = segments.get_segment(method.segment)?;
    enter_proc(&segment, coro, method, args, receiver)
}

fn enter_proc(
    segment: &Arc<Segment>,
    coro: &mut StackfulCoroutine,
    method: VirtualMethod,
    args: Vec<DataCell>,
    receiver: DataCell,
) -> Result<()> {
    let info = ProcHeader::parse(segment.bytecode(), method.proc_offset)?;
    process_arguments(&info.header, args.len())?;

    let mut frame = CallCell::new(
        method.segment,
        method.call_index,
        method.proc_offset,
        &info.header,
        args,
        true,
    )
    .with_receiver(receiver)
    .with_stack_guard(coro.data_depth());
    import_lexicals(&info.header, coro, method.segment, &mut frame)?;

    coro.push_call(frame, BytecodeCursor::for_proc(&info), segment.clone());
    Ok(())
}

fn current_segment(coro: &StackfulCoroutine) -> Result<Arc<Segment>> {
    coro.segment()
        .cloned()
        .ok_or_else(|| InterpreterStatus::invariant("no current segment"))
}

/// Resolves a call operand of the current segment to a method.
fn resolve_call(
    segments: &SegmentManager,
    coro: &StackfulCoroutine,
    address: u32,
) -> Result<(Arc<Segment>, Descriptor, VirtualMethod, CallMode, bool)> {
    let segment = current_segment(coro)?;
    let entry = segments.resolve_address(&segment, LinkageSection::Call, Address::decode(address))?;
    let target = segments.get_segment(entry.segment)?;
    let call = target
        .object()
        .calls
        .get(entry.index as usize)
        .ok_or_else(|| InterpreterStatus::invariant("missing call"))?;
    let method = VirtualMethod {
        segment: entry.segment,
        call_index: entry.index,
        proc_offset: call.proc_offset,
    };
    let (mode, bound) = (call.mode, call.is_bound());
    Ok((
        target,
        Descriptor::new(DescriptorKind::Call, entry.segment, entry.index),
        method,
        mode,
        bound,
    ))
}

/// Calls a free function.
pub fn call_static(
    segments: &SegmentManager,
    coro: &mut StackfulCoroutine,
    address: u32,
    args: Vec<DataCell>,
) -> Result<()> {
    let (target, _, method, mode, bound) = resolve_call(segments, coro, address)?;
    if mode == CallMode::Constructor || bound {
        return Err(InterpreterStatus::invariant("invalid call flags"));
    }
    enter_proc(&target, coro, method, args, DataCell::Invalid)
}

fn receiver_table(heap: &HeapManager, receiver: &DataCell) -> Result<Arc<VirtualTable>> {
    let handle = receiver.as_ref_handle().ok_or_else(|| {
        InterpreterStatus::for_condition(
            InterpreterCondition::InvalidReceiver,
            format!("invalid receiver {receiver}"),
        )
    })?;
    heap.get(handle)
        .and_then(|object| object.get_virtual_table().cloned())
        .ok_or_else(|| {
            InterpreterStatus::for_condition(
                InterpreterCondition::InvalidReceiver,
                format!("cannot resolve method; invalid receiver {receiver}"),
            )
        })
}

/// Calls a method through the receiver's virtual table.
pub fn call_virtual(
    segments: &SegmentManager,
    heap: &HeapManager,
    coro: &mut StackfulCoroutine,
    receiver: DataCell,
    address: u32,
    args: Vec<DataCell>,
) -> Result<()> {
    let vtable = receiver_table(heap, &receiver)?;
    let (_, call, _, _, _) = resolve_call(segments, coro, address)?;
    let method = vtable
        .get_method(&call)
        .ok_or_else(|| InterpreterStatus::invariant(format!("missing virtual method {call}")))?;
    call_proc(segments, coro, method, args, receiver)
}

/// Calls the receiver's implementation of an action. With a `concept`,
/// only that concept's implementation is considered.
pub fn call_action(
    segments: &SegmentManager,
    heap: &HeapManager,
    coro: &mut StackfulCoroutine,
    receiver: DataCell,
    concept: Option<Descriptor>,
    address: u32,
    args: Vec<DataCell>,
) -> Result<()> {
    let vtable = receiver_table(heap, &receiver)?;
    let segment = current_segment(coro)?;
    let entry =
        segments.resolve_address(&segment, LinkageSection::Action, Address::decode(address))?;
    let action = Descriptor::new(DescriptorKind::Action, entry.segment, entry.index);
    let method = vtable
        .get_extension(concept.as_ref(), &action)
        .ok_or_else(|| {
            InterpreterStatus::invariant(format!("missing extension method {action}"))
        })?;
    call_proc(segments, coro, method, args, receiver)
}

/// Calls an action through an explicitly named concept.
pub fn call_extension(
    segments: &SegmentManager,
    heap: &HeapManager,
    coro: &mut StackfulCoroutine,
    receiver: DataCell,
    concept: Descriptor,
    address: u32,
    args: Vec<DataCell>,
) -> Result<()> {
    if concept.kind != DescriptorKind::Concept {
        return Err(InterpreterStatus::for_condition(
            InterpreterCondition::InvalidDataStackV1,
            "invalid descriptor for concept call",
        ));
    }
    call_action(segments, heap, coro, receiver, Some(concept), address, args)
}

/// Calls a method of an existential. Any value can be the receiver, so
/// primitives dispatch here instead of through a virtual table.
pub fn call_existential(
    segments: &SegmentManager,
    coro: &mut StackfulCoroutine,
    receiver: DataCell,
    existential: Descriptor,
    address: u32,
    args: Vec<DataCell>,
) -> Result<()> {
    if existential.kind != DescriptorKind::Existential {
        return Err(InterpreterStatus::for_condition(
            InterpreterCondition::InvalidDataStackV1,
            "invalid descriptor for existential call",
        ));
    }
    let etable = segments.get_existential_table(&existential)?;
    let (_, call, _, _, _) = resolve_call(segments, coro, address)?;
    let method = etable.get_method(&call).ok_or_else(|| {
        InterpreterStatus::invariant(format!("missing existential method {call}"))
    })?;
    call_proc(segments, coro, method, args, receiver)
}

/// Enters the initializer of a static.
pub fn init_static(
    segments: &SegmentManager,
    coro: &mut StackfulCoroutine,
    address: u32,
) -> Result<()> {
    let segment = current_segment(coro)?;
    let entry = segments.resolve_address(&segment, LinkageSection::Static, Address::decode(address))?;
    let target = segments.get_segment(entry.segment)?;
    let object = target.object();
    let descriptor = object
        .statics
        .get(entry.index as usize)
        .ok_or_else(|| InterpreterStatus::invariant("missing static symbol"))?;
    let init = descriptor
        .initializer
        .ok_or_else(|| InterpreterStatus::invariant("invalid static init"))?;
    let call = object
        .calls
        .get(init as usize)
        .ok_or_else(|| InterpreterStatus::invariant("missing call"))?;
    let method = VirtualMethod {
        segment: target.index(),
        call_index: init,
        proc_offset: call.proc_offset,
    };
    log::trace!("initializing static {} of {}", descriptor.name, target.location());
    enter_proc(&target, coro, method, Vec::new(), DataCell::Invalid)
}

/// Pops the current frame and continues in the caller. The data stack is
/// cut back to the frame's guard, keeping the top cell if the frame
/// returns a value. Returns false when the popped frame had no caller.
pub fn return_to_caller(coro: &mut StackfulCoroutine) -> Result<bool> {
    let mut frame = coro
        .pop_call()
        .ok_or_else(|| InterpreterStatus::invariant("call stack is empty"))?;
    let (segment, cursor) = frame.take_return();
    let has_caller = segment.is_some();
    coro.transfer_control(segment, cursor);
    coro.unwind_data(frame.stack_guard(), frame.returns_value());
    Ok(has_caller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mk_loader, mk_module};
    use crate::{BytecodeBuilder, CallDescriptor, DeclFlags, StaticDescriptor};

    struct Fixture {
        segments: SegmentManager,
        main: Arc<Segment>,
    }

    /// `add(a, b)` at call 0, a bound method at call 1 and a static with
    /// an initializer at call 2.
    fn mk_fixture() -> Fixture {
        let loader = mk_loader();
        let mut m = mk_module();
        let mut add = BytecodeBuilder::new();
        add.load(crate::LOAD_ARGUMENT, 0);
        add.load(crate::LOAD_ARGUMENT, 1);
        add.op(crate::Op::I64Add);
        add.return_();
        let proc_offset = m.add_proc(&ProcHeader::new(2, 0), add);
        m.add_call(CallDescriptor {
            name: "add".into(),
            flags: DeclFlags::empty(),
            mode: CallMode::Normal,
            receiver: None,
            proc_offset,
        });
        m.add_call(CallDescriptor {
            name: "method".into(),
            flags: DeclFlags::BOUND,
            mode: CallMode::Normal,
            receiver: None,
            proc_offset,
        });
        let init_offset = m.add_proc(&ProcHeader::new(0, 0), BytecodeBuilder::new());
        let init = m.add_call(CallDescriptor {
            name: "counter.$init".into(),
            flags: DeclFlags::empty(),
            mode: CallMode::Normal,
            receiver: None,
            proc_offset: init_offset,
        });
        m.add_static(StaticDescriptor {
            name: "counter".into(),
            flags: DeclFlags::empty(),
            type_index: 0,
            initializer: Some(init),
        });
        m.add_static(StaticDescriptor {
            name: "plain".into(),
            flags: DeclFlags::empty(),
            type_index: 0,
            initializer: None,
        });
        loader.insert_object("/main", &m.into_object());

        let segments = SegmentManager::new(loader);
        let main = segments.load_assembly("/main").unwrap();
        Fixture { segments, main }
    }

    fn mk_coro(fixture: &Fixture) -> StackfulCoroutine {
        let mut coro = StackfulCoroutine::new();
        let call = &fixture.main.object().calls[0];
        let method = VirtualMethod {
            segment: fixture.main.index(),
            call_index: 0,
            proc_offset: call.proc_offset,
        };
        let args = vec![DataCell::for_i64(1), DataCell::for_i64(2)];
        call_proc(&fixture.segments, &mut coro, method, args, DataCell::Invalid).unwrap();
        coro
    }

    #[test]
    fn static_calls_push_a_frame() {
        let fixture = mk_fixture();
        let mut coro = mk_coro(&fixture);
        coro.push_data(DataCell::Nil);

        let args = vec![DataCell::for_i64(3), DataCell::for_i64(4), DataCell::Nil];
        call_static(&fixture.segments, &mut coro, 0, args).unwrap();
        assert_eq!(coro.call_depth(), 2);
        let frame = coro.peek_call().unwrap();
        assert_eq!(frame.stack_guard(), 1);
        assert_eq!(frame.rest(), &[DataCell::Nil]);
    }

    #[test]
    fn arity_is_checked_before_pushing() {
        let fixture = mk_fixture();
        let mut coro = mk_coro(&fixture);
        let err = call_static(&fixture.segments, &mut coro, 0, vec![DataCell::Nil]).unwrap_err();
        assert_eq!(err.message, "not enough arguments");

        let too_many = vec![DataCell::Nil; u16::MAX as usize + 1];
        let err = call_static(&fixture.segments, &mut coro, 0, too_many).unwrap_err();
        assert_eq!(err.message, "too many arguments");
        assert_eq!(coro.call_depth(), 1);

        let most = vec![DataCell::Nil; u16::MAX as usize];
        call_static(&fixture.segments, &mut coro, 0, most).unwrap();
        assert_eq!(coro.call_depth(), 2);
        assert_eq!(coro.peek_call().unwrap().num_rest(), u16::MAX as usize - 2);
    }

    #[test]
    fn bound_calls_are_not_static() {
        let fixture = mk_fixture();
        let mut coro = mk_coro(&fixture);
        let err = call_static(&fixture.segments, &mut coro, 1, vec![]).unwrap_err();
        assert_eq!(err.message, "invalid call flags");
        let err = call_static(&fixture.segments, &mut coro, 9, vec![]).unwrap_err();
        assert_eq!(err.message, "invalid call address 9");
    }

    #[test]
    fn statics_need_an_initializer() {
        let fixture = mk_fixture();
        let mut coro = mk_coro(&fixture);
        init_static(&fixture.segments, &mut coro, 0).unwrap();
        assert_eq!(coro.call_depth(), 2);
        let err = init_static(&fixture.segments, &mut coro, 1).unwrap_err();
        assert_eq!(err.message, "invalid static init");
    }

    #[test]
    fn returning_unwinds_to_the_guard() {
        let fixture = mk_fixture();
        let mut coro = mk_coro(&fixture);
        coro.push_data(DataCell::for_i64(10));
        call_static(&fixture.segments, &mut coro, 0, vec![DataCell::Nil, DataCell::Nil]).unwrap();
        coro.push_data(DataCell::for_i64(11));
        coro.push_data(DataCell::for_i64(12));

        assert!(return_to_caller(&mut coro).unwrap());
        assert_eq!(coro.data(), &[DataCell::I64(10), DataCell::I64(12)]);
        assert!(!return_to_caller(&mut coro).unwrap());
        assert!(coro.segment().is_none());
        assert_eq!(
            return_to_caller(&mut coro).unwrap_err().message,
            "call stack is empty"
        );
    }

    #[test]
    fn lexicals_come_from_the_closest_activation() {
        let fixture = mk_fixture();
        let coro = mk_coro(&fixture);
        let segment = fixture.main.index();

        let header = ProcHeader::new(0, 0).with_lexical(0, LEXICAL_ARGUMENT, 1);
        let mut frame = CallCell::new(segment, 5, 0, &header, vec![], true);
        import_lexicals(&header, &coro, segment, &mut frame).unwrap();
        assert_eq!(frame.get_lexical(0), Some(&DataCell::I64(2)));

        let header = ProcHeader::new(0, 0).with_lexical(7, LEXICAL_LOCAL, 0);
        let err = import_lexicals(&header, &coro, segment, &mut frame).unwrap_err();
        assert_eq!(err.message, "missing lexical");

        let header = ProcHeader::new(0, 0).with_lexical(0, 5, 0);
        let err = import_lexicals(&header, &coro, segment, &mut frame).unwrap_err();
        assert_eq!(err.message, "invalid lexical target at offset 0");
    }
}
