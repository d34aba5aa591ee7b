use crate::{
    BytecodeCursor, CALL_FORWARD_REST, CallCell, DataCell, DescriptorKind, InterpreterCondition,
    InterpreterState, InterpreterStatus, ProcHeader, RefHandle, Result, TrapContext,
    subroutine::{import_lexicals, process_arguments},
};

fn no_coroutine() -> InterpreterStatus {
    InterpreterStatus::invariant("no current coroutine")
}

/// Allocates an object of `receiver` (a class, enum, instance or struct
/// descriptor) and enters its constructor.
///
/// The top `placement` cells are the constructor arguments; with
/// [`CALL_FORWARD_REST`] the caller's rest arguments follow them. Every
/// check runs before the coroutine is touched. Only once the frame is
/// ready are the arguments popped and the new ref pushed, so the
/// constructor finds it right below its own guard.
pub fn construct_new(
    state: &mut InterpreterState,
    receiver: DataCell,
    placement: u16,
    call_flags: u8,
) -> Result<RefHandle> {
    let coro = state.current_coro().ok_or_else(no_coroutine)?;
    let mut args = coro.peek_data_n(placement as usize)?.to_vec();
    if call_flags & CALL_FORWARD_REST != 0 {
        args.extend_from_slice(coro.peek_call()?.rest());
    }

    let descriptor = match receiver {
        DataCell::Descriptor(d)
            if matches!(
                d.kind,
                DescriptorKind::Class
                    | DescriptorKind::Enum
                    | DescriptorKind::Instance
                    | DescriptorKind::Struct
            ) =>
        {
            d
        }
        other => {
            return Err(InterpreterStatus::for_condition(
                InterpreterCondition::InvalidReceiver,
                format!("invalid receiver {other}"),
            ));
        }
    };

    let segments = state.segments();
    let vtable = segments.get_virtual_table(&descriptor)?;
    let allocator = vtable
        .find_allocator()
        .ok_or_else(|| InterpreterStatus::invariant("missing allocator"))?;

    let mut context = TrapContext::for_allocation(state, vtable.clone());
    allocator(&mut context)?;
    let handle = context
        .allocation
        .as_ref()
        .and_then(DataCell::as_ref_handle)
        .ok_or_else(|| {
            InterpreterStatus::for_condition(InterpreterCondition::InvalidReceiver, "invalid data cell")
        })?;

    let ctor = vtable.ctor();
    let ctor_segment = segments.get_segment(ctor.segment)?;
    let info = ProcHeader::parse(ctor_segment.bytecode(), ctor.proc_offset)?;
    process_arguments(&info.header, args.len())?;

    let mut frame = CallCell::new(
        ctor.segment,
        ctor.call_index,
        ctor.proc_offset,
        &info.header,
        args,
        false,
    )
    .with_receiver(DataCell::for_ref(handle));

    let coro = state.current_coro_mut().ok_or_else(no_coroutine)?;
    import_lexicals(&info.header, coro, ctor.segment, &mut frame)?;

    coro.pop_data_n(placement as usize)?;
    coro.push_data(DataCell::for_ref(handle));
    let frame = frame.with_stack_guard(coro.data_depth());
    coro.push_call(frame, BytecodeCursor::for_proc(&info), ctor_segment);

    log::trace!("constructing {handle} as {descriptor}");
    Ok(handle)
}
