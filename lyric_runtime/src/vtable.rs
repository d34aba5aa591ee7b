use std::{collections::HashMap, sync::Arc};

use ahash::RandomState;

use crate::{
    Address, CallMode, DataCell, DefinitionDescriptor, Descriptor, DescriptorKind,
    ExistentialDescriptor, ImplDescriptor, InterpreterStatus, LinkageSection, NativeFunc, Result,
    Segment, SegmentManager,
};

/// Where a field lives inside an instance's slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMember {
    pub segment: u32,
    pub field_index: u32,
    pub offset: u32,
}

/// A resolved method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMethod {
    pub segment: u32,
    pub call_index: u32,
    pub proc_offset: u32,
}

type DescriptorMap<V> = HashMap<Descriptor, V, RandomState>;

/// Keyed by action; the value remembers the implemented concept.
type ExtensionMap = DescriptorMap<(Descriptor, VirtualMethod)>;

/// Dispatch and layout information for one class, enum, struct or
/// instance definition.
///
/// Lookups walk the parent chain, so a table only stores what its own
/// definition declares. Member offsets start at the parent's total layout
/// size.
#[derive(Debug)]
pub struct VirtualTable {
    descriptor: Descriptor,
    type_cell: DataCell,
    parent: Option<Arc<VirtualTable>>,
    allocator: Option<NativeFunc>,
    ctor: VirtualMethod,
    members: DescriptorMap<VirtualMember>,
    methods: DescriptorMap<VirtualMethod>,
    extensions: ExtensionMap,
    layout_start: u32,
}

impl VirtualTable {
    /// Builds the table for `descriptor` from its definition in `segment`.
    /// `parent` must already be the table of the definition's super type.
    pub(crate) fn build(
        manager: &SegmentManager,
        segment: &Arc<Segment>,
        descriptor: Descriptor,
        definition: &DefinitionDescriptor,
        parent: Option<Arc<VirtualTable>>,
    ) -> Result<Self> {
        let kind = descriptor.kind.section().name();
        let layout_start = parent.as_ref().map_or(0, |p| p.layout_total());

        let mut members = DescriptorMap::default();
        for (i, &address) in definition.members.iter().enumerate() {
            let entry = manager.resolve_address(segment, LinkageSection::Field, address)?;
            members.insert(
                Descriptor::new(DescriptorKind::Field, entry.segment, entry.index),
                VirtualMember {
                    segment: entry.segment,
                    field_index: entry.index,
                    offset: layout_start + i as u32,
                },
            );
        }

        let mut methods = resolve_methods(manager, segment, &definition.methods)?;
        let extensions = resolve_impls(manager, segment, &definition.impls, &mut methods)?;

        let ctor_call = segment
            .object()
            .calls
            .get(definition.ctor as usize)
            .ok_or_else(|| InterpreterStatus::invariant(format!("missing {kind} ctor")))?;
        if ctor_call.mode != CallMode::Constructor || !ctor_call.is_bound() {
            return Err(InterpreterStatus::invariant(format!(
                "invalid {kind} ctor flags"
            )));
        }
        let ctor = VirtualMethod {
            segment: segment.index(),
            call_index: definition.ctor,
            proc_offset: ctor_call.proc_offset,
        };

        let allocator = match definition.allocator {
            Some(trap) => Some(segment.get_trap(trap).ok_or_else(|| {
                InterpreterStatus::invariant(format!("invalid {kind} allocator"))
            })?),
            None => None,
        };

        log::debug!(
            "built virtual table for {descriptor} ({}: {} members at {layout_start}, {} methods)",
            definition.name,
            members.len(),
            methods.len()
        );

        Ok(Self {
            descriptor,
            type_cell: DataCell::for_type(segment.index(), definition.type_index),
            parent,
            allocator,
            ctor,
            members,
            methods,
            extensions,
            layout_start,
        })
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn type_cell(&self) -> &DataCell {
        &self.type_cell
    }

    pub fn parent(&self) -> Option<&Arc<VirtualTable>> {
        self.parent.as_ref()
    }

    fn ancestry(&self) -> impl Iterator<Item = &VirtualTable> {
        std::iter::successors(Some(self), |table| table.parent.as_deref())
    }

    /// The allocator declared by this table or its nearest ancestor.
    pub fn find_allocator(&self) -> Option<NativeFunc> {
        self.ancestry().find_map(|table| table.allocator)
    }

    pub fn ctor(&self) -> VirtualMethod {
        self.ctor
    }

    pub fn get_member(&self, field: &Descriptor) -> Option<VirtualMember> {
        self.ancestry()
            .find_map(|table| table.members.get(field).copied())
    }

    pub fn get_method(&self, call: &Descriptor) -> Option<VirtualMethod> {
        self.ancestry()
            .find_map(|table| table.methods.get(call).copied())
    }

    /// The implementation of `action`. With a `concept`, only an
    /// implementation of that concept matches.
    pub fn get_extension(
        &self,
        concept: Option<&Descriptor>,
        action: &Descriptor,
    ) -> Option<VirtualMethod> {
        self.ancestry().find_map(|table| {
            let (implemented, method) = table.extensions.get(action)?;
            concept
                .is_none_or(|c| c == implemented)
                .then_some(*method)
        })
    }

    /// Whether `descriptor` is this table's definition or one of its
    /// ancestors.
    pub fn inherits(&self, descriptor: &Descriptor) -> bool {
        self.ancestry()
            .any(|table| &table.descriptor == descriptor)
    }

    pub fn layout_start(&self) -> u32 {
        self.layout_start
    }

    pub fn layout_total(&self) -> u32 {
        self.layout_start + self.members.len() as u32
    }
}

/// Dispatch information for one existential.
///
/// Existentials give methods and concept impls to values that carry no
/// virtual table, primitives included. Lookups walk the super existential
/// chain.
#[derive(Debug)]
pub struct ExistentialTable {
    descriptor: Descriptor,
    type_cell: DataCell,
    parent: Option<Arc<ExistentialTable>>,
    methods: DescriptorMap<VirtualMethod>,
    extensions: ExtensionMap,
}

impl ExistentialTable {
    /// `parent` must already be the table of the super existential.
    pub(crate) fn build(
        manager: &SegmentManager,
        segment: &Arc<Segment>,
        descriptor: Descriptor,
        existential: &ExistentialDescriptor,
        parent: Option<Arc<ExistentialTable>>,
    ) -> Result<Self> {
        let mut methods = resolve_methods(manager, segment, &existential.methods)?;
        let extensions = resolve_impls(manager, segment, &existential.impls, &mut methods)?;
        log::debug!(
            "built existential table for {descriptor} ({}: {} methods)",
            existential.name,
            methods.len()
        );
        Ok(Self {
            descriptor,
            type_cell: DataCell::for_type(segment.index(), existential.type_index),
            parent,
            methods,
            extensions,
        })
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn type_cell(&self) -> &DataCell {
        &self.type_cell
    }

    pub fn parent(&self) -> Option<&Arc<ExistentialTable>> {
        self.parent.as_ref()
    }

    fn ancestry(&self) -> impl Iterator<Item = &ExistentialTable> {
        std::iter::successors(Some(self), |table| table.parent.as_deref())
    }

    pub fn get_method(&self, call: &Descriptor) -> Option<VirtualMethod> {
        self.ancestry()
            .find_map(|table| table.methods.get(call).copied())
    }

    pub fn get_extension(
        &self,
        concept: Option<&Descriptor>,
        action: &Descriptor,
    ) -> Option<VirtualMethod> {
        self.ancestry().find_map(|table| {
            let (implemented, method) = table.extensions.get(action)?;
            concept
                .is_none_or(|c| c == implemented)
                .then_some(*method)
        })
    }
}

fn resolve_methods(
    manager: &SegmentManager,
    segment: &Segment,
    addresses: &[Address],
) -> Result<DescriptorMap<VirtualMethod>> {
    let mut methods = DescriptorMap::default();
    for &address in addresses {
        let (key, method) = resolve_method(manager, segment, address)?;
        methods.insert(key, method);
    }
    Ok(methods)
}

/// Resolves concept impls into extensions. Every implementing call is
/// also added to `methods`.
fn resolve_impls(
    manager: &SegmentManager,
    segment: &Segment,
    impls: &[ImplDescriptor],
    methods: &mut DescriptorMap<VirtualMethod>,
) -> Result<ExtensionMap> {
    let mut extensions = ExtensionMap::default();
    for imp in impls {
        let concept = manager.resolve_address(segment, LinkageSection::Concept, imp.concept)?;
        let concept = Descriptor::new(DescriptorKind::Concept, concept.segment, concept.index);
        for extension in &imp.extensions {
            let action = manager.resolve_address(segment, LinkageSection::Action, extension.action)?;
            let (key, method) = resolve_method(manager, segment, extension.call)?;
            extensions.insert(
                Descriptor::new(DescriptorKind::Action, action.segment, action.index),
                (concept, method),
            );
            methods.insert(key, method);
        }
    }
    Ok(extensions)
}

fn resolve_method(
    manager: &SegmentManager,
    segment: &Segment,
    address: Address,
) -> Result<(Descriptor, VirtualMethod)> {
    let entry = manager.resolve_address(segment, LinkageSection::Call, address)?;
    let target = manager.get_segment(entry.segment)?;
    let call = target
        .object()
        .calls
        .get(entry.index as usize)
        .ok_or_else(|| InterpreterStatus::invariant("missing call"))?;
    Ok((
        Descriptor::new(DescriptorKind::Call, entry.segment, entry.index),
        VirtualMethod {
            segment: entry.segment,
            call_index: entry.index,
            proc_offset: call.proc_offset,
        },
    ))
}
