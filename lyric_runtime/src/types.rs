use crate::{
    DataCell, DescriptorKind, HeapManager, IntrinsicType, InterpreterCondition, InterpreterStatus,
    LinkEntry, LinkageSection, Result, Segment, SegmentManager, TypeDef,
};

/// How `lhs` relates to `rhs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeComparison {
    Equal,
    /// `rhs` is an ancestor of `lhs`.
    Extends,
    /// `lhs` is an ancestor of `rhs`.
    Super,
    Disjoint,
}

impl TypeComparison {
    /// The value TYPE_CMP pushes.
    pub fn as_i64(self) -> i64 {
        match self {
            TypeComparison::Extends => -1,
            TypeComparison::Equal => 0,
            TypeComparison::Super => 1,
            TypeComparison::Disjoint => 2,
        }
    }
}

/// Maps intrinsic types to the type cells the bootstrap assembly
/// declares for them, and answers type queries.
#[derive(Debug)]
pub struct TypeManager {
    intrinsics: Vec<Option<DataCell>>,
}

impl TypeManager {
    pub fn new(bootstrap: &Segment) -> Result<Self> {
        let mut intrinsics = vec![None; IntrinsicType::COUNT];
        for existential in &bootstrap.object().existentials {
            let Some(intrinsic) = existential.intrinsic else {
                continue;
            };
            let slot = &mut intrinsics[intrinsic as usize];
            if slot.is_some() {
                return Err(InterpreterStatus::invariant(format!(
                    "duplicate intrinsic type {intrinsic:?}"
                )));
            }
            *slot = Some(DataCell::for_type(bootstrap.index(), existential.type_index));
        }
        log::debug!(
            "registered {} intrinsic types from {}",
            intrinsics.iter().flatten().count(),
            bootstrap.location()
        );
        Ok(Self { intrinsics })
    }

    pub fn get_intrinsic(&self, intrinsic: IntrinsicType) -> Option<&DataCell> {
        self.intrinsics[intrinsic as usize].as_ref()
    }

    fn intrinsic(&self, intrinsic: IntrinsicType) -> Result<DataCell> {
        self.get_intrinsic(intrinsic).cloned().ok_or_else(|| {
            InterpreterStatus::invariant(format!("missing intrinsic type {intrinsic:?}"))
        })
    }

    pub fn type_of(&self, cell: &DataCell, heap: &HeapManager) -> Result<DataCell> {
        let intrinsic = match cell {
            DataCell::Nil => IntrinsicType::Nil,
            DataCell::Bool(_) => IntrinsicType::Bool,
            DataCell::I64(_) => IntrinsicType::Int,
            DataCell::Dbl(_) => IntrinsicType::Float,
            DataCell::Char32(_) => IntrinsicType::Char,
            DataCell::Utf8Literal(_) => IntrinsicType::String,
            DataCell::Descriptor(descriptor) => match descriptor.kind {
                DescriptorKind::Action => IntrinsicType::Action,
                DescriptorKind::Call => IntrinsicType::Call,
                DescriptorKind::Class => IntrinsicType::Class,
                DescriptorKind::Concept => IntrinsicType::Concept,
                DescriptorKind::Enum => IntrinsicType::Enum,
                DescriptorKind::Existential => IntrinsicType::Existential,
                DescriptorKind::Field => IntrinsicType::Field,
                DescriptorKind::Instance => IntrinsicType::Instance,
                DescriptorKind::Namespace => IntrinsicType::Namespace,
                DescriptorKind::Static => IntrinsicType::Static,
                DescriptorKind::Struct => IntrinsicType::Struct,
            },
            DataCell::Ref(handle) => {
                let object = heap.get(*handle).ok_or_else(|| {
                    InterpreterStatus::invariant(format!("dangling reference {handle}"))
                })?;
                if let Some(vtable) = object.get_virtual_table() {
                    return Ok(vtable.type_cell().clone());
                }
                if object.utf8_value().is_none() {
                    return Err(InterpreterStatus::invariant(format!(
                        "{handle} has no type"
                    )));
                }
                IntrinsicType::String
            }
            DataCell::Invalid | DataCell::Undef | DataCell::Type { .. } => {
                return Err(InterpreterStatus::for_condition(
                    InterpreterCondition::InvalidDataStackV1,
                    format!("cannot determine the type of {}", cell.type_name()),
                ));
            }
        };
        self.intrinsic(intrinsic)
    }

    pub fn compare_types(
        &self,
        segments: &SegmentManager,
        lhs: &DataCell,
        rhs: &DataCell,
    ) -> Result<TypeComparison> {
        let lhs = ancestry(segments, lhs)?;
        let rhs = ancestry(segments, rhs)?;
        Ok(if lhs[0] == rhs[0] {
            TypeComparison::Equal
        } else if lhs.contains(&rhs[0]) {
            TypeComparison::Extends
        } else if rhs.contains(&lhs[0]) {
            TypeComparison::Super
        } else {
            TypeComparison::Disjoint
        })
    }
}

/// The concrete descriptor a type cell names, followed by its ancestors.
fn ancestry(segments: &SegmentManager, cell: &DataCell) -> Result<Vec<LinkEntry>> {
    let DataCell::Type { segment, index } = *cell else {
        return Err(InterpreterStatus::for_condition(
            InterpreterCondition::InvalidDataStackV1,
            format!("expected a type, got {}", cell.type_name()),
        ));
    };
    let owner = segments.get_segment(segment)?;
    let descriptor = owner
        .object()
        .types
        .get(index as usize)
        .ok_or_else(|| InterpreterStatus::invariant(format!("missing type {index}")))?;
    let (section, address) = match &descriptor.def {
        TypeDef::Concrete { section, address } => (*section, *address),
        TypeDef::Placeholder { .. } => {
            return Err(InterpreterStatus::invariant("cannot compare placeholder types"));
        }
    };

    let mut chain = vec![segments.resolve_address(&owner, section, address)?];
    loop {
        let Some(last) = chain.last().copied() else {
            break;
        };
        let Some(parent) = super_of(segments, last)? else {
            break;
        };
        if chain.contains(&parent) {
            return Err(InterpreterStatus::invariant("cyclic inheritance detected"));
        }
        chain.push(parent);
    }

    if chain.len() == 1 {
        if let Some(super_type) = descriptor.super_type {
            chain.extend(ancestry(segments, &DataCell::for_type(segment, super_type))?);
        }
    }
    Ok(chain)
}

fn super_of(segments: &SegmentManager, entry: LinkEntry) -> Result<Option<LinkEntry>> {
    let segment = segments.get_segment(entry.segment)?;
    let object = segment.object();
    let address = match entry.section {
        LinkageSection::Concept => object
            .concepts
            .get(entry.index as usize)
            .and_then(|concept| concept.super_concept),
        section => object
            .definitions(section)
            .and_then(|definitions| definitions.get(entry.index as usize))
            .and_then(|definition| definition.super_type),
    };
    address
        .map(|address| segments.resolve_address(&segment, entry.section, address))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mk_class, mk_ctor, mk_loader, mk_module};
    use crate::{Address, PRELUDE_LOCATION, StringRef};

    fn mk_types() -> (SegmentManager, TypeManager) {
        let loader = mk_loader();
        let mut m = mk_module();
        let ctor = mk_ctor(&mut m, "Shape.$ctor");
        let shape_type = m.add_type(
            TypeDef::Concrete {
                section: LinkageSection::Class,
                address: Address::Near(0),
            },
            None,
        );
        let circle_type = m.add_type(
            TypeDef::Concrete {
                section: LinkageSection::Class,
                address: Address::Near(1),
            },
            None,
        );
        let mut shape = mk_class("Shape", ctor);
        shape.type_index = shape_type;
        m.add_class(shape);
        let mut circle = mk_class("Circle", ctor);
        circle.type_index = circle_type;
        circle.super_type = Some(Address::Near(0));
        m.add_class(circle);
        loader.insert_object("/shapes", &m.into_object());

        let manager = SegmentManager::new(loader);
        let prelude = manager.load_assembly(PRELUDE_LOCATION).unwrap();
        let types = TypeManager::new(&prelude).unwrap();
        (manager, types)
    }

    #[test]
    fn primitives_map_to_intrinsics() {
        let (_, types) = mk_types();
        let mut heap = HeapManager::default();
        let int = types.type_of(&DataCell::for_i64(1), &heap).unwrap();
        assert_eq!(Some(&int), types.get_intrinsic(IntrinsicType::Int));

        let string = heap.allocate(StringRef::owned("s".into()));
        assert_eq!(
            types.type_of(&DataCell::for_ref(string), &heap).unwrap(),
            types.type_of(&DataCell::Utf8Literal("lit".into()), &heap).unwrap()
        );
        assert!(types.type_of(&DataCell::Invalid, &heap).is_err());
    }

    #[test]
    fn subclasses_extend_their_parents() {
        let (manager, types) = mk_types();
        let shapes = manager.load_assembly("/shapes").unwrap();
        let shape = DataCell::for_type(shapes.index(), 0);
        let circle = DataCell::for_type(shapes.index(), 1);
        let int = types.get_intrinsic(IntrinsicType::Int).unwrap().clone();

        assert_eq!(
            types.compare_types(&manager, &circle, &shape).unwrap(),
            TypeComparison::Extends
        );
        assert_eq!(
            types.compare_types(&manager, &shape, &circle).unwrap(),
            TypeComparison::Super
        );
        assert_eq!(
            types.compare_types(&manager, &shape, &shape).unwrap(),
            TypeComparison::Equal
        );
        assert_eq!(
            types.compare_types(&manager, &shape, &int).unwrap(),
            TypeComparison::Disjoint
        );
    }
}
