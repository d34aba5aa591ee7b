//! The bootstrap assembly every program imports with `SYSTEM_BOOTSTRAP`.

use crate::{
    Address, BytecodeBuilder, CORE_PLUGIN_LOCATION, CallDescriptor, CallMode, CoreTrap, DeclFlags,
    DefinitionDescriptor, ExistentialDescriptor, IntrinsicType, LinkageSection, ModuleBuilder,
    ObjectFile, ProcHeader, TypeDef,
};

pub const PRELUDE_LOCATION: &str = "/prelude";

const INTRINSICS: [(IntrinsicType, &str); IntrinsicType::COUNT] = [
    (IntrinsicType::Nil, "Nil"),
    (IntrinsicType::Bool, "Bool"),
    (IntrinsicType::Int, "Int"),
    (IntrinsicType::Float, "Float"),
    (IntrinsicType::Char, "Char"),
    (IntrinsicType::String, "Utf8"),
    (IntrinsicType::Class, "Class"),
    (IntrinsicType::Enum, "Enum"),
    (IntrinsicType::Struct, "Struct"),
    (IntrinsicType::Instance, "Instance"),
    (IntrinsicType::Concept, "Concept"),
    (IntrinsicType::Call, "Call"),
    (IntrinsicType::Action, "Action"),
    (IntrinsicType::Field, "Field"),
    (IntrinsicType::Existential, "Existential"),
    (IntrinsicType::Namespace, "Namespace"),
    (IntrinsicType::Static, "Static"),
];

fn add_ctor(module: &mut ModuleBuilder, name: &str) -> u32 {
    let proc_offset = module.add_proc(&ProcHeader::new(0, 0), BytecodeBuilder::new());
    module.add_call(CallDescriptor {
        name: name.to_owned(),
        flags: DeclFlags::BOUND,
        mode: CallMode::Constructor,
        receiver: None,
        proc_offset,
    })
}

fn add_prelude_class(
    module: &mut ModuleBuilder,
    name: &str,
    super_type: Option<u32>,
    allocator: CoreTrap,
) -> u32 {
    let index = module.object_mut().classes.len() as u32;
    let parent_type = super_type.map(|parent| module.object_mut().classes[parent as usize].type_index);
    let type_index = module.add_type(
        TypeDef::Concrete {
            section: LinkageSection::Class,
            address: Address::Near(index),
        },
        parent_type,
    );
    let ctor = add_ctor(module, &format!("{name}.$ctor"));
    let class = module.add_class(DefinitionDescriptor {
        name: name.to_owned(),
        flags: DeclFlags::empty(),
        super_type: super_type.map(Address::Near),
        type_index,
        allocator: Some(allocator.index()),
        ctor,
        members: Vec::new(),
        methods: Vec::new(),
        impls: Vec::new(),
        sealed_subtypes: Vec::new(),
    });
    module.add_symbol(name, LinkageSection::Class, class);
    class
}

/// Assembles the prelude: one existential per intrinsic type, the `Object`
/// root class and `String`.
pub fn build_prelude() -> ObjectFile {
    let mut module = ModuleBuilder::new();
    module.add_plugin(CORE_PLUGIN_LOCATION);

    for (intrinsic, name) in INTRINSICS {
        let index = module.object_mut().existentials.len() as u32;
        let type_index = module.add_type(
            TypeDef::Concrete {
                section: LinkageSection::Existential,
                address: Address::Near(index),
            },
            None,
        );
        let path = format!("Intrinsic.{name}");
        let existential = module.add_existential(ExistentialDescriptor {
            name: path.clone(),
            flags: DeclFlags::empty(),
            super_existential: None,
            intrinsic: Some(intrinsic),
            type_index,
            methods: Vec::new(),
            impls: Vec::new(),
        });
        module.add_symbol(&path, LinkageSection::Existential, existential);
    }

    let object = add_prelude_class(&mut module, "Object", None, CoreTrap::AllocObject);
    add_prelude_class(&mut module, "String", Some(object), CoreTrap::AllocString);

    module.into_object()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_intrinsic_has_one_existential() {
        let prelude = build_prelude();
        for (intrinsic, name) in INTRINSICS {
            let symbol = prelude.find_symbol(&format!("Intrinsic.{name}")).unwrap();
            assert_eq!(symbol.section, LinkageSection::Existential);
            let existential = &prelude.existentials[symbol.index as usize];
            assert_eq!(existential.intrinsic, Some(intrinsic));
        }
        assert_eq!(prelude.existentials.len(), IntrinsicType::COUNT);
    }

    #[test]
    fn string_is_an_object() {
        let prelude = build_prelude();
        let object = prelude.find_symbol("Object").unwrap().index;
        let string = prelude.find_symbol("String").unwrap().index;
        let string = &prelude.classes[string as usize];
        assert_eq!(string.super_type, Some(Address::Near(object)));
        assert_eq!(string.allocator, Some(CoreTrap::AllocString.index()));
        assert!(prelude.calls[string.ctor as usize].is_bound());

        let string_type = &prelude.types[string.type_index as usize];
        assert_eq!(
            string_type.super_type,
            Some(prelude.classes[object as usize].type_index)
        );
    }

    #[test]
    fn prelude_survives_encoding() {
        let prelude = build_prelude();
        assert_eq!(ObjectFile::parse(&prelude.to_bytes()).unwrap(), prelude);
        assert_eq!(prelude.plugins[0].location, CORE_PLUGIN_LOCATION);
    }
}
