use super::reader::{
    LITERAL_BOOL, LITERAL_CHAR, LITERAL_DBL, LITERAL_I64, LITERAL_NIL, LITERAL_UTF8,
    NO_INTRINSIC, TYPE_CONCRETE, TYPE_PLACEHOLDER,
};
use super::*;
use crate::{BytecodeBuilder, LiteralCell, ProcHeader};

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn optional_u32(&mut self, v: Option<u32>) {
        self.u32(v.unwrap_or(INVALID_ADDRESS_U32));
    }

    fn address(&mut self, a: Address) {
        self.u32(a.encode());
    }

    fn optional_address(&mut self, a: Option<Address>) {
        self.optional_u32(a.map(Address::encode));
    }

    fn addresses(&mut self, addresses: &[Address]) {
        self.u32(addresses.len() as u32);
        for a in addresses {
            self.address(*a);
        }
    }

    fn seq<T>(&mut self, items: &[T], mut write: impl FnMut(&mut Self, &T)) {
        self.u32(items.len() as u32);
        for item in items {
            write(self, item);
        }
    }

    fn definition(&mut self, d: &DefinitionDescriptor) {
        self.string(&d.name);
        self.u16(d.flags.bits());
        self.optional_address(d.super_type);
        self.u32(d.type_index);
        self.optional_u32(d.allocator);
        self.u32(d.ctor);
        self.addresses(&d.members);
        self.addresses(&d.methods);
        self.impls(&d.impls);
        self.addresses(&d.sealed_subtypes);
    }

    fn impls(&mut self, impls: &[ImplDescriptor]) {
        self.seq(impls, |w, i| {
            w.address(i.concept);
            w.seq(&i.extensions, |w, e| {
                w.address(e.action);
                w.address(e.call);
            });
        });
    }
}

impl ObjectFile {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter { buf: Vec::new() };
        w.buf.extend_from_slice(&MAGIC);
        w.u16(MAJOR_VERSION);
        w.u16(self.minor_version);

        w.seq(&self.imports, |w, i| {
            w.string(&i.location);
            w.u8(i.flags.bits());
        });
        w.seq(&self.plugins, |w, p| w.string(&p.location));
        w.seq(&self.literals, |w, l| match l {
            // invalid literals are never written, they decode as nil
            LiteralCell::Invalid | LiteralCell::Nil => w.u8(LITERAL_NIL),
            LiteralCell::Bool(b) => {
                w.u8(LITERAL_BOOL);
                w.u8(*b as u8);
            }
            LiteralCell::I64(i) => {
                w.u8(LITERAL_I64);
                w.buf.extend_from_slice(&i.to_le_bytes());
            }
            LiteralCell::Dbl(d) => {
                w.u8(LITERAL_DBL);
                w.buf.extend_from_slice(&d.to_le_bytes());
            }
            LiteralCell::Char32(c) => {
                w.u8(LITERAL_CHAR);
                w.u32(*c);
            }
            LiteralCell::Utf8(s) => {
                w.u8(LITERAL_UTF8);
                w.string(s);
            }
        });
        w.seq(&self.types, |w, t| {
            match &t.def {
                TypeDef::Concrete { section, address } => {
                    w.u8(TYPE_CONCRETE);
                    w.u8(*section as u8);
                    w.address(*address);
                }
                TypeDef::Placeholder { template, index } => {
                    w.u8(TYPE_PLACEHOLDER);
                    w.u32(*template);
                    w.u32(*index);
                }
            }
            w.optional_u32(t.super_type);
        });
        w.seq(&self.templates, |w, t| {
            w.string(&t.name);
            w.seq(&t.placeholders, |w, p| w.string(p));
        });
        w.seq(&self.existentials, |w, e| {
            w.string(&e.name);
            w.u16(e.flags.bits());
            w.optional_address(e.super_existential);
            w.u8(e.intrinsic.map(|i| i as u8).unwrap_or(NO_INTRINSIC));
            w.u32(e.type_index);
            w.addresses(&e.methods);
            w.impls(&e.impls);
        });
        w.seq(&self.fields, |w, f| {
            w.string(&f.name);
            w.u16(f.flags.bits());
            w.u32(f.type_index);
        });
        w.seq(&self.statics, |w, s| {
            w.string(&s.name);
            w.u16(s.flags.bits());
            w.u32(s.type_index);
            w.optional_u32(s.initializer);
        });
        w.seq(&self.calls, |w, c| {
            w.string(&c.name);
            w.u16(c.flags.bits());
            w.u8(c.mode as u8);
            w.optional_address(c.receiver);
            w.u32(c.proc_offset);
        });
        w.seq(&self.actions, |w, a| {
            w.string(&a.name);
            w.u16(a.flags.bits());
            w.optional_address(a.receiver);
        });
        w.seq(&self.concepts, |w, c| {
            w.string(&c.name);
            w.u16(c.flags.bits());
            w.optional_address(c.super_concept);
            w.u32(c.type_index);
            w.addresses(&c.actions);
        });
        w.seq(&self.namespaces, |w, n| {
            w.string(&n.name);
            w.u16(n.flags.bits());
            w.optional_address(n.super_namespace);
            w.seq(&n.bindings, |w, b| {
                w.u8(b.section as u8);
                w.address(b.address);
            });
        });
        w.seq(&self.classes, |w, d| w.definition(d));
        w.seq(&self.enums, |w, d| w.definition(d));
        w.seq(&self.structs, |w, d| w.definition(d));
        w.seq(&self.instances, |w, d| w.definition(d));
        w.seq(&self.links, |w, l| {
            w.u8(l.section as u8);
            w.u32(l.import);
            w.string(&l.symbol_path);
        });
        w.seq(&self.symbols, |w, s| {
            w.string(&s.path);
            w.u8(s.section as u8);
            w.u32(s.index);
        });
        w.u32(self.bytecode.len() as u32);
        w.buf.extend_from_slice(&self.bytecode);
        w.buf
    }
}

/// Assembles an [`ObjectFile`] piece by piece.
///
/// Every `add_*` method returns the index of the new entry in its section,
/// which is also the Near address other descriptors use to refer to it.
#[derive(Debug, Clone, Default)]
pub struct ModuleBuilder {
    object: ObjectFile,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push<T>(items: &mut Vec<T>, item: T) -> u32 {
        items.push(item);
        (items.len() - 1) as u32
    }

    pub fn add_import(&mut self, location: &str, flags: ImportFlags) -> u32 {
        Self::push(
            &mut self.object.imports,
            ImportDescriptor {
                location: location.to_owned(),
                flags,
            },
        )
    }

    pub fn add_plugin(&mut self, location: &str) -> u32 {
        Self::push(
            &mut self.object.plugins,
            PluginDescriptor {
                location: location.to_owned(),
            },
        )
    }

    pub fn add_literal(&mut self, literal: LiteralCell) -> u32 {
        Self::push(&mut self.object.literals, literal)
    }

    pub fn add_type(&mut self, def: TypeDef, super_type: Option<u32>) -> u32 {
        Self::push(&mut self.object.types, TypeDescriptor { def, super_type })
    }

    pub fn add_template(&mut self, template: TemplateDescriptor) -> u32 {
        Self::push(&mut self.object.templates, template)
    }

    pub fn add_existential(&mut self, existential: ExistentialDescriptor) -> u32 {
        Self::push(&mut self.object.existentials, existential)
    }

    pub fn add_field(&mut self, name: &str, flags: DeclFlags, type_index: u32) -> u32 {
        Self::push(
            &mut self.object.fields,
            FieldDescriptor {
                name: name.to_owned(),
                flags,
                type_index,
            },
        )
    }

    pub fn add_static(&mut self, descriptor: StaticDescriptor) -> u32 {
        Self::push(&mut self.object.statics, descriptor)
    }

    pub fn add_call(&mut self, descriptor: CallDescriptor) -> u32 {
        Self::push(&mut self.object.calls, descriptor)
    }

    pub fn add_action(&mut self, descriptor: ActionDescriptor) -> u32 {
        Self::push(&mut self.object.actions, descriptor)
    }

    pub fn add_concept(&mut self, descriptor: ConceptDescriptor) -> u32 {
        Self::push(&mut self.object.concepts, descriptor)
    }

    pub fn add_namespace(&mut self, descriptor: NamespaceDescriptor) -> u32 {
        Self::push(&mut self.object.namespaces, descriptor)
    }

    pub fn add_definition(
        &mut self,
        section: LinkageSection,
        descriptor: DefinitionDescriptor,
    ) -> Option<u32> {
        let items = match section {
            LinkageSection::Class => &mut self.object.classes,
            LinkageSection::Enum => &mut self.object.enums,
            LinkageSection::Struct => &mut self.object.structs,
            LinkageSection::Instance => &mut self.object.instances,
            _ => return None,
        };
        Some(Self::push(items, descriptor))
    }

    pub fn add_class(&mut self, descriptor: ClassDescriptor) -> u32 {
        Self::push(&mut self.object.classes, descriptor)
    }

    pub fn add_link(&mut self, section: LinkageSection, import: u32, symbol_path: &str) -> u32 {
        Self::push(
            &mut self.object.links,
            LinkDescriptor {
                section,
                import,
                symbol_path: symbol_path.to_owned(),
            },
        )
    }

    pub fn add_symbol(&mut self, path: &str, section: LinkageSection, index: u32) {
        self.object.symbols.push(SymbolDescriptor {
            path: path.to_owned(),
            section,
            index,
        });
    }

    /// Appends a proc (header followed by code) to the bytecode blob and
    /// returns its offset.
    pub fn add_proc(&mut self, header: &ProcHeader, code: BytecodeBuilder) -> u32 {
        let offset = self.object.bytecode.len() as u32;
        let code = code.into_bytes();
        header.write(code.len() as u32, &mut self.object.bytecode);
        self.object.bytecode.extend_from_slice(&code);
        offset
    }

    pub fn object_mut(&mut self) -> &mut ObjectFile {
        &mut self.object
    }

    pub fn into_object(mut self) -> ObjectFile {
        self.object
            .symbols
            .sort_by(|a, b| a.path.cmp(&b.path));
        self.object
    }

    pub fn finish(self) -> Vec<u8> {
        self.into_object().to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object() -> ObjectFile {
        let mut builder = ModuleBuilder::new();
        let import = builder.add_import("/prelude", ImportFlags::SYSTEM_BOOTSTRAP);
        builder.add_plugin("core");
        builder.add_literal(LiteralCell::utf8("🚀"));
        builder.add_literal(LiteralCell::Dbl(1.5));
        let ty = builder.add_type(
            TypeDef::Concrete {
                section: LinkageSection::Class,
                address: Address::Near(0),
            },
            None,
        );
        let field = builder.add_field("x", DeclFlags::VARIABLE, ty);
        let ctor = builder.add_call(CallDescriptor {
            name: "Point.$ctor".into(),
            flags: DeclFlags::BOUND,
            mode: CallMode::Constructor,
            receiver: Some(Address::Near(0)),
            proc_offset: 0,
        });
        let link = builder.add_link(LinkageSection::Class, import, "Object");
        let class = builder.add_class(DefinitionDescriptor {
            name: "Point".into(),
            flags: DeclFlags::FINAL,
            super_type: Some(Address::Far(link)),
            type_index: ty,
            allocator: Some(0),
            ctor,
            members: vec![Address::Near(field)],
            methods: vec![],
            impls: vec![],
            sealed_subtypes: vec![],
        });
        builder.add_existential(ExistentialDescriptor {
            name: "Shape".into(),
            flags: DeclFlags::empty(),
            super_existential: Some(Address::Far(link)),
            intrinsic: None,
            type_index: ty,
            methods: vec![Address::Near(ctor)],
            impls: vec![ImplDescriptor {
                concept: Address::Far(link),
                extensions: vec![ExtensionDescriptor {
                    action: Address::Near(0),
                    call: Address::Near(ctor),
                }],
            }],
        });
        builder.add_symbol("Point", LinkageSection::Class, class);
        builder.add_symbol("Point.$ctor", LinkageSection::Call, ctor);
        builder.add_symbol("$entry", LinkageSection::Call, ctor);
        builder.add_proc(&ProcHeader::new(0, 0), BytecodeBuilder::new());
        builder.into_object()
    }

    #[test]
    fn written_objects_parse_back() {
        let object = sample_object();
        let parsed = ObjectFile::parse(&object.to_bytes()).expect("parse");
        assert_eq!(parsed, object);
        assert_eq!(parsed.find_symbol("Point").map(|s| s.index), Some(0));
        assert!(parsed.find_symbol("Missing").is_none());
        assert_eq!(
            parsed.classes[0].super_type,
            Some(Address::Far(0)),
            "far super reference survives encoding"
        );
        assert_eq!(parsed.existentials[0].methods, vec![Address::Near(0)]);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = sample_object().to_bytes();
        bytes[0] = b'X';
        assert_eq!(ObjectFile::parse(&bytes).unwrap_err().message, "bad magic");

        let mut bytes = sample_object().to_bytes();
        bytes[4] = 9;
        let err = ObjectFile::parse(&bytes).unwrap_err();
        assert!(err.message.contains("unsupported major version"), "{err}");
    }

    #[test]
    fn rejects_truncated_buffers() {
        let bytes = sample_object().to_bytes();
        for len in [0, 3, 8, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                ObjectFile::parse(&bytes[..len]).is_err(),
                "prefix of {len} bytes must not parse"
            );
        }
    }

    #[test]
    fn rejects_unsorted_symbols() {
        let mut object = sample_object();
        object.symbols.swap(0, 1);
        let err = ObjectFile::parse(&object.to_bytes()).unwrap_err();
        assert!(err.message.contains("not sorted"), "{err}");
    }

    #[test]
    fn rejects_symbols_outside_their_section() {
        let mut object = sample_object();
        object.symbols[0].index = 40;
        let err = ObjectFile::parse(&object.to_bytes()).unwrap_err();
        assert!(err.message.contains("outside its section"), "{err}");
    }

    #[test]
    fn rejects_huge_counts() {
        let mut bytes = sample_object().to_bytes();
        // import count directly follows the 8 byte header
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = ObjectFile::parse(&bytes).unwrap_err();
        assert!(err.message.contains("exceeds remaining buffer"), "{err}");
    }

    #[test]
    fn address_encoding_distinguishes_near_and_far() {
        assert_eq!(Address::decode(Address::Near(5).encode()), Address::Near(5));
        assert_eq!(Address::decode(Address::Far(5).encode()), Address::Far(5));
        assert_ne!(Address::Near(5).encode(), Address::Far(5).encode());
    }
}
