use bitflags::bitflags;

use crate::LiteralCell;

/// High bit of an encoded address marks a link-table (Far) reference.
pub const FAR_ADDRESS_BIT: u32 = 0x8000_0000;

/// Sentinel used on disk for absent optional indices and addresses.
pub const INVALID_ADDRESS_U32: u32 = u32::MAX;

/// A reference from one descriptor to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Index into the same segment's descriptor table.
    Near(u32),
    /// Index into the segment's link table.
    Far(u32),
}

impl Address {
    pub fn decode(raw: u32) -> Self {
        if raw & FAR_ADDRESS_BIT == 0 {
            Address::Near(raw)
        } else {
            Address::Far(raw & !FAR_ADDRESS_BIT)
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            Address::Near(index) => index & !FAR_ADDRESS_BIT,
            Address::Far(link) => link | FAR_ADDRESS_BIT,
        }
    }

    pub fn is_near(self) -> bool {
        matches!(self, Address::Near(_))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkageSection {
    Invalid = 0,
    Action,
    Call,
    Class,
    Concept,
    Enum,
    Existential,
    Field,
    Instance,
    Literal,
    Namespace,
    Static,
    Struct,
    Type,
}

impl LinkageSection {
    pub fn name(self) -> &'static str {
        match self {
            LinkageSection::Invalid => "invalid",
            LinkageSection::Action => "action",
            LinkageSection::Call => "call",
            LinkageSection::Class => "class",
            LinkageSection::Concept => "concept",
            LinkageSection::Enum => "enum",
            LinkageSection::Existential => "existential",
            LinkageSection::Field => "field",
            LinkageSection::Instance => "instance",
            LinkageSection::Literal => "literal",
            LinkageSection::Namespace => "namespace",
            LinkageSection::Static => "static",
            LinkageSection::Struct => "struct",
            LinkageSection::Type => "type",
        }
    }
}

impl TryFrom<u8> for LinkageSection {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use LinkageSection::*;
        Ok(match value {
            0 => Invalid,
            1 => Action,
            2 => Call,
            3 => Class,
            4 => Concept,
            5 => Enum,
            6 => Existential,
            7 => Field,
            8 => Instance,
            9 => Literal,
            10 => Namespace,
            11 => Static,
            12 => Struct,
            13 => Type,
            other => return Err(other),
        })
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DeclFlags: u16 {
        const DECL_ONLY = 1 << 0;
        const ABSTRACT = 1 << 1;
        const FINAL = 1 << 2;
        const SEALED = 1 << 3;
        const HIDDEN = 1 << 4;
        const BOUND = 1 << 5;
        const VARIABLE = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ImportFlags: u8 {
        const SYSTEM_BOOTSTRAP = 1 << 0;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Normal = 0,
    Constructor,
    Inline,
}

impl TryFrom<u8> for CallMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CallMode::Normal),
            1 => Ok(CallMode::Constructor),
            2 => Ok(CallMode::Inline),
            other => Err(other),
        }
    }
}

/// Built-in types the bootstrap assembly maps to existentials.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicType {
    Nil = 0,
    Bool,
    Int,
    Float,
    Char,
    String,
    Class,
    Enum,
    Struct,
    Instance,
    Concept,
    Call,
    Action,
    Field,
    Existential,
    Namespace,
    Static,
}

impl IntrinsicType {
    pub const COUNT: usize = IntrinsicType::Static as usize + 1;
}

impl TryFrom<u8> for IntrinsicType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use IntrinsicType::*;
        const ALL: [IntrinsicType; IntrinsicType::COUNT] = [
            Nil, Bool, Int, Float, Char, String, Class, Enum, Struct, Instance, Concept, Call,
            Action, Field, Existential, Namespace, Static,
        ];
        ALL.get(value as usize).copied().ok_or(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub mode: CallMode,
    pub receiver: Option<Address>,
    pub proc_offset: u32,
}

impl CallDescriptor {
    pub fn is_bound(&self) -> bool {
        self.flags.contains(DeclFlags::BOUND)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionDescriptor {
    pub action: Address,
    pub call: Address,
}

/// A concept implementation attached to a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplDescriptor {
    pub concept: Address,
    pub extensions: Vec<ExtensionDescriptor>,
}

/// Shared shape of class, enum, struct and instance descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub super_type: Option<Address>,
    pub type_index: u32,
    pub allocator: Option<u32>,
    /// Near index of the constructor call.
    pub ctor: u32,
    pub members: Vec<Address>,
    pub methods: Vec<Address>,
    pub impls: Vec<ImplDescriptor>,
    pub sealed_subtypes: Vec<Address>,
}

pub type ClassDescriptor = DefinitionDescriptor;
pub type EnumDescriptor = DefinitionDescriptor;
pub type StructDescriptor = DefinitionDescriptor;
pub type InstanceDescriptor = DefinitionDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub struct ConceptDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub super_concept: Option<Address>,
    pub type_index: u32,
    pub actions: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub receiver: Option<Address>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistentialDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub super_existential: Option<Address>,
    pub intrinsic: Option<IntrinsicType>,
    pub type_index: u32,
    /// Call addresses of the methods any receiver of this existential
    /// answers to.
    pub methods: Vec<Address>,
    pub impls: Vec<ImplDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub type_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub type_index: u32,
    /// Near index of the initializer call.
    pub initializer: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundSymbol {
    pub section: LinkageSection,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceDescriptor {
    pub name: String,
    pub flags: DeclFlags,
    pub super_namespace: Option<Address>,
    pub bindings: Vec<BoundSymbol>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDescriptor {
    pub name: String,
    pub placeholders: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDef {
    Concrete {
        section: LinkageSection,
        address: Address,
    },
    Placeholder {
        template: u32,
        index: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub def: TypeDef,
    /// Index into the same segment's type table.
    pub super_type: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkDescriptor {
    pub section: LinkageSection,
    pub import: u32,
    pub symbol_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDescriptor {
    pub location: String,
    pub flags: ImportFlags,
}

impl ImportDescriptor {
    pub fn is_system_bootstrap(&self) -> bool {
        self.flags.contains(ImportFlags::SYSTEM_BOOTSTRAP)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDescriptor {
    pub path: String,
    pub section: LinkageSection,
    pub index: u32,
}

/// A decoded module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectFile {
    pub minor_version: u16,
    pub imports: Vec<ImportDescriptor>,
    pub plugins: Vec<PluginDescriptor>,
    pub literals: Vec<LiteralCell>,
    pub types: Vec<TypeDescriptor>,
    pub templates: Vec<TemplateDescriptor>,
    pub existentials: Vec<ExistentialDescriptor>,
    pub fields: Vec<FieldDescriptor>,
    pub statics: Vec<StaticDescriptor>,
    pub calls: Vec<CallDescriptor>,
    pub actions: Vec<ActionDescriptor>,
    pub concepts: Vec<ConceptDescriptor>,
    pub namespaces: Vec<NamespaceDescriptor>,
    pub classes: Vec<ClassDescriptor>,
    pub enums: Vec<EnumDescriptor>,
    pub structs: Vec<StructDescriptor>,
    pub instances: Vec<InstanceDescriptor>,
    pub links: Vec<LinkDescriptor>,
    /// Sorted by path.
    pub symbols: Vec<SymbolDescriptor>,
    pub bytecode: Vec<u8>,
}

impl ObjectFile {
    pub fn find_symbol(&self, path: &str) -> Option<&SymbolDescriptor> {
        self.symbols
            .binary_search_by(|symbol| symbol.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.symbols[i])
    }

    pub fn definitions(&self, section: LinkageSection) -> Option<&[DefinitionDescriptor]> {
        match section {
            LinkageSection::Class => Some(&self.classes),
            LinkageSection::Enum => Some(&self.enums),
            LinkageSection::Struct => Some(&self.structs),
            LinkageSection::Instance => Some(&self.instances),
            _ => None,
        }
    }

    pub fn section_len(&self, section: LinkageSection) -> usize {
        match section {
            LinkageSection::Invalid => 0,
            LinkageSection::Action => self.actions.len(),
            LinkageSection::Call => self.calls.len(),
            LinkageSection::Class => self.classes.len(),
            LinkageSection::Concept => self.concepts.len(),
            LinkageSection::Enum => self.enums.len(),
            LinkageSection::Existential => self.existentials.len(),
            LinkageSection::Field => self.fields.len(),
            LinkageSection::Instance => self.instances.len(),
            LinkageSection::Literal => self.literals.len(),
            LinkageSection::Namespace => self.namespaces.len(),
            LinkageSection::Static => self.statics.len(),
            LinkageSection::Struct => self.structs.len(),
            LinkageSection::Type => self.types.len(),
        }
    }
}
