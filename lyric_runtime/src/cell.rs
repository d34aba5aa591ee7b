use std::{fmt, sync::Arc};

use crate::{LinkageSection, RefHandle};

/// The descriptor sections a `DataCell::Descriptor` may point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Action,
    Call,
    Class,
    Concept,
    Enum,
    Existential,
    Field,
    Instance,
    Namespace,
    Static,
    Struct,
}

impl DescriptorKind {
    pub fn section(self) -> LinkageSection {
        match self {
            DescriptorKind::Action => LinkageSection::Action,
            DescriptorKind::Call => LinkageSection::Call,
            DescriptorKind::Class => LinkageSection::Class,
            DescriptorKind::Concept => LinkageSection::Concept,
            DescriptorKind::Enum => LinkageSection::Enum,
            DescriptorKind::Existential => LinkageSection::Existential,
            DescriptorKind::Field => LinkageSection::Field,
            DescriptorKind::Instance => LinkageSection::Instance,
            DescriptorKind::Namespace => LinkageSection::Namespace,
            DescriptorKind::Static => LinkageSection::Static,
            DescriptorKind::Struct => LinkageSection::Struct,
        }
    }

    pub fn from_section(section: LinkageSection) -> Option<Self> {
        Some(match section {
            LinkageSection::Action => DescriptorKind::Action,
            LinkageSection::Call => DescriptorKind::Call,
            LinkageSection::Class => DescriptorKind::Class,
            LinkageSection::Concept => DescriptorKind::Concept,
            LinkageSection::Enum => DescriptorKind::Enum,
            LinkageSection::Existential => DescriptorKind::Existential,
            LinkageSection::Field => DescriptorKind::Field,
            LinkageSection::Instance => DescriptorKind::Instance,
            LinkageSection::Namespace => DescriptorKind::Namespace,
            LinkageSection::Static => DescriptorKind::Static,
            LinkageSection::Struct => DescriptorKind::Struct,
            LinkageSection::Invalid | LinkageSection::Literal | LinkageSection::Type => {
                return None;
            }
        })
    }

    fn label(self) -> &'static str {
        match self {
            DescriptorKind::Action => "action",
            DescriptorKind::Call => "call",
            DescriptorKind::Class => "class",
            DescriptorKind::Concept => "concept",
            DescriptorKind::Enum => "enum",
            DescriptorKind::Existential => "existential",
            DescriptorKind::Field => "field",
            DescriptorKind::Instance => "instance",
            DescriptorKind::Namespace => "namespace",
            DescriptorKind::Static => "static",
            DescriptorKind::Struct => "struct",
        }
    }
}

/// A canonical (segment, index) pair in a specific descriptor section.
///
/// Every Near or Far address is canonicalized into one of these before the
/// rest of the runtime sees it, which also makes it usable as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    pub segment: u32,
    pub index: u32,
}

impl Descriptor {
    pub const fn new(kind: DescriptorKind, segment: u32, index: u32) -> Self {
        Self {
            kind,
            segment,
            index,
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<assembly={}, {}={}>",
            self.segment,
            self.kind.label(),
            self.index
        )
    }
}

/// A tagged runtime value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DataCell {
    #[default]
    Invalid,
    Nil,
    /// Marks a value that was never assigned.
    Undef,
    Bool(bool),
    I64(i64),
    Dbl(f64),
    Char32(u32),
    Utf8Literal(Arc<str>),
    Ref(RefHandle),
    Descriptor(Descriptor),
    Type { segment: u32, index: u32 },
}

impl DataCell {
    pub fn nil() -> Self {
        DataCell::Nil
    }

    pub fn undef() -> Self {
        DataCell::Undef
    }

    pub fn for_bool(value: bool) -> Self {
        DataCell::Bool(value)
    }

    pub fn for_i64(value: i64) -> Self {
        DataCell::I64(value)
    }

    pub fn for_dbl(value: f64) -> Self {
        DataCell::Dbl(value)
    }

    pub fn for_char(value: u32) -> Self {
        DataCell::Char32(value)
    }

    pub fn for_utf8(value: Arc<str>) -> Self {
        DataCell::Utf8Literal(value)
    }

    pub fn for_ref(handle: RefHandle) -> Self {
        DataCell::Ref(handle)
    }

    pub fn for_descriptor(kind: DescriptorKind, segment: u32, index: u32) -> Self {
        DataCell::Descriptor(Descriptor::new(kind, segment, index))
    }

    pub fn for_class(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Class, segment, index)
    }

    pub fn for_enum(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Enum, segment, index)
    }

    pub fn for_struct(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Struct, segment, index)
    }

    pub fn for_instance(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Instance, segment, index)
    }

    pub fn for_field(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Field, segment, index)
    }

    pub fn for_call(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Call, segment, index)
    }

    pub fn for_concept(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Concept, segment, index)
    }

    pub fn for_action(segment: u32, index: u32) -> Self {
        Self::for_descriptor(DescriptorKind::Action, segment, index)
    }

    pub fn for_type(segment: u32, index: u32) -> Self {
        DataCell::Type { segment, index }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, DataCell::Invalid)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, DataCell::Nil)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, DataCell::Undef)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            DataCell::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            DataCell::I64(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_dbl(&self) -> Option<f64> {
        match *self {
            DataCell::Dbl(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<u32> {
        match *self {
            DataCell::Char32(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<RefHandle> {
        match *self {
            DataCell::Ref(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_descriptor(&self) -> Option<Descriptor> {
        match *self {
            DataCell::Descriptor(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    /// Returns the descriptor only when it belongs to the `kind` section.
    pub fn as_descriptor_of(&self, kind: DescriptorKind) -> Option<Descriptor> {
        self.as_descriptor().filter(|d| d.kind == kind)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataCell::Invalid => "Invalid",
            DataCell::Nil => "Nil",
            DataCell::Undef => "Undef",
            DataCell::Bool(_) => "Bool",
            DataCell::I64(_) => "I64",
            DataCell::Dbl(_) => "Dbl",
            DataCell::Char32(_) => "Char32",
            DataCell::Utf8Literal(_) => "Utf8",
            DataCell::Ref(_) => "Ref",
            DataCell::Descriptor(d) => d.kind.label(),
            DataCell::Type { .. } => "Type",
        }
    }
}

impl fmt::Display for DataCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataCell::Invalid => write!(f, "Invalid"),
            DataCell::Nil => write!(f, "Nil"),
            DataCell::Undef => write!(f, "Undef"),
            DataCell::Bool(b) => write!(f, "{b}"),
            DataCell::I64(i) => write!(f, "{i}"),
            DataCell::Dbl(d) => write!(f, "{d}"),
            DataCell::Char32(c) => {
                write!(f, "{}", char::from_u32(*c).unwrap_or(char::REPLACEMENT_CHARACTER))
            }
            DataCell::Utf8Literal(s) => write!(f, "{s}"),
            DataCell::Ref(handle) => write!(f, "{handle}"),
            DataCell::Descriptor(d) => write!(f, "{d}"),
            DataCell::Type { segment, index } => {
                write!(f, "<assembly={segment}, type={index}>")
            }
        }
    }
}

/// A constant from a module's literal pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LiteralCell {
    #[default]
    Invalid,
    Nil,
    Bool(bool),
    I64(i64),
    Dbl(f64),
    Char32(u32),
    Utf8(Arc<str>),
}

impl LiteralCell {
    pub fn utf8(value: &str) -> Self {
        LiteralCell::Utf8(Arc::from(value))
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, LiteralCell::Invalid)
    }
}

impl From<&LiteralCell> for DataCell {
    fn from(literal: &LiteralCell) -> Self {
        match literal {
            LiteralCell::Invalid => DataCell::Invalid,
            LiteralCell::Nil => DataCell::Nil,
            LiteralCell::Bool(b) => DataCell::Bool(*b),
            LiteralCell::I64(i) => DataCell::I64(*i),
            LiteralCell::Dbl(d) => DataCell::Dbl(*d),
            LiteralCell::Char32(c) => DataCell::Char32(*c),
            // shares the pool's allocation, the cell never owns the bytes
            LiteralCell::Utf8(s) => DataCell::Utf8Literal(Arc::clone(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_cells_compare_by_kind_segment_and_index() {
        assert_eq!(DataCell::for_class(1, 2), DataCell::for_class(1, 2));
        assert_ne!(DataCell::for_class(1, 2), DataCell::for_enum(1, 2));
        assert_ne!(DataCell::for_class(1, 2), DataCell::for_class(0, 2));
        assert_eq!(
            DataCell::for_call(3, 4).as_descriptor_of(DescriptorKind::Call),
            Some(Descriptor::new(DescriptorKind::Call, 3, 4))
        );
        assert_eq!(
            DataCell::for_call(3, 4).as_descriptor_of(DescriptorKind::Field),
            None
        );
    }

    #[test]
    fn literal_strings_share_the_pool_allocation() {
        let literal = LiteralCell::utf8("café");
        let cell = DataCell::from(&literal);
        match (&literal, &cell) {
            (LiteralCell::Utf8(a), DataCell::Utf8Literal(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected utf8 cells"),
        }
    }

    #[test]
    fn display_formats_primitives_and_descriptors() {
        assert_eq!(DataCell::for_i64(-7).to_string(), "-7");
        assert_eq!(DataCell::for_char('é' as u32).to_string(), "é");
        assert_eq!(DataCell::for_field(0, 3).to_string(), "<assembly=0, field=3>");
        assert_eq!(DataCell::for_type(2, 1).to_string(), "<assembly=2, type=1>");
        assert!(!DataCell::default().is_valid());
    }

    #[test]
    fn section_round_trip_excludes_non_descriptor_sections() {
        assert_eq!(
            DescriptorKind::from_section(DescriptorKind::Struct.section()),
            Some(DescriptorKind::Struct)
        );
        assert_eq!(DescriptorKind::from_section(LinkageSection::Type), None);
        assert_eq!(DescriptorKind::from_section(LinkageSection::Literal), None);
    }
}
