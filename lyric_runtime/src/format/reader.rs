use std::sync::Arc;

use super::*;
use crate::LiteralCell;

pub(crate) const LITERAL_NIL: u8 = 0;
pub(crate) const LITERAL_BOOL: u8 = 1;
pub(crate) const LITERAL_I64: u8 = 2;
pub(crate) const LITERAL_DBL: u8 = 3;
pub(crate) const LITERAL_CHAR: u8 = 4;
pub(crate) const LITERAL_UTF8: u8 = 5;

pub(crate) const TYPE_CONCRETE: u8 = 0;
pub(crate) const TYPE_PLACEHOLDER: u8 = 1;

pub(crate) const NO_INTRINSIC: u8 = 0xFF;

/// Bounds-checked little-endian cursor over an untrusted buffer.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn error(&self, message: impl Into<String>) -> FormatError {
        FormatError::new(self.pos, message)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < len {
            return Err(self.error(format!("truncated: wanted {len} bytes")));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, FormatError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, FormatError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn read_string(&mut self) -> Result<String, FormatError> {
        let len = self.read_u32()? as usize;
        let start = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| FormatError::new(start, format!("invalid utf-8: {e}")))
    }

    /// Reads a record count, rejecting counts the remaining bytes cannot hold.
    fn read_count(&mut self, min_record_size: usize) -> Result<usize, FormatError> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_record_size.max(1)) > self.remaining() {
            return Err(self.error(format!("count {count} exceeds remaining buffer")));
        }
        Ok(count)
    }

    fn read_vec<T>(
        &mut self,
        min_record_size: usize,
        mut read: impl FnMut(&mut Self) -> Result<T, FormatError>,
    ) -> Result<Vec<T>, FormatError> {
        let count = self.read_count(min_record_size)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(read(self)?);
        }
        Ok(out)
    }

    fn read_optional_u32(&mut self) -> Result<Option<u32>, FormatError> {
        let raw = self.read_u32()?;
        Ok((raw != INVALID_ADDRESS_U32).then_some(raw))
    }

    fn read_address(&mut self) -> Result<Address, FormatError> {
        let raw = self.read_u32()?;
        if raw == INVALID_ADDRESS_U32 {
            return Err(self.error("unexpected invalid address"));
        }
        Ok(Address::decode(raw))
    }

    fn read_optional_address(&mut self) -> Result<Option<Address>, FormatError> {
        Ok(self.read_optional_u32()?.map(Address::decode))
    }

    fn read_addresses(&mut self) -> Result<Vec<Address>, FormatError> {
        self.read_vec(4, |r| r.read_address())
    }

    fn read_flags(&mut self) -> Result<DeclFlags, FormatError> {
        let raw = self.read_u16()?;
        DeclFlags::from_bits(raw).ok_or_else(|| self.error(format!("unknown decl flags {raw:#x}")))
    }

    fn read_section(&mut self) -> Result<LinkageSection, FormatError> {
        let raw = self.read_u8()?;
        LinkageSection::try_from(raw)
            .map_err(|v| self.error(format!("unknown linkage section {v}")))
    }

    fn read_literal(&mut self) -> Result<LiteralCell, FormatError> {
        Ok(match self.read_u8()? {
            LITERAL_NIL => LiteralCell::Nil,
            LITERAL_BOOL => LiteralCell::Bool(self.read_u8()? != 0),
            LITERAL_I64 => LiteralCell::I64(self.read_i64()?),
            LITERAL_DBL => LiteralCell::Dbl(self.read_f64()?),
            LITERAL_CHAR => LiteralCell::Char32(self.read_u32()?),
            LITERAL_UTF8 => LiteralCell::Utf8(Arc::from(self.read_string()?)),
            tag => return Err(self.error(format!("unknown literal tag {tag}"))),
        })
    }

    fn read_type(&mut self) -> Result<TypeDescriptor, FormatError> {
        let def = match self.read_u8()? {
            TYPE_CONCRETE => TypeDef::Concrete {
                section: self.read_section()?,
                address: self.read_address()?,
            },
            TYPE_PLACEHOLDER => TypeDef::Placeholder {
                template: self.read_u32()?,
                index: self.read_u32()?,
            },
            tag => return Err(self.error(format!("unknown type tag {tag}"))),
        };
        let super_type = self.read_optional_u32()?;
        Ok(TypeDescriptor { def, super_type })
    }

    fn read_impls(&mut self) -> Result<Vec<ImplDescriptor>, FormatError> {
        self.read_vec(8, |r| {
            let concept = r.read_address()?;
            let extensions = r.read_vec(8, |r| {
                Ok(ExtensionDescriptor {
                    action: r.read_address()?,
                    call: r.read_address()?,
                })
            })?;
            Ok(ImplDescriptor {
                concept,
                extensions,
            })
        })
    }

    fn read_definition(&mut self) -> Result<DefinitionDescriptor, FormatError> {
        let name = self.read_string()?;
        let flags = self.read_flags()?;
        let super_type = self.read_optional_address()?;
        let type_index = self.read_u32()?;
        let allocator = self.read_optional_u32()?;
        let ctor = self.read_u32()?;
        let members = self.read_addresses()?;
        let methods = self.read_addresses()?;
        let impls = self.read_impls()?;
        let sealed_subtypes = self.read_addresses()?;
        Ok(DefinitionDescriptor {
            name,
            flags,
            super_type,
            type_index,
            allocator,
            ctor,
            members,
            methods,
            impls,
            sealed_subtypes,
        })
    }
}

impl ObjectFile {
    /// Decodes a module, verifying the format tag and the symbol index
    /// before anything else in the runtime can observe it.
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = ByteReader::new(bytes);

        let magic = r.take(4)?;
        if magic != MAGIC.as_slice() {
            return Err(FormatError::new(0, "bad magic"));
        }
        let major = r.read_u16()?;
        if major != MAJOR_VERSION {
            return Err(FormatError::new(4, format!("unsupported major version {major}")));
        }
        let minor_version = r.read_u16()?;

        let imports = r.read_vec(5, |r| {
            let location = r.read_string()?;
            let raw = r.read_u8()?;
            let flags = ImportFlags::from_bits(raw)
                .ok_or_else(|| r.error(format!("unknown import flags {raw:#x}")))?;
            Ok(ImportDescriptor { location, flags })
        })?;
        let plugins = r.read_vec(4, |r| {
            Ok(PluginDescriptor {
                location: r.read_string()?,
            })
        })?;
        let literals = r.read_vec(1, |r| r.read_literal())?;
        let types = r.read_vec(9, |r| r.read_type())?;
        let templates = r.read_vec(8, |r| {
            let name = r.read_string()?;
            let placeholders = r.read_vec(4, |r| r.read_string())?;
            Ok(TemplateDescriptor { name, placeholders })
        })?;
        let existentials = r.read_vec(23, |r| {
            let name = r.read_string()?;
            let flags = r.read_flags()?;
            let super_existential = r.read_optional_address()?;
            let intrinsic = match r.read_u8()? {
                NO_INTRINSIC => None,
                raw => Some(
                    IntrinsicType::try_from(raw)
                        .map_err(|v| r.error(format!("unknown intrinsic {v}")))?,
                ),
            };
            let type_index = r.read_u32()?;
            let methods = r.read_addresses()?;
            let impls = r.read_impls()?;
            Ok(ExistentialDescriptor {
                name,
                flags,
                super_existential,
                intrinsic,
                type_index,
                methods,
                impls,
            })
        })?;
        let fields = r.read_vec(10, |r| {
            Ok(FieldDescriptor {
                name: r.read_string()?,
                flags: r.read_flags()?,
                type_index: r.read_u32()?,
            })
        })?;
        let statics = r.read_vec(14, |r| {
            Ok(StaticDescriptor {
                name: r.read_string()?,
                flags: r.read_flags()?,
                type_index: r.read_u32()?,
                initializer: r.read_optional_u32()?,
            })
        })?;
        let calls = r.read_vec(15, |r| {
            let name = r.read_string()?;
            let flags = r.read_flags()?;
            let raw_mode = r.read_u8()?;
            let mode = CallMode::try_from(raw_mode)
                .map_err(|v| r.error(format!("unknown call mode {v}")))?;
            Ok(CallDescriptor {
                name,
                flags,
                mode,
                receiver: r.read_optional_address()?,
                proc_offset: r.read_u32()?,
            })
        })?;
        let actions = r.read_vec(10, |r| {
            Ok(ActionDescriptor {
                name: r.read_string()?,
                flags: r.read_flags()?,
                receiver: r.read_optional_address()?,
            })
        })?;
        let concepts = r.read_vec(18, |r| {
            Ok(ConceptDescriptor {
                name: r.read_string()?,
                flags: r.read_flags()?,
                super_concept: r.read_optional_address()?,
                type_index: r.read_u32()?,
                actions: r.read_addresses()?,
            })
        })?;
        let namespaces = r.read_vec(14, |r| {
            let name = r.read_string()?;
            let flags = r.read_flags()?;
            let super_namespace = r.read_optional_address()?;
            let bindings = r.read_vec(5, |r| {
                Ok(BoundSymbol {
                    section: r.read_section()?,
                    address: r.read_address()?,
                })
            })?;
            Ok(NamespaceDescriptor {
                name,
                flags,
                super_namespace,
                bindings,
            })
        })?;
        let classes = r.read_vec(38, |r| r.read_definition())?;
        let enums = r.read_vec(38, |r| r.read_definition())?;
        let structs = r.read_vec(38, |r| r.read_definition())?;
        let instances = r.read_vec(38, |r| r.read_definition())?;
        let links = r.read_vec(9, |r| {
            Ok(LinkDescriptor {
                section: r.read_section()?,
                import: r.read_u32()?,
                symbol_path: r.read_string()?,
            })
        })?;
        let symbols = r.read_vec(9, |r| {
            Ok(SymbolDescriptor {
                path: r.read_string()?,
                section: r.read_section()?,
                index: r.read_u32()?,
            })
        })?;
        let bytecode_len = r.read_u32()? as usize;
        let bytecode = r.take(bytecode_len)?.to_vec();
        if r.remaining() != 0 {
            return Err(r.error(format!("{} trailing bytes", r.remaining())));
        }

        let object = ObjectFile {
            minor_version,
            imports,
            plugins,
            literals,
            types,
            templates,
            existentials,
            fields,
            statics,
            calls,
            actions,
            concepts,
            namespaces,
            classes,
            enums,
            structs,
            instances,
            links,
            symbols,
            bytecode,
        };
        object.validate(r.offset())?;
        Ok(object)
    }

    fn validate(&self, end: usize) -> Result<(), FormatError> {
        for pair in self.symbols.windows(2) {
            if pair[0].path >= pair[1].path {
                return Err(FormatError::new(
                    end,
                    format!("symbol table not sorted at {}", pair[1].path),
                ));
            }
        }
        for symbol in &self.symbols {
            if symbol.index as usize >= self.section_len(symbol.section) {
                return Err(FormatError::new(
                    end,
                    format!("symbol {} points outside its section", symbol.path),
                ));
            }
        }
        for (i, link) in self.links.iter().enumerate() {
            if link.import as usize >= self.imports.len() {
                return Err(FormatError::new(
                    end,
                    format!("link {i} references missing import {}", link.import),
                ));
            }
        }
        Ok(())
    }
}
