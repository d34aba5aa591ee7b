use std::{collections::HashMap, sync::Arc};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};

use crate::{
    AbstractLoader, Address, DataCell, Descriptor, DescriptorKind, InterpreterCondition,
    ExistentialTable, InterpreterStatus, LinkEntry, LinkageSection, ObjectFile, Result, Segment,
    SymbolDescriptor, VirtualTable,
};

/// Owns every loaded segment and the caches derived from them.
///
/// Segments are appended and never reindexed, so a segment index stays
/// valid until [`teardown`](Self::teardown). Link tables and the virtual
/// and existential table caches are filled at most once per key: misses
/// take a write lock, and the first inserted value wins.
pub struct SegmentManager {
    loader: Arc<dyn AbstractLoader>,
    segments: RwLock<Vec<Arc<Segment>>>,
    by_location: RwLock<HashMap<String, u32, RandomState>>,
    vtables: RwLock<HashMap<Descriptor, Arc<VirtualTable>, RandomState>>,
    etables: RwLock<HashMap<Descriptor, Arc<ExistentialTable>, RandomState>>,
    load_lock: Mutex<()>,
}

fn missing_assembly(location: &str) -> InterpreterStatus {
    InterpreterStatus::for_condition(
        InterpreterCondition::MissingAssembly,
        format!("missing assembly {location}"),
    )
}

fn missing_symbol(path: &str) -> InterpreterStatus {
    InterpreterStatus::for_condition(
        InterpreterCondition::MissingSymbol,
        format!("missing symbol {path}"),
    )
}

impl SegmentManager {
    pub fn new(loader: Arc<dyn AbstractLoader>) -> Self {
        Self {
            loader,
            segments: RwLock::new(Vec::new()),
            by_location: RwLock::new(HashMap::default()),
            vtables: RwLock::new(HashMap::default()),
            etables: RwLock::new(HashMap::default()),
            load_lock: Mutex::new(()),
        }
    }

    /// Unloads every plugin and drops all segments and cached tables.
    pub fn teardown(&self) {
        let _loading = self.load_lock.lock();
        self.vtables.write().clear();
        self.etables.write().clear();
        let segments = std::mem::take(&mut *self.segments.write());
        self.by_location.write().clear();
        for segment in segments.iter().rev() {
            if let Some(plugin) = segment.plugin() {
                plugin.on_unload(segment.index());
            }
        }
        log::debug!("tore down {} segments", segments.len());
    }

    /// Returns the segment loaded from `location`, loading it first if
    /// needed.
    pub fn load_assembly(&self, location: &str) -> Result<Arc<Segment>> {
        if let Some(segment) = self.find_segment(location) {
            return Ok(segment);
        }

        let _loading = self.load_lock.lock();
        if let Some(segment) = self.find_segment(location) {
            return Ok(segment);
        }

        let bytes = self
            .loader
            .load_assembly(location)?
            .ok_or_else(|| missing_assembly(location))?;
        let object = ObjectFile::parse(&bytes)?;

        let plugin = match object.plugins.first() {
            Some(descriptor) => Some(
                self.loader
                    .load_plugin(&descriptor.location)?
                    .ok_or_else(|| missing_assembly(&descriptor.location))?,
            ),
            None => None,
        };

        let index = self.segments.read().len() as u32;
        if let Some(plugin) = &plugin {
            plugin.on_load(index)?;
        }
        let segment = Arc::new(Segment::new(index, location, object, plugin));
        self.segments.write().push(segment.clone());
        self.by_location.write().insert(location.to_owned(), index);

        log::debug!(
            "loaded segment {index} from {location} ({} bytes of bytecode)",
            segment.bytecode().len()
        );
        Ok(segment)
    }

    pub fn find_segment(&self, location: &str) -> Option<Arc<Segment>> {
        let index = *self.by_location.read().get(location)?;
        self.segments.read().get(index as usize).cloned()
    }

    pub fn get_segment(&self, index: u32) -> Result<Arc<Segment>> {
        self.segments
            .read()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| InterpreterStatus::invariant(format!("invalid segment index {index}")))
    }

    /// A snapshot of the loaded segments.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    pub fn find_symbol(
        &self,
        location: &str,
        path: &str,
    ) -> Result<(Arc<Segment>, SymbolDescriptor)> {
        let segment = self.load_assembly(location)?;
        let symbol = segment
            .object()
            .find_symbol(path)
            .cloned()
            .ok_or_else(|| missing_symbol(path))?;
        Ok((segment, symbol))
    }

    /// Resolves link `link` of `segment`, loading the imported assembly
    /// on first use.
    pub fn resolve_link(&self, segment: &Segment, link: u32) -> Result<LinkEntry> {
        if let Some(entry) = segment.get_link(link) {
            return Ok(entry);
        }

        let object = segment.object();
        let descriptor = object
            .links
            .get(link as usize)
            .ok_or_else(|| InterpreterStatus::invariant("missing linkage"))?;
        let import = object.imports.get(descriptor.import as usize).ok_or_else(|| {
            InterpreterStatus::invariant(format!("link {link} references a missing import"))
        })?;

        let target = self.load_assembly(&import.location)?;
        let symbol = target
            .object()
            .find_symbol(&descriptor.symbol_path)
            .ok_or_else(|| missing_symbol(&descriptor.symbol_path))?;
        if symbol.section != descriptor.section {
            return Err(InterpreterStatus::invariant(format!(
                "invalid {} linkage for {}",
                descriptor.section.name(),
                descriptor.symbol_path
            )));
        }

        let entry = LinkEntry {
            section: symbol.section,
            segment: target.index(),
            index: symbol.index,
        };
        log::trace!(
            "resolved link {link} of {} to {}:{} in segment {}",
            segment.location(),
            descriptor.symbol_path,
            entry.index,
            entry.segment
        );
        segment
            .set_link(link, entry)
            .ok_or_else(|| InterpreterStatus::invariant("missing linkage"))
    }

    /// Canonicalizes a Near or Far address expected to point into
    /// `section`.
    pub fn resolve_address(
        &self,
        segment: &Segment,
        section: LinkageSection,
        address: Address,
    ) -> Result<LinkEntry> {
        match address {
            Address::Near(index) => {
                if index as usize >= segment.object().section_len(section) {
                    return Err(InterpreterStatus::invariant(format!(
                        "invalid {} address {index}",
                        section.name()
                    )));
                }
                Ok(LinkEntry {
                    section,
                    segment: segment.index(),
                    index,
                })
            }
            Address::Far(link) => {
                let entry = self.resolve_link(segment, link)?;
                if entry.section != section {
                    return Err(InterpreterStatus::invariant(format!(
                        "invalid {} linkage",
                        section.name()
                    )));
                }
                Ok(entry)
            }
        }
    }

    /// Resolves an encoded operand address into a descriptor or type cell.
    pub fn resolve_descriptor(
        &self,
        segment: &Segment,
        section: LinkageSection,
        address: u32,
    ) -> Result<DataCell> {
        let entry = self.resolve_address(segment, section, Address::decode(address))?;
        match DescriptorKind::from_section(section) {
            Some(kind) => Ok(DataCell::for_descriptor(kind, entry.segment, entry.index)),
            None if section == LinkageSection::Type => {
                Ok(DataCell::for_type(entry.segment, entry.index))
            }
            None => Err(InterpreterStatus::invariant(format!(
                "invalid descriptor section {}",
                section.name()
            ))),
        }
    }

    pub fn resolve_literal(&self, segment: &Segment, address: u32) -> Result<DataCell> {
        let entry = self.resolve_address(segment, LinkageSection::Literal, Address::decode(address))?;
        let target = self.get_segment(entry.segment)?;
        target
            .object()
            .literals
            .get(entry.index as usize)
            .map(DataCell::from)
            .ok_or_else(|| InterpreterStatus::invariant("missing literal"))
    }

    fn module_value(
        &self,
        segment: &Segment,
        section: LinkageSection,
        address: u32,
    ) -> Result<(Arc<Segment>, u32)> {
        let entry = self.resolve_address(segment, section, Address::decode(address))?;
        Ok((self.get_segment(entry.segment)?, entry.index))
    }

    /// The current value of a static, or `None` while it is uninitialized.
    pub fn load_static(&self, segment: &Segment, address: u32) -> Result<Option<DataCell>> {
        let (target, index) = self.module_value(segment, LinkageSection::Static, address)?;
        let cell = target
            .load_static(index)
            .ok_or_else(|| InterpreterStatus::invariant("missing static symbol"))?;
        Ok(cell.is_valid().then_some(cell))
    }

    pub fn store_static(&self, segment: &Segment, address: u32, value: DataCell) -> Result<()> {
        let (target, index) = self.module_value(segment, LinkageSection::Static, address)?;
        if !target.store_static(index, value) {
            return Err(InterpreterStatus::invariant("missing static symbol"));
        }
        Ok(())
    }

    pub fn load_instance(&self, segment: &Segment, address: u32) -> Result<Option<DataCell>> {
        let (target, index) = self.module_value(segment, LinkageSection::Instance, address)?;
        let cell = target
            .load_instance(index)
            .ok_or_else(|| InterpreterStatus::invariant("missing instance symbol"))?;
        Ok(cell.is_valid().then_some(cell))
    }

    pub fn store_instance(&self, segment: &Segment, address: u32, value: DataCell) -> Result<()> {
        let (target, index) = self.module_value(segment, LinkageSection::Instance, address)?;
        if !target.store_instance(index, value) {
            return Err(InterpreterStatus::invariant("missing instance symbol"));
        }
        Ok(())
    }

    pub fn load_enum(&self, segment: &Segment, address: u32) -> Result<Option<DataCell>> {
        let (target, index) = self.module_value(segment, LinkageSection::Enum, address)?;
        let cell = target
            .load_enum(index)
            .ok_or_else(|| InterpreterStatus::invariant("missing enum symbol"))?;
        Ok(cell.is_valid().then_some(cell))
    }

    pub fn store_enum(&self, segment: &Segment, address: u32, value: DataCell) -> Result<()> {
        let (target, index) = self.module_value(segment, LinkageSection::Enum, address)?;
        if !target.store_enum(index, value) {
            return Err(InterpreterStatus::invariant("missing enum symbol"));
        }
        Ok(())
    }

    /// The virtual table of a class, enum, struct or instance descriptor.
    /// Repeated calls return the same table.
    pub fn get_virtual_table(&self, descriptor: &Descriptor) -> Result<Arc<VirtualTable>> {
        self.virtual_table_for(*descriptor, &mut Vec::new())
    }

    fn virtual_table_for(
        &self,
        descriptor: Descriptor,
        visiting: &mut Vec<Descriptor>,
    ) -> Result<Arc<VirtualTable>> {
        if let Some(table) = self.vtables.read().get(&descriptor) {
            return Ok(table.clone());
        }
        if visiting.contains(&descriptor) {
            return Err(InterpreterStatus::invariant("cyclic inheritance detected"));
        }

        let section = descriptor.kind.section();
        let segment = self.get_segment(descriptor.segment)?;
        let definition = segment
            .object()
            .definitions(section)
            .and_then(|definitions| definitions.get(descriptor.index as usize))
            .ok_or_else(|| {
                InterpreterStatus::invariant(format!("invalid {} descriptor", section.name()))
            })?;

        visiting.push(descriptor);
        let parent = match definition.super_type {
            Some(address) => {
                let entry = self.resolve_address(&segment, section, address)?;
                let super_descriptor = Descriptor::new(descriptor.kind, entry.segment, entry.index);
                Some(self.virtual_table_for(super_descriptor, visiting)?)
            }
            None => None,
        };
        let table = VirtualTable::build(self, &segment, descriptor, definition, parent)?;
        visiting.pop();

        Ok(self
            .vtables
            .write()
            .entry(descriptor)
            .or_insert_with(|| Arc::new(table))
            .clone())
    }

    /// The dispatch table of an existential descriptor. Repeated calls
    /// return the same table.
    pub fn get_existential_table(&self, descriptor: &Descriptor) -> Result<Arc<ExistentialTable>> {
        if descriptor.kind != DescriptorKind::Existential {
            return Err(InterpreterStatus::invariant(format!(
                "invalid existential descriptor {descriptor}"
            )));
        }
        self.existential_table_for(*descriptor, &mut Vec::new())
    }

    fn existential_table_for(
        &self,
        descriptor: Descriptor,
        visiting: &mut Vec<Descriptor>,
    ) -> Result<Arc<ExistentialTable>> {
        if let Some(table) = self.etables.read().get(&descriptor) {
            return Ok(table.clone());
        }
        if visiting.contains(&descriptor) {
            return Err(InterpreterStatus::invariant("cyclic inheritance detected"));
        }

        let segment = self.get_segment(descriptor.segment)?;
        let existential = segment
            .object()
            .existentials
            .get(descriptor.index as usize)
            .ok_or_else(|| InterpreterStatus::invariant("invalid existential descriptor"))?;

        visiting.push(descriptor);
        let parent = match existential.super_existential {
            Some(address) => {
                let entry = self.resolve_address(&segment, LinkageSection::Existential, address)?;
                let super_descriptor =
                    Descriptor::new(DescriptorKind::Existential, entry.segment, entry.index);
                Some(self.existential_table_for(super_descriptor, visiting)?)
            }
            None => None,
        };
        let table = ExistentialTable::build(self, &segment, descriptor, existential, parent)?;
        visiting.pop();

        Ok(self
            .etables
            .write()
            .entry(descriptor)
            .or_insert_with(|| Arc::new(table))
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mk_loader, mk_module};
    use crate::{ImportFlags, LiteralCell, StaticDescriptor};

    fn mk_manager() -> SegmentManager {
        let loader = mk_loader();

        let mut lib = mk_module();
        let greeting = lib.add_literal(LiteralCell::utf8("hello"));
        lib.add_symbol("greeting", LinkageSection::Literal, greeting);
        let counter = lib.add_static(StaticDescriptor {
            name: "counter".into(),
            flags: Default::default(),
            type_index: 0,
            initializer: None,
        });
        lib.add_symbol("counter", LinkageSection::Static, counter);
        loader.insert_object("/lib", &lib.into_object());

        let mut main = mk_module();
        let import = main.add_import("/lib", ImportFlags::empty());
        main.add_link(LinkageSection::Literal, import, "greeting");
        main.add_link(LinkageSection::Static, import, "counter");
        main.add_link(LinkageSection::Class, import, "greeting");
        main.add_link(LinkageSection::Call, import, "nowhere");
        let missing = main.add_import("/missing", ImportFlags::empty());
        main.add_link(LinkageSection::Call, missing, "anything");
        loader.insert_object("/main", &main.into_object());

        SegmentManager::new(loader)
    }

    #[test]
    fn assemblies_load_once() {
        let manager = mk_manager();
        let first = manager.load_assembly("/main").unwrap();
        let second = manager.load_assembly("/main").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.segments().len(), 1);

        let err = manager.load_assembly("/nowhere").unwrap_err();
        assert!(err.is(InterpreterCondition::MissingAssembly));
    }

    #[test]
    fn far_literals_resolve_through_links() {
        let manager = mk_manager();
        let main = manager.load_assembly("/main").unwrap();
        let cell = manager
            .resolve_literal(&main, Address::Far(0).encode())
            .unwrap();
        assert_eq!(cell, DataCell::Utf8Literal("hello".into()));

        let entry = main.get_link(0).unwrap();
        assert_eq!(entry.section, LinkageSection::Literal);
        assert_eq!(entry.segment, manager.find_segment("/lib").unwrap().index());
    }

    #[test]
    fn statics_are_stored_in_the_owning_segment() {
        let manager = mk_manager();
        let main = manager.load_assembly("/main").unwrap();
        let address = Address::Far(1).encode();
        assert_eq!(manager.load_static(&main, address).unwrap(), None);
        manager
            .store_static(&main, address, DataCell::for_i64(3))
            .unwrap();
        assert_eq!(
            manager.load_static(&main, address).unwrap(),
            Some(DataCell::I64(3))
        );
        let lib = manager.find_segment("/lib").unwrap();
        assert_eq!(lib.load_static(0), Some(DataCell::I64(3)));
    }

    #[test]
    fn link_failures_are_reported() {
        let manager = mk_manager();
        let main = manager.load_assembly("/main").unwrap();

        let err = manager.resolve_link(&main, 2).unwrap_err();
        assert!(err.message.starts_with("invalid class linkage"));

        let err = manager.resolve_link(&main, 3).unwrap_err();
        assert!(err.is(InterpreterCondition::MissingSymbol));

        let err = manager.resolve_link(&main, 4).unwrap_err();
        assert!(err.is(InterpreterCondition::MissingAssembly));

        let err = manager.resolve_link(&main, 99).unwrap_err();
        assert_eq!(err.message, "missing linkage");

        let err = manager
            .resolve_address(&main, LinkageSection::Static, Address::Far(0))
            .unwrap_err();
        assert_eq!(err.message, "invalid static linkage");

        let err = manager
            .resolve_address(&main, LinkageSection::Call, Address::Near(0))
            .unwrap_err();
        assert_eq!(err.message, "invalid call address 0");
    }

    #[test]
    fn descriptors_are_canonicalized() {
        let manager = mk_manager();
        let main = manager.load_assembly("/main").unwrap();
        let lib = manager.find_segment("/lib").unwrap();
        let cell = manager
            .resolve_descriptor(&main, LinkageSection::Static, Address::Far(1).encode())
            .unwrap();
        assert_eq!(
            cell,
            DataCell::for_descriptor(DescriptorKind::Static, lib.index(), 0)
        );
    }

    #[test]
    fn teardown_forgets_segments() {
        let manager = mk_manager();
        manager.load_assembly("/main").unwrap();
        manager.teardown();
        assert!(manager.find_segment("/main").is_none());
        assert!(manager.get_segment(0).is_err());
    }
}
