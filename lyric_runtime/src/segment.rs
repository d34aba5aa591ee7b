use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{DataCell, LinkageSection, NativeFunc, NativePlugin, ObjectFile};

/// A resolved link: the section and (segment, index) it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEntry {
    pub section: LinkageSection,
    pub segment: u32,
    pub index: u32,
}

/// One loaded module and its mutable runtime state.
///
/// The descriptor tables are immutable once loaded. Links are resolved on
/// demand and memoized; statics, instances and enums start out `Invalid`
/// and are filled in on first use.
pub struct Segment {
    index: u32,
    location: String,
    object: ObjectFile,
    plugin: Option<Arc<dyn NativePlugin>>,
    links: RwLock<Vec<Option<LinkEntry>>>,
    statics: RwLock<Vec<DataCell>>,
    instances: RwLock<Vec<DataCell>>,
    enums: RwLock<Vec<DataCell>>,
}

impl Segment {
    pub fn new(
        index: u32,
        location: &str,
        object: ObjectFile,
        plugin: Option<Arc<dyn NativePlugin>>,
    ) -> Self {
        Self {
            index,
            location: location.to_owned(),
            links: RwLock::new(vec![None; object.links.len()]),
            statics: RwLock::new(vec![DataCell::Invalid; object.statics.len()]),
            instances: RwLock::new(vec![DataCell::Invalid; object.instances.len()]),
            enums: RwLock::new(vec![DataCell::Invalid; object.enums.len()]),
            object,
            plugin,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn object(&self) -> &ObjectFile {
        &self.object
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.object.bytecode
    }

    pub fn plugin(&self) -> Option<&Arc<dyn NativePlugin>> {
        self.plugin.as_ref()
    }

    pub fn get_trap(&self, index: u32) -> Option<NativeFunc> {
        self.plugin.as_ref()?.get_trap(index)
    }

    pub fn num_links(&self) -> usize {
        self.object.links.len()
    }

    /// The memoized resolution of link `index`, if it has been resolved.
    pub fn get_link(&self, index: u32) -> Option<LinkEntry> {
        self.links.read().get(index as usize).copied().flatten()
    }

    /// Records a resolution. The first one wins so every reader observes
    /// the same entry.
    pub fn set_link(&self, index: u32, entry: LinkEntry) -> Option<LinkEntry> {
        let mut links = self.links.write();
        let slot = links.get_mut(index as usize)?;
        Some(*slot.get_or_insert(entry))
    }

    pub fn load_static(&self, index: u32) -> Option<DataCell> {
        self.statics.read().get(index as usize).cloned()
    }

    pub fn store_static(&self, index: u32, value: DataCell) -> bool {
        store(&self.statics, index, value)
    }

    pub fn load_instance(&self, index: u32) -> Option<DataCell> {
        self.instances.read().get(index as usize).cloned()
    }

    pub fn store_instance(&self, index: u32, value: DataCell) -> bool {
        store(&self.instances, index, value)
    }

    pub fn load_enum(&self, index: u32) -> Option<DataCell> {
        self.enums.read().get(index as usize).cloned()
    }

    pub fn store_enum(&self, index: u32, value: DataCell) -> bool {
        store(&self.enums, index, value)
    }

    /// Calls `visit` for every initialized module-level value.
    pub fn visit_roots(&self, visit: &mut dyn FnMut(&DataCell)) {
        for table in [&self.statics, &self.instances, &self.enums] {
            for cell in table.read().iter().filter(|c| c.is_valid()) {
                visit(cell);
            }
        }
    }
}

fn store(table: &RwLock<Vec<DataCell>>, index: u32, value: DataCell) -> bool {
    match table.write().get_mut(index as usize) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("location", &self.location)
            .field("plugin", &self.plugin.as_ref().map(|p| p.location().to_owned()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinkDescriptor, StaticDescriptor};

    fn mk_segment() -> Segment {
        let mut object = ObjectFile::default();
        object.links.push(LinkDescriptor {
            section: LinkageSection::Class,
            import: 0,
            symbol_path: "Base".into(),
        });
        object.statics.push(StaticDescriptor {
            name: "counter".into(),
            flags: Default::default(),
            type_index: 0,
            initializer: None,
        });
        Segment::new(3, "/main", object, None)
    }

    #[test]
    fn first_link_resolution_wins() {
        let segment = mk_segment();
        assert_eq!(segment.get_link(0), None);
        let first = LinkEntry {
            section: LinkageSection::Class,
            segment: 1,
            index: 4,
        };
        let second = LinkEntry { index: 5, ..first };
        assert_eq!(segment.set_link(0, first), Some(first));
        assert_eq!(segment.set_link(0, second), Some(first));
        assert_eq!(segment.get_link(0), Some(first));
        assert_eq!(segment.set_link(1, first), None);
    }

    #[test]
    fn statics_start_uninitialized() {
        let segment = mk_segment();
        assert_eq!(segment.load_static(0), Some(DataCell::Invalid));
        assert!(segment.store_static(0, DataCell::for_i64(7)));
        assert_eq!(segment.load_static(0), Some(DataCell::I64(7)));
        assert!(!segment.store_static(1, DataCell::Nil));
        assert_eq!(segment.load_static(1), None);

        let mut seen = Vec::new();
        segment.visit_roots(&mut |cell| seen.push(cell.clone()));
        assert_eq!(seen, vec![DataCell::I64(7)]);
        assert!(segment.get_trap(0).is_none());
    }
}
