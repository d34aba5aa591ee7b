use std::{collections::HashMap, fmt};

use ahash::RandomState;

use crate::{AbstractRef, InterpreterStatus, Result};

// ── Handles ───────────────────────────────────────────────────────────

/// A generational index into the heap. A handle whose slot was freed and
/// reused no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefHandle {
    index: u32,
    generation: u32,
}

impl RefHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RefHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ref {}:{}>", self.index, self.generation)
    }
}

/// A host-held handle that keeps its ref alive across collections until
/// it is released.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HostHandle(RefHandle);

impl HostHandle {
    pub fn handle(&self) -> RefHandle {
        self.0
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Slots reserved up front.
    pub initial_capacity: usize,
    /// Allocations since the last collection after which the interpreter
    /// runs a collection at its next time slice.
    pub gc_threshold: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            gc_threshold: 4096,
        }
    }
}

/// Overrides applied on top of [`HeapSettings::default`].
#[derive(Debug, Clone, Default)]
pub struct HeapCreateInfo {
    pub initial_capacity: Option<usize>,
    pub gc_threshold: Option<usize>,
}

impl HeapSettings {
    pub fn from_create_info(info: &HeapCreateInfo) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            initial_capacity: info.initial_capacity.unwrap_or(defaults.initial_capacity),
            gc_threshold: info.gc_threshold.unwrap_or(defaults.gc_threshold),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.gc_threshold == 0 {
            return Err(InterpreterStatus::invariant("gc_threshold must be > 0"));
        }
        if self.initial_capacity > u32::MAX as usize {
            return Err(InterpreterStatus::invariant("initial_capacity too large"));
        }
        Ok(())
    }
}

// ── Heap manager ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GarbageCollectionStats {
    pub live: usize,
    pub freed: usize,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    value: Option<Box<dyn AbstractRef>>,
}

/// Exclusive owner of every heap object.
///
/// Objects live in a slot arena addressed by [`RefHandle`]. Collection is
/// a stop-the-world mark and sweep driven by the marks each ref carries.
#[derive(Debug)]
pub struct HeapManager {
    settings: HeapSettings,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    allocated_since_gc: usize,
    host_handles: HashMap<RefHandle, usize, RandomState>,
}

impl HeapManager {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            slots: Vec::with_capacity(settings.initial_capacity),
            settings,
            free: Vec::new(),
            live: 0,
            allocated_since_gc: 0,
            host_handles: HashMap::default(),
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn allocate_ref(&mut self, object: Box<dyn AbstractRef>) -> RefHandle {
        self.live += 1;
        self.allocated_since_gc += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(object);
            return RefHandle {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(object),
        });
        RefHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn allocate<R: AbstractRef + 'static>(&mut self, object: R) -> RefHandle {
        self.allocate_ref(Box::new(object))
    }

    fn slot(&self, handle: RefHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub fn get(&self, handle: RefHandle) -> Option<&dyn AbstractRef> {
        self.slot(handle)?.value.as_deref()
    }

    pub fn get_mut(&mut self, handle: RefHandle) -> Option<&mut (dyn AbstractRef + 'static)> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_deref_mut()
    }

    pub fn contains(&self, handle: RefHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn should_collect(&self) -> bool {
        self.allocated_since_gc >= self.settings.gc_threshold
    }

    pub fn create_handle(&mut self, handle: RefHandle) -> Result<HostHandle> {
        if !self.contains(handle) {
            return Err(InterpreterStatus::invariant(format!(
                "dangling reference {handle}"
            )));
        }
        *self.host_handles.entry(handle).or_insert(0) += 1;
        Ok(HostHandle(handle))
    }

    pub fn release_handle(&mut self, handle: HostHandle) {
        if let Some(count) = self.host_handles.get_mut(&handle.0) {
            *count -= 1;
            if *count == 0 {
                self.host_handles.remove(&handle.0);
            }
        }
    }

    /// Frees every object not reachable from `roots` or a host handle.
    pub fn collect_garbage(&mut self, roots: &[RefHandle]) -> GarbageCollectionStats {
        for object in self.slots.iter_mut().filter_map(|s| s.value.as_deref_mut()) {
            object.clear_reachable();
        }

        let mut pending: Vec<RefHandle> = roots.to_vec();
        pending.extend(self.host_handles.keys().copied());
        while let Some(handle) = pending.pop() {
            let Some(object) = self.get_mut(handle) else {
                continue;
            };
            if object.is_reachable() {
                continue;
            }
            object.set_reachable();
            object.visit_edges(&mut |edge| pending.push(edge));
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(object) = slot.value.as_deref_mut() else {
                continue;
            };
            if object.is_reachable() {
                continue;
            }
            object.finalize();
            slot.value = None;
            freed += 1;
            // Slots whose generation would wrap are never reused.
            match slot.generation.checked_add(1) {
                Some(generation) => {
                    slot.generation = generation;
                    self.free.push(index as u32);
                }
                None => log::debug!("gc: retiring slot {index}"),
            }
        }

        self.live -= freed;
        self.allocated_since_gc = 0;
        let stats = GarbageCollectionStats {
            live: self.live,
            freed,
        };
        log::debug!("gc: freed {} refs, {} live", stats.freed, stats.live);
        stats
    }
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::new(HeapSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataCell, FutureRef, PromiseId, StringRef};

    #[test]
    fn settings_fold_create_info() {
        let settings = HeapSettings::from_create_info(&HeapCreateInfo {
            gc_threshold: Some(8),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.gc_threshold, 8);
        assert_eq!(settings.initial_capacity, 1024);

        let err = HeapSettings::from_create_info(&HeapCreateInfo {
            gc_threshold: Some(0),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.message, "gc_threshold must be > 0");
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut heap = HeapManager::default();
        let first = heap.allocate(StringRef::owned("a".into()));
        let stats = heap.collect_garbage(&[]);
        assert_eq!(stats.freed, 1);
        assert!(heap.get(first).is_none());

        let second = heap.allocate(StringRef::owned("b".into()));
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(heap.get(second).unwrap().utf8_value(), Some("b"));
    }

    #[test]
    fn exhausted_slots_are_retired() {
        let mut heap = HeapManager::default();
        let old = heap.allocate(StringRef::owned("old".into()));
        heap.slots[old.index() as usize].generation = u32::MAX;
        let old = RefHandle {
            index: old.index(),
            generation: u32::MAX,
        };
        assert!(heap.contains(old));

        heap.collect_garbage(&[]);
        assert!(heap.free.is_empty());
        assert_eq!(heap.slots[old.index() as usize].generation, u32::MAX);

        let fresh = heap.allocate(StringRef::owned("fresh".into()));
        assert_ne!(fresh.index(), old.index());
        assert!(!heap.contains(old));
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn collection_keeps_roots_and_their_edges() {
        let mut heap = HeapManager::default();
        let kept = heap.allocate(StringRef::owned("kept".into()));
        let result = heap.allocate(StringRef::owned("result".into()));
        let future = heap.allocate(FutureRef::new(PromiseId::from_raw(0)));
        heap.get_mut(future)
            .unwrap()
            .resolve_future(DataCell::for_ref(result))
            .unwrap();
        let garbage = heap.allocate(StringRef::owned("garbage".into()));

        let stats = heap.collect_garbage(&[kept, future]);
        assert_eq!(stats, GarbageCollectionStats { live: 3, freed: 1 });
        assert!(heap.contains(kept));
        assert!(heap.contains(result));
        assert!(!heap.contains(garbage));
    }

    #[test]
    fn host_handles_pin_refs() {
        let mut heap = HeapManager::default();
        let pinned = heap.allocate(StringRef::owned("pinned".into()));
        let handle = heap.create_handle(pinned).unwrap();
        heap.collect_garbage(&[]);
        assert!(heap.contains(pinned));

        heap.release_handle(handle);
        heap.collect_garbage(&[]);
        assert!(!heap.contains(pinned));
        assert!(heap.create_handle(pinned).is_err());
    }

    #[test]
    fn threshold_counts_allocations_since_collection() {
        let mut heap = HeapManager::new(HeapSettings {
            initial_capacity: 4,
            gc_threshold: 2,
        });
        heap.allocate(StringRef::owned("x".into()));
        assert!(!heap.should_collect());
        heap.allocate(StringRef::owned("y".into()));
        assert!(heap.should_collect());
        heap.collect_garbage(&[]);
        assert!(!heap.should_collect());
    }
}
