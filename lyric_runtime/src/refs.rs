use std::{cmp::Ordering, fmt, sync::Arc};

use ahash::RandomState;

use crate::{
    DataCell, Descriptor, InterpreterCondition, InterpreterStatus, PromiseId, RefHandle, Result,
    SystemScheduler, VirtualMethod, VirtualTable,
};

/// Seeds for value hashing. Fixed so hashes are stable within a process
/// and across runs.
const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

fn hash_bytes(bytes: &[u8]) -> u64 {
    let [a, b, c, d] = HASH_SEEDS;
    RandomState::with_seeds(a, b, c, d).hash_one(bytes)
}

fn unsupported(what: &str) -> InterpreterStatus {
    InterpreterStatus::for_condition(
        InterpreterCondition::InvalidReceiver,
        format!("ref does not support {what}"),
    )
}

/// The capability set every heap object exposes to the interpreter and
/// to native code. Everything except reachability has a default that
/// reports the capability as unsupported.
pub trait AbstractRef: fmt::Debug {
    fn get_virtual_table(&self) -> Option<&Arc<VirtualTable>> {
        None
    }

    fn get_field(&self, _field: &Descriptor) -> Result<DataCell> {
        Err(unsupported("fields"))
    }

    /// Stores `value` and returns the previous value.
    fn set_field(&mut self, _field: &Descriptor, _value: DataCell) -> Result<DataCell> {
        Err(unsupported("fields"))
    }

    /// Identity by default.
    fn equals(&self, other: &dyn AbstractRef) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn AbstractRef)
    }

    fn raw_size(&self) -> usize {
        0
    }

    /// Copies raw bytes starting at `offset` into `out` and returns how
    /// many were copied.
    fn raw_copy(&self, _offset: usize, _out: &mut [u8]) -> usize {
        0
    }

    fn hash_value(&self) -> u64 {
        hash_bytes(&(self as *const Self as *const () as usize).to_le_bytes())
    }

    /// Appends a serialized form to `out`; false if the ref has none.
    fn serialize_value(&self, _out: &mut Vec<u8>) -> bool {
        false
    }

    fn utf8_value(&self) -> Option<&str> {
        None
    }

    fn to_string_value(&self) -> String;

    fn iterator_valid(&self) -> bool {
        false
    }

    fn iterator_next(&mut self) -> Result<DataCell> {
        Err(unsupported("iteration"))
    }

    /// Binds the ref to a scheduler promise.
    fn prepare_future(&mut self, _promise: PromiseId) -> Result<()> {
        Err(unsupported("futures"))
    }

    /// Pushes the future's value onto the current task if it is known,
    /// otherwise suspends the task on the promise.
    fn await_future(&self, _scheduler: &mut SystemScheduler) -> Result<()> {
        Err(unsupported("futures"))
    }

    /// Records the value and returns the promise the scheduler has to
    /// resolve with it.
    fn resolve_future(&mut self, _value: DataCell) -> Result<PromiseId> {
        Err(unsupported("futures"))
    }

    /// Takes over the value the scheduler resolved the promise with. A
    /// value the future already holds is kept.
    fn settle_future(&mut self, _value: DataCell) {}

    /// The method to invoke when the ref is applied as a closure.
    fn apply_closure(&self) -> Option<VirtualMethod> {
        None
    }

    fn is_reachable(&self) -> bool;

    fn set_reachable(&mut self);

    fn clear_reachable(&mut self);

    fn finalize(&mut self) {}

    /// Reports every ref this one keeps alive.
    fn visit_edges(&self, _visit: &mut dyn FnMut(RefHandle)) {}
}

/// State every concrete ref shares.
#[derive(Debug, Default)]
pub struct RefBase {
    vtable: Option<Arc<VirtualTable>>,
    reachable: bool,
}

impl RefBase {
    pub fn new(vtable: Option<Arc<VirtualTable>>) -> Self {
        Self {
            vtable,
            reachable: false,
        }
    }

    pub fn vtable(&self) -> Option<&Arc<VirtualTable>> {
        self.vtable.as_ref()
    }
}

macro_rules! impl_reachability {
    () => {
        fn is_reachable(&self) -> bool {
            self.base.reachable
        }

        fn set_reachable(&mut self) {
            self.base.reachable = true;
        }

        fn clear_reachable(&mut self) {
            self.base.reachable = false;
        }
    };
}

fn visit_cell(cell: &DataCell, visit: &mut dyn FnMut(RefHandle)) {
    if let Some(handle) = cell.as_ref_handle() {
        visit(handle);
    }
}

// ── Instances ─────────────────────────────────────────────────────────

/// An object of a class, enum, struct or instance definition. Its slots
/// follow the virtual table's layout.
#[derive(Debug)]
pub struct InstanceRef {
    base: RefBase,
    fields: Vec<DataCell>,
}

impl InstanceRef {
    pub fn new(vtable: Arc<VirtualTable>) -> Self {
        let fields = vec![DataCell::Nil; vtable.layout_total() as usize];
        Self {
            base: RefBase::new(Some(vtable)),
            fields,
        }
    }

    fn offset_of(&self, field: &Descriptor) -> Result<usize> {
        self.base
            .vtable()
            .and_then(|vtable| vtable.get_member(field))
            .map(|member| member.offset as usize)
            .filter(|&offset| offset < self.fields.len())
            .ok_or_else(|| InterpreterStatus::invariant(format!("missing field {field}")))
    }
}

impl AbstractRef for InstanceRef {
    fn get_virtual_table(&self) -> Option<&Arc<VirtualTable>> {
        self.base.vtable()
    }

    fn get_field(&self, field: &Descriptor) -> Result<DataCell> {
        let offset = self.offset_of(field)?;
        Ok(self.fields[offset].clone())
    }

    fn set_field(&mut self, field: &Descriptor, value: DataCell) -> Result<DataCell> {
        let offset = self.offset_of(field)?;
        Ok(std::mem::replace(&mut self.fields[offset], value))
    }

    fn to_string_value(&self) -> String {
        match self.base.vtable() {
            Some(vtable) => format!("<instance of {}>", vtable.descriptor()),
            None => "<instance>".to_owned(),
        }
    }

    impl_reachability!();

    fn visit_edges(&self, visit: &mut dyn FnMut(RefHandle)) {
        for field in &self.fields {
            visit_cell(field, visit);
        }
    }
}

// ── Strings ───────────────────────────────────────────────────────────

/// Where a string's bytes live.
#[derive(Debug, Clone)]
pub enum Utf8Storage {
    /// Shared with a module's literal pool; the ref never frees it.
    Borrowed(Arc<str>),
    /// Owned by the ref.
    Owned(Box<str>),
}

impl Utf8Storage {
    pub fn as_str(&self) -> &str {
        match self {
            Utf8Storage::Borrowed(s) => s,
            Utf8Storage::Owned(s) => s,
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Utf8Storage::Borrowed(_))
    }
}

/// Compares two strings one code point at a time.
pub fn string_compare(lhs: &str, rhs: &str) -> Ordering {
    lhs.chars().cmp(rhs.chars())
}

#[derive(Debug)]
pub struct StringRef {
    base: RefBase,
    storage: Utf8Storage,
    /// In code points.
    length: usize,
}

impl StringRef {
    pub fn new(storage: Utf8Storage, vtable: Option<Arc<VirtualTable>>) -> Self {
        let length = storage.as_str().chars().count();
        Self {
            base: RefBase::new(vtable),
            storage,
            length,
        }
    }

    pub fn from_literal(literal: Arc<str>) -> Self {
        Self::new(Utf8Storage::Borrowed(literal), None)
    }

    pub fn owned(value: String) -> Self {
        Self::new(Utf8Storage::Owned(value.into_boxed_str()), None)
    }

    pub fn as_str(&self) -> &str {
        self.storage.as_str()
    }

    pub fn storage(&self) -> &Utf8Storage {
        &self.storage
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn char_at(&self, index: usize) -> Option<char> {
        self.as_str().chars().nth(index)
    }
}

impl AbstractRef for StringRef {
    fn get_virtual_table(&self) -> Option<&Arc<VirtualTable>> {
        self.base.vtable()
    }

    fn equals(&self, other: &dyn AbstractRef) -> bool {
        other.utf8_value() == Some(self.as_str())
    }

    fn raw_size(&self) -> usize {
        self.as_str().len()
    }

    fn raw_copy(&self, offset: usize, out: &mut [u8]) -> usize {
        let bytes = self.as_str().as_bytes();
        let Some(tail) = bytes.get(offset..) else {
            return 0;
        };
        let count = tail.len().min(out.len());
        out[..count].copy_from_slice(&tail[..count]);
        count
    }

    fn hash_value(&self) -> u64 {
        hash_bytes(self.as_str().as_bytes())
    }

    fn serialize_value(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(self.as_str().as_bytes());
        true
    }

    fn utf8_value(&self) -> Option<&str> {
        Some(self.as_str())
    }

    fn to_string_value(&self) -> String {
        self.as_str().to_owned()
    }

    impl_reachability!();
}

// ── Rest arguments ────────────────────────────────────────────────────

/// A snapshot of a frame's rest arguments. Iterating it yields each
/// argument once, in call order.
#[derive(Debug)]
pub struct RestRef {
    base: RefBase,
    values: Vec<DataCell>,
    cursor: usize,
}

impl RestRef {
    pub fn new(values: Vec<DataCell>) -> Self {
        Self {
            base: RefBase::default(),
            values,
            cursor: 0,
        }
    }

    pub fn values(&self) -> &[DataCell] {
        &self.values
    }
}

impl AbstractRef for RestRef {
    fn to_string_value(&self) -> String {
        format!("<rest of {}>", self.values.len())
    }

    fn iterator_valid(&self) -> bool {
        self.cursor < self.values.len()
    }

    fn iterator_next(&mut self) -> Result<DataCell> {
        let value = self
            .values
            .get(self.cursor)
            .cloned()
            .ok_or_else(|| InterpreterStatus::invariant("rest iterator exhausted"))?;
        self.cursor += 1;
        Ok(value)
    }

    impl_reachability!();

    fn visit_edges(&self, visit: &mut dyn FnMut(RefHandle)) {
        for value in &self.values {
            visit_cell(value, visit);
        }
    }
}

// ── Futures ───────────────────────────────────────────────────────────

/// A handle on a scheduler promise.
#[derive(Debug)]
pub struct FutureRef {
    base: RefBase,
    promise: PromiseId,
    value: Option<DataCell>,
}

impl FutureRef {
    pub fn new(promise: PromiseId) -> Self {
        Self {
            base: RefBase::default(),
            promise,
            value: None,
        }
    }

    pub fn promise(&self) -> PromiseId {
        self.promise
    }

    pub fn value(&self) -> Option<&DataCell> {
        self.value.as_ref()
    }
}

impl AbstractRef for FutureRef {
    fn prepare_future(&mut self, promise: PromiseId) -> Result<()> {
        self.promise = promise;
        self.value = None;
        Ok(())
    }

    fn await_future(&self, scheduler: &mut SystemScheduler) -> Result<()> {
        match &self.value {
            Some(value) => scheduler.push_current(value.clone()),
            None => scheduler.await_promise(self.promise),
        }
    }

    fn resolve_future(&mut self, value: DataCell) -> Result<PromiseId> {
        if self.value.is_some() {
            return Err(InterpreterStatus::invariant("future already resolved"));
        }
        self.value = Some(value);
        Ok(self.promise)
    }

    fn settle_future(&mut self, value: DataCell) {
        self.value.get_or_insert(value);
    }

    fn to_string_value(&self) -> String {
        match &self.value {
            Some(value) => format!("<future {value}>"),
            None => "<future pending>".to_owned(),
        }
    }

    impl_reachability!();

    fn visit_edges(&self, visit: &mut dyn FnMut(RefHandle)) {
        if let Some(value) = &self.value {
            visit_cell(value, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_strings_round_trip() {
        for text in ["café", "🚀", "plain", ""] {
            let string = StringRef::from_literal(Arc::from(text));
            assert!(string.storage().is_borrowed());
            assert_eq!(string.utf8_value(), Some(text));
            assert_eq!(string.as_str().as_bytes(), text.as_bytes());
        }
    }

    #[test]
    fn length_counts_code_points() {
        let string = StringRef::owned("café🚀".into());
        assert_eq!(string.length(), 5);
        assert_eq!(string.raw_size(), "café🚀".len());
        assert_eq!(string.char_at(3), Some('é'));
        assert_eq!(string.char_at(4), Some('🚀'));
        assert_eq!(string.char_at(5), None);
    }

    #[test]
    fn strings_order_by_code_point() {
        let (a, b, c) = ("apple", "banana", "banana");
        assert_eq!(string_compare(a, b), Ordering::Less);
        assert_eq!(string_compare(b, c), Ordering::Equal);
        assert_eq!(string_compare(b, a), Ordering::Greater);
        assert_eq!(string_compare("é", "z"), Ordering::Greater);
        assert_eq!(string_compare("ab", "abc"), Ordering::Less);
    }

    #[test]
    fn string_equality_and_hashing_are_by_content() {
        let borrowed = StringRef::from_literal(Arc::from("same"));
        let owned = StringRef::owned("same".into());
        let other = StringRef::owned("other".into());
        assert!(borrowed.equals(&owned));
        assert!(!borrowed.equals(&other));
        assert_eq!(borrowed.hash_value(), owned.hash_value());

        let mut out = [0u8; 3];
        assert_eq!(owned.raw_copy(1, &mut out), 3);
        assert_eq!(&out, b"ame");
        assert_eq!(owned.raw_copy(10, &mut out), 0);
    }

    #[test]
    fn rest_refs_iterate_in_call_order() {
        let mut rest = RestRef::new(vec![DataCell::for_i64(1), DataCell::Nil]);
        assert_eq!(rest.to_string_value(), "<rest of 2>");
        assert_eq!(rest.iterator_next().unwrap(), DataCell::I64(1));
        assert!(rest.iterator_valid());
        assert_eq!(rest.iterator_next().unwrap(), DataCell::Nil);
        assert!(!rest.iterator_valid());
        assert!(rest.iterator_next().is_err());
        assert_eq!(rest.values().len(), 2);
    }

    #[test]
    fn futures_resolve_once() {
        let mut future = FutureRef::new(PromiseId::from_raw(4));
        assert_eq!(future.to_string_value(), "<future pending>");
        assert_eq!(
            future.resolve_future(DataCell::for_i64(1)).unwrap(),
            PromiseId::from_raw(4)
        );
        assert!(future.resolve_future(DataCell::Nil).is_err());
        assert_eq!(future.value(), Some(&DataCell::I64(1)));

        let string = StringRef::owned("x".into());
        let err = string.get_field(&Descriptor::new(crate::DescriptorKind::Field, 0, 0));
        assert!(err.unwrap_err().is(InterpreterCondition::InvalidReceiver));
    }
}
