//! The in-memory document model.
//!
//! An [`Ann`] is a cheaply-clonable shared handle; pointer fields hold these
//! handles directly, and equality is object identity (annotation graphs are
//! cyclic, so structural equality is not defined). A [`Store`] owns the
//! ordered members of one annotation class; a [`Document`] owns its stores.
//!
//! Wire indices are translated to handles at read time and back at write
//! time through the stamped index: serialization stamps every member with
//! its position, and a pointer serializes as the target's stamped index
//! after checking the target really occupies that position in the field's
//! target store.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::rt::Rt;
use crate::schema::DocSchema;
use crate::value::Value;

#[derive(Default)]
struct AnnInner {
    fields: BTreeMap<String, Value>,
    index: Option<usize>,
    // Unknown-to-the-schema field values, keyed by wire field id, in wire
    // order. Re-emitted verbatim on write.
    lazy: Vec<(u64, rmpv::Value)>,
}

/// A shared handle to one annotation.
///
/// Cloning shares the annotation; `==` is identity. Field values are
/// accessed by name; reading an unset field yields [`Value::Null`].
#[derive(Clone, Default)]
pub struct Ann {
    inner: Rc<RefCell<AnnInner>>,
}

impl Ann {
    pub fn new() -> Ann {
        Ann::default()
    }

    pub fn get(&self, field: &str) -> Value {
        self.inner
            .borrow()
            .fields
            .get(field)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) {
        self.inner
            .borrow_mut()
            .fields
            .insert(field.to_owned(), value.into());
    }

    /// The position this annotation occupied in its store at the last
    /// serialization, if any. Stamped by the writer; cleared when the
    /// annotation is removed from a store.
    pub fn index(&self) -> Option<usize> {
        self.inner.borrow().index
    }

    pub fn ptr_eq(&self, other: &Ann) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot of the named field values.
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.inner
            .borrow()
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn set_index(&self, index: Option<usize>) {
        self.inner.borrow_mut().index = index;
    }

    pub(crate) fn lazy_insert(&self, id: u64, value: rmpv::Value) {
        self.inner.borrow_mut().lazy.push((id, value));
    }

    pub(crate) fn lazy_snapshot(&self) -> Vec<(u64, rmpv::Value)> {
        self.inner.borrow().lazy.clone()
    }
}

impl PartialEq for Ann {
    fn eq(&self, other: &Ann) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Ann {}

impl fmt::Debug for Ann {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let mut dbg = f.debug_struct("Ann");
        if let Some(index) = inner.index {
            dbg.field("index", &index);
        }
        for (name, value) in &inner.fields {
            dbg.field(name, value);
        }
        dbg.finish()
    }
}

/// An ordered sequence of annotations of one class, owned by a document.
#[derive(Default)]
pub struct Store {
    items: Vec<Ann>,
}

impl Store {
    pub(crate) fn new() -> Store {
        Store::default()
    }

    /// Create a new empty annotation at the end of the store.
    pub fn create(&mut self) -> Ann {
        let ann = Ann::new();
        self.items.push(ann.clone());
        ann
    }

    /// Append an annotation built elsewhere.
    pub fn append(&mut self, ann: Ann) {
        self.items.push(ann);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, at: usize) -> Option<Ann> {
        self.items.get(at).cloned()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ann> {
        self.items.iter()
    }

    /// Remove and return the annotation at `at`, clearing its stamped index:
    /// a pointer still referencing it fails the next serialization.
    ///
    /// Panics if `at` is out of range.
    pub fn remove(&mut self, at: usize) -> Ann {
        let ann = self.items.remove(at);
        ann.set_index(None);
        ann
    }

    pub fn truncate(&mut self, len: usize) {
        for ann in &self.items[len.min(self.items.len())..] {
            ann.set_index(None);
        }
        self.items.truncate(len);
    }

    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&Ann, &Ann) -> std::cmp::Ordering,
    {
        self.items.sort_by(compare);
    }

    pub(crate) fn create_n(&mut self, n: usize) {
        for _ in 0..n {
            self.create();
        }
    }
}

impl std::ops::Index<usize> for Store {
    type Output = Ann;

    fn index(&self, at: usize) -> &Ann {
        &self.items[at]
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

/// The root record: document-level field values plus named stores, and the
/// runtime schema attached by the last read or write.
pub struct Document {
    fields: BTreeMap<String, Value>,
    pub(crate) lazy: Vec<(u64, rmpv::Value)>,
    stores: IndexMap<String, Store>,
    pub(crate) rt: Option<Rt>,
}

impl Document {
    /// An empty document with one store per schema store.
    pub fn new(schema: &DocSchema) -> Document {
        let mut doc = Document {
            fields: BTreeMap::new(),
            lazy: Vec::new(),
            stores: IndexMap::new(),
            rt: None,
        };
        for store in schema.stores() {
            doc.ensure_store(store.name());
        }
        for field in schema.fields() {
            let default = field.kind().default_value();
            if !default.is_null() {
                doc.fields.insert(field.name().to_owned(), default);
            }
        }
        doc
    }

    pub fn get(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_owned(), value.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn store(&self, name: &str) -> Option<&Store> {
        self.stores.get(name)
    }

    pub fn store_mut(&mut self, name: &str) -> Option<&mut Store> {
        self.stores.get_mut(name)
    }

    pub fn stores(&self) -> impl Iterator<Item = (&str, &Store)> {
        self.stores.iter().map(|(name, store)| (name.as_str(), store))
    }

    pub(crate) fn ensure_store(&mut self, name: &str) -> &mut Store {
        if !self.stores.contains_key(name) {
            self.stores.insert(name.to_owned(), Store::new());
        }
        &mut self.stores[name]
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Document");
        for (name, value) in &self.fields {
            dbg.field(name, value);
        }
        for (name, store) in &self.stores {
            dbg.field(name, store);
        }
        dbg.finish()
    }
}
