//! Class declaration: field and store descriptors, annotation and document
//! definitions, and the registry that resolves by-name references between
//! them.
//!
//! Definitions are plain data. They become usable for serialization once a
//! document definition is turned into a resolved [`DocSchema`] via
//! [`Registry::schema`].
//!
//! [`DocSchema`]: crate::DocSchema

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// A reference to an annotation class: either a registered handle, or a name
/// resolved lazily against the registry when a schema is built.
#[derive(Clone, Debug)]
pub enum ClassRef {
    Name(String),
    Handle(AnnHandle),
}

impl From<&str> for ClassRef {
    fn from(name: &str) -> ClassRef {
        ClassRef::Name(name.to_owned())
    }
}

impl From<String> for ClassRef {
    fn from(name: String) -> ClassRef {
        ClassRef::Name(name)
    }
}

impl From<AnnHandle> for ClassRef {
    fn from(handle: AnnHandle) -> ClassRef {
        ClassRef::Handle(handle)
    }
}

/// Handle for a registered annotation class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnnHandle(pub(crate) usize);

/// Handle for a registered document class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DocHandle(pub(crate) usize);

#[derive(Clone, Debug)]
pub(crate) enum DefKind {
    Scalar,
    DateTime,
    Text { encoding: String },
    Slice { target: Option<ClassRef> },
    Pointer { target: ClassRef, collection: bool },
    SelfPointer { collection: bool },
}

/// Declares one field of an annotation or document class.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub(crate) kind: DefKind,
    pub(crate) serial: Option<String>,
    pub(crate) help: Option<String>,
    pub(crate) store: Option<String>,
    pub(crate) store_empty: bool,
}

impl FieldDef {
    fn with_kind(kind: DefKind) -> FieldDef {
        FieldDef {
            kind,
            serial: None,
            help: None,
            store: None,
            store_empty: false,
        }
    }

    /// A pass-through scalar: any MessagePack value, identity on the wire.
    pub fn scalar() -> FieldDef {
        FieldDef::with_kind(DefKind::Scalar)
    }

    /// A datetime carried as ISO-8601 text on the wire.
    pub fn date_time() -> FieldDef {
        FieldDef::with_kind(DefKind::DateTime)
    }

    /// Text carried in the named encoding (a WHATWG label, e.g. `"utf-8"`).
    pub fn text(encoding: &str) -> FieldDef {
        FieldDef::with_kind(DefKind::Text {
            encoding: encoding.to_owned(),
        })
    }

    /// A byte slice: a half-open interval into external text.
    pub fn byte_slice() -> FieldDef {
        FieldDef::with_kind(DefKind::Slice { target: None })
    }

    /// A slice over the store holding `target` annotations.
    pub fn slice(target: impl Into<ClassRef>) -> FieldDef {
        FieldDef::with_kind(DefKind::Slice {
            target: Some(target.into()),
        })
    }

    /// A pointer to an annotation in the store holding `target` annotations.
    pub fn pointer(target: impl Into<ClassRef>) -> FieldDef {
        FieldDef::with_kind(DefKind::Pointer {
            target: target.into(),
            collection: false,
        })
    }

    /// A collection of pointers into the store holding `target` annotations.
    pub fn pointers(target: impl Into<ClassRef>) -> FieldDef {
        FieldDef::with_kind(DefKind::Pointer {
            target: target.into(),
            collection: true,
        })
    }

    /// A pointer into whichever store holds the annotation itself.
    pub fn self_pointer() -> FieldDef {
        FieldDef::with_kind(DefKind::SelfPointer { collection: false })
    }

    /// A collection of pointers into the owning store.
    pub fn self_pointers() -> FieldDef {
        FieldDef::with_kind(DefKind::SelfPointer { collection: true })
    }

    /// Override the wire name of this field.
    pub fn serial(mut self, serial: &str) -> FieldDef {
        self.serial = Some(serial.to_owned());
        self
    }

    pub fn help(mut self, help: &str) -> FieldDef {
        self.help = Some(help.to_owned());
        self
    }

    /// Name the store this pointer or typed slice targets. Required when
    /// more than one store holds the target class.
    pub fn store(mut self, name: &str) -> FieldDef {
        self.store = Some(name.to_owned());
        self
    }

    /// Serialize empty text rather than skipping it. Text fields only.
    pub fn store_empty(mut self, store_empty: bool) -> FieldDef {
        self.store_empty = store_empty;
        self
    }
}

/// Declares one store of a document class.
#[derive(Clone, Debug)]
pub struct StoreDef {
    pub(crate) stored: ClassRef,
    pub(crate) serial: Option<String>,
    pub(crate) help: Option<String>,
}

impl StoreDef {
    pub fn of(stored: impl Into<ClassRef>) -> StoreDef {
        StoreDef {
            stored: stored.into(),
            serial: None,
            help: None,
        }
    }

    pub fn serial(mut self, serial: &str) -> StoreDef {
        self.serial = Some(serial.to_owned());
        self
    }

    pub fn help(mut self, help: &str) -> StoreDef {
        self.help = Some(help.to_owned());
        self
    }
}

// The registration name is the full (possibly dotted) name; the wire serial
// defaults to the last dotted segment, as a class usually serializes under
// its bare name while registering under a namespaced one.
fn default_serial(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_owned()
}

/// Declares an annotation class: a named, ordered set of fields.
#[derive(Clone, Debug)]
pub struct AnnDef {
    pub(crate) name: String,
    pub(crate) serial: String,
    pub(crate) help: Option<String>,
    pub(crate) fields: IndexMap<String, FieldDef>,
}

impl AnnDef {
    pub fn new(name: &str) -> AnnDef {
        AnnDef {
            name: name.to_owned(),
            serial: default_serial(name),
            help: None,
            fields: IndexMap::new(),
        }
    }

    pub fn serial(mut self, serial: &str) -> AnnDef {
        self.serial = serial.to_owned();
        self
    }

    pub fn help(mut self, help: &str) -> AnnDef {
        self.help = Some(help.to_owned());
        self
    }

    pub fn field(mut self, name: &str, def: FieldDef) -> AnnDef {
        self.fields.insert(name.to_owned(), def);
        self
    }

    /// Inherit the fields of a base definition. Fields already declared on
    /// `self` keep their declaration; everything else is appended in the
    /// base's order.
    pub fn extend(mut self, base: &AnnDef) -> AnnDef {
        for (name, def) in &base.fields {
            if !self.fields.contains_key(name) {
                self.fields.insert(name.clone(), def.clone());
            }
        }
        self
    }
}

/// Declares a document class: fields plus an ordered set of stores.
///
/// Stores exist only on documents; an [`AnnDef`] has no store API.
#[derive(Clone, Debug)]
pub struct DocDef {
    pub(crate) name: String,
    pub(crate) serial: String,
    pub(crate) help: Option<String>,
    pub(crate) fields: IndexMap<String, FieldDef>,
    pub(crate) stores: IndexMap<String, StoreDef>,
}

impl DocDef {
    pub fn new(name: &str) -> DocDef {
        DocDef {
            name: name.to_owned(),
            serial: default_serial(name),
            help: None,
            fields: IndexMap::new(),
            stores: IndexMap::new(),
        }
    }

    pub fn serial(mut self, serial: &str) -> DocDef {
        self.serial = serial.to_owned();
        self
    }

    pub fn help(mut self, help: &str) -> DocDef {
        self.help = Some(help.to_owned());
        self
    }

    pub fn field(mut self, name: &str, def: FieldDef) -> DocDef {
        self.fields.insert(name.to_owned(), def);
        self
    }

    pub fn store(mut self, name: &str, def: StoreDef) -> DocDef {
        self.stores.insert(name.to_owned(), def);
        self
    }

    /// Inherit fields and stores of a base document definition.
    pub fn extend(mut self, base: &DocDef) -> DocDef {
        for (name, def) in &base.fields {
            if !self.fields.contains_key(name) {
                self.fields.insert(name.clone(), def.clone());
            }
        }
        for (name, def) in &base.stores {
            if !self.stores.contains_key(name) {
                self.stores.insert(name.clone(), def.clone());
            }
        }
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("the name {0:?} has already been registered by another class")]
    DuplicateName(String),
}

/// Holds registered class definitions and resolves names between them.
///
/// Registration names are unique across annotation and document classes.
/// The registry is written during model declaration and read at schema
/// build; it is an owned value, not process-global state.
#[derive(Default)]
pub struct Registry {
    pub(crate) anns: Vec<AnnDef>,
    pub(crate) docs: Vec<DocDef>,
    names: HashSet<String>,
    ann_by_name: HashMap<String, AnnHandle>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn annotation(&mut self, def: AnnDef) -> Result<AnnHandle, ModelError> {
        if self.names.contains(&def.name) {
            return Err(ModelError::DuplicateName(def.name));
        }
        let handle = AnnHandle(self.anns.len());
        self.names.insert(def.name.clone());
        self.ann_by_name.insert(def.name.clone(), handle);
        self.anns.push(def);
        Ok(handle)
    }

    pub fn document(&mut self, def: DocDef) -> Result<DocHandle, ModelError> {
        if self.names.contains(&def.name) {
            return Err(ModelError::DuplicateName(def.name));
        }
        let handle = DocHandle(self.docs.len());
        self.names.insert(def.name.clone());
        self.docs.push(def);
        Ok(handle)
    }

    /// Look up a registered annotation class by its full name. A miss
    /// suggests a registered name ending in `.{name}` when one exists.
    pub fn find(&self, name: &str) -> Option<AnnHandle> {
        self.ann_by_name.get(name).copied()
    }

    /// A "did you mean" candidate for a failed lookup: some registered
    /// annotation name whose final dotted segment matches.
    pub fn suggest(&self, name: &str) -> Option<&str> {
        let suffix = format!(".{}", name.rsplit('.').next().unwrap_or(name));
        self.anns
            .iter()
            .map(|def| def.name.as_str())
            .find(|candidate| candidate.ends_with(&suffix))
    }

    pub(crate) fn ann(&self, handle: AnnHandle) -> &AnnDef {
        &self.anns[handle.0]
    }

    pub(crate) fn doc(&self, handle: DocHandle) -> &DocDef {
        &self.docs[handle.0]
    }
}
