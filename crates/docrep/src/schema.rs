//! Resolved schemas: the normalized, cross-linked view of a registered
//! document class.
//!
//! A [`DocSchema`] owns every element of the graph; cross links are indices
//! (a pointer field links to a position in [`DocSchema::stores`], a store to
//! a position in [`DocSchema::klasses`]), which keeps the naturally cyclic
//! pointer graph representable without reference counting.

use std::sync::atomic::{AtomicU64, Ordering};

use encoding_rs::Encoding;

use crate::field::FieldKind;
use crate::model::{AnnHandle, ClassRef, DefKind, DocHandle, FieldDef, Registry};

#[derive(thiserror::Error, Debug)]
pub enum DependencyError {
    #[error("unknown class {name:?}{hint}")]
    UnknownKlass { name: String, hint: String },
    #[error("class handle is not from this registry")]
    ForeignHandle,
    #[error("no store holds class {klass:?} (field {field:?})")]
    NoStore { klass: String, field: String },
    #[error("multiple stores hold class {klass:?}; field {field:?} must name one")]
    AmbiguousPointer { klass: String, field: String },
    #[error("store {store:?} does not exist (field {field:?})")]
    UnknownStore { store: String, field: String },
    #[error("store {store:?} holds class {stored:?} but field {field:?} targets {klass:?}")]
    WrongStoreType {
        store: String,
        stored: String,
        klass: String,
        field: String,
    },
    #[error("unknown text encoding {label:?} (field {field:?})")]
    UnknownEncoding { label: String, field: String },
    #[error("self-pointer field {field:?} is not allowed on document class {klass:?}")]
    DocSelfPointer { field: String, klass: String },
    #[error("explicit store {store:?} on non-pointer field {field:?}")]
    StoreOnNonPointer { store: String, field: String },
    #[error("store_empty on non-text field {field:?}")]
    StoreEmptyOnNonText { field: String },
}

/// One resolved field.
#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub(crate) name: String,
    pub(crate) serial: String,
    pub(crate) help: Option<String>,
    pub(crate) kind: FieldKind,
    pub(crate) points_to: Option<usize>,
}

impl FieldSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// For pointer kinds and typed slices: the targeted position in
    /// [`DocSchema::stores`].
    pub fn points_to(&self) -> Option<usize> {
        self.points_to
    }
}

/// One resolved annotation class.
#[derive(Clone, Debug)]
pub struct AnnSchema {
    pub(crate) name: String,
    pub(crate) serial: String,
    pub(crate) fields: Vec<FieldSchema>,
}

impl AnnSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }
}

/// One resolved store.
#[derive(Clone, Debug)]
pub struct StoreSchema {
    pub(crate) name: String,
    pub(crate) serial: String,
    pub(crate) klass: usize,
}

impl StoreSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Position of the stored class in [`DocSchema::klasses`].
    pub fn klass(&self) -> usize {
        self.klass
    }
}

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// The resolved schema of a document class: its direct fields, its stores,
/// and every annotation class those stores hold.
///
/// Immutable once built, except that a reader in automagic mode appends
/// synthesized elements. Existing positions never change, so runtime
/// schemas built against earlier revisions stay valid.
#[derive(Clone, Debug)]
pub struct DocSchema {
    pub(crate) uid: u64,
    pub(crate) name: String,
    pub(crate) serial: String,
    pub(crate) fields: Vec<FieldSchema>,
    pub(crate) stores: Vec<StoreSchema>,
    pub(crate) klasses: Vec<AnnSchema>,
}

impl DocSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn stores(&self) -> &[StoreSchema] {
        &self.stores
    }

    pub fn klasses(&self) -> &[AnnSchema] {
        &self.klasses
    }

    /// First klass whose serial matches, looking only at the first `limit`
    /// entries (a reader in automagic mode restricts lookups to the
    /// user-declared prefix).
    pub(crate) fn klass_by_serial(&self, serial: &str, limit: usize) -> Option<usize> {
        self.klasses[..limit].iter().position(|k| k.serial == serial)
    }

    pub(crate) fn store_by_serial(&self, serial: &str, limit: usize) -> Option<usize> {
        self.stores[..limit].iter().position(|s| s.serial == serial)
    }
}

impl Registry {
    /// Resolve a registered document class into a [`DocSchema`].
    pub fn schema(&self, doc: DocHandle) -> Result<DocSchema, DependencyError> {
        if doc.0 >= self.docs.len() {
            return Err(DependencyError::ForeignHandle);
        }
        let def = self.doc(doc);

        // Stores first: the klass list is the stored classes in store
        // declaration order, de-duplicated.
        let mut handles: Vec<AnnHandle> = Vec::new();
        let mut stores = Vec::with_capacity(def.stores.len());
        let mut store_handles = Vec::with_capacity(def.stores.len());
        for (name, store) in &def.stores {
            let handle = self.resolve(&store.stored)?;
            let klass = match handles.iter().position(|h| *h == handle) {
                Some(at) => at,
                None => {
                    handles.push(handle);
                    handles.len() - 1
                }
            };
            stores.push(StoreSchema {
                name: name.clone(),
                serial: store.serial.clone().unwrap_or_else(|| name.clone()),
                klass,
            });
            store_handles.push(handle);
        }

        let resolver = FieldResolver {
            registry: self,
            store_names: def.stores.keys().map(String::as_str).collect(),
            store_handles,
        };

        let mut fields = Vec::with_capacity(def.fields.len());
        for (name, field) in &def.fields {
            fields.push(resolver.resolve_field(&def.name, name, field, true)?);
        }

        let mut klasses = Vec::with_capacity(handles.len());
        for handle in &handles {
            let ann = self.ann(*handle);
            let mut fields = Vec::with_capacity(ann.fields.len());
            for (name, field) in &ann.fields {
                fields.push(resolver.resolve_field(&ann.name, name, field, false)?);
            }
            klasses.push(AnnSchema {
                name: ann.name.clone(),
                serial: ann.serial.clone(),
                fields,
            });
        }

        Ok(DocSchema {
            uid: next_uid(),
            name: def.name.clone(),
            serial: def.serial.clone(),
            fields,
            stores,
            klasses,
        })
    }

    fn resolve(&self, target: &ClassRef) -> Result<AnnHandle, DependencyError> {
        match target {
            ClassRef::Handle(handle) => {
                if handle.0 >= self.anns.len() {
                    return Err(DependencyError::ForeignHandle);
                }
                Ok(*handle)
            }
            ClassRef::Name(name) => self.find(name).ok_or_else(|| {
                let hint = match self.suggest(name) {
                    Some(candidate) => format!(" (did you mean {candidate:?}?)"),
                    None => String::new(),
                };
                DependencyError::UnknownKlass {
                    name: name.clone(),
                    hint,
                }
            }),
        }
    }
}

struct FieldResolver<'a> {
    registry: &'a Registry,
    store_names: Vec<&'a str>,
    store_handles: Vec<AnnHandle>,
}

impl FieldResolver<'_> {
    fn resolve_field(
        &self,
        owner: &str,
        name: &str,
        def: &FieldDef,
        on_doc: bool,
    ) -> Result<FieldSchema, DependencyError> {
        let field = format!("{owner}.{name}");

        if def.store_empty && !matches!(def.kind, DefKind::Text { .. }) {
            return Err(DependencyError::StoreEmptyOnNonText { field });
        }
        let pointer_like = matches!(
            def.kind,
            DefKind::Pointer { .. } | DefKind::Slice { target: Some(_) }
        );
        if let (Some(store), false) = (&def.store, pointer_like) {
            return Err(DependencyError::StoreOnNonPointer {
                store: store.clone(),
                field,
            });
        }

        let (kind, points_to) = match &def.kind {
            DefKind::Scalar => (FieldKind::Scalar, None),
            DefKind::DateTime => (FieldKind::DateTime, None),
            DefKind::Text { encoding } => {
                let encoding: &'static Encoding = Encoding::for_label(encoding.as_bytes())
                    .ok_or_else(|| DependencyError::UnknownEncoding {
                        label: encoding.clone(),
                        field: field.clone(),
                    })?;
                (
                    FieldKind::Text {
                        encoding,
                        store_empty: def.store_empty,
                    },
                    None,
                )
            }
            DefKind::Slice { target: None } => (FieldKind::ByteSlice, None),
            DefKind::Slice {
                target: Some(target),
            } => {
                let at = self.find_store(target, def.store.as_deref(), &field)?;
                (FieldKind::AnnSlice, Some(at))
            }
            DefKind::Pointer { target, collection } => {
                let at = self.find_store(target, def.store.as_deref(), &field)?;
                let kind = if *collection {
                    FieldKind::Pointers
                } else {
                    FieldKind::Pointer
                };
                (kind, Some(at))
            }
            DefKind::SelfPointer { collection } => {
                if on_doc {
                    return Err(DependencyError::DocSelfPointer {
                        field,
                        klass: owner.to_owned(),
                    });
                }
                let kind = if *collection {
                    FieldKind::SelfPointers
                } else {
                    FieldKind::SelfPointer
                };
                (kind, None)
            }
        };

        Ok(FieldSchema {
            name: name.to_owned(),
            serial: def.serial.clone().unwrap_or_else(|| name.to_owned()),
            help: def.help.clone(),
            kind,
            points_to,
        })
    }

    /// The store a pointer field targets: the named one if the field names
    /// a store, otherwise the single store holding the target class.
    fn find_store(
        &self,
        target: &ClassRef,
        explicit: Option<&str>,
        field: &str,
    ) -> Result<usize, DependencyError> {
        let target = self.registry.resolve(target)?;

        if let Some(store) = explicit {
            let at = self
                .store_names
                .iter()
                .position(|name| *name == store)
                .ok_or_else(|| DependencyError::UnknownStore {
                    store: store.to_owned(),
                    field: field.to_owned(),
                })?;
            if self.store_handles[at] != target {
                return Err(DependencyError::WrongStoreType {
                    store: store.to_owned(),
                    stored: self.registry.ann(self.store_handles[at]).name.clone(),
                    klass: self.registry.ann(target).name.clone(),
                    field: field.to_owned(),
                });
            }
            return Ok(at);
        }

        let mut matches = self
            .store_handles
            .iter()
            .enumerate()
            .filter(|(_, handle)| **handle == target);
        match (matches.next(), matches.next()) {
            (Some((at, _)), None) => Ok(at),
            (None, _) => Err(DependencyError::NoStore {
                klass: self.registry.ann(target).name.clone(),
                field: field.to_owned(),
            }),
            (Some(_), Some(_)) => Err(DependencyError::AmbiguousPointer {
                klass: self.registry.ann(target).name.clone(),
                field: field.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::model::{AnnDef, DocDef, FieldDef, Registry, StoreDef};
    use crate::{DependencyError, FieldKind};

    fn registry_with_node() -> (Registry, crate::model::AnnHandle) {
        let mut registry = Registry::new();
        let node = registry
            .annotation(
                AnnDef::new("graph.Node")
                    .field("label", FieldDef::scalar())
                    .field("parent", FieldDef::self_pointer()),
            )
            .unwrap();
        (registry, node)
    }

    #[test]
    fn test_build_links_pointers_to_stores() {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("w.A").field("value", FieldDef::scalar()))
            .unwrap();
        registry
            .annotation(AnnDef::new("w.Y").field("p", FieldDef::pointer("w.A").store("as_")))
            .unwrap();
        let doc = registry
            .document(
                DocDef::new("w.DocWithAY")
                    .store("as_", StoreDef::of("w.A").serial("as"))
                    .store("ys", StoreDef::of("w.Y")),
            )
            .unwrap();

        let schema = registry.schema(doc).unwrap();
        assert_eq!(schema.stores().len(), 2);
        assert_eq!(schema.stores()[0].serial(), "as");
        assert_eq!(schema.klasses()[1].serial(), "Y");

        let p = &schema.klasses()[1].fields()[0];
        assert_eq!(p.kind(), FieldKind::Pointer);
        assert_eq!(p.points_to(), Some(0));
    }

    #[test]
    fn test_ambiguous_pointer_rejected() {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("w.A").field("value", FieldDef::scalar()))
            .unwrap();
        registry
            .annotation(AnnDef::new("w.Y").field("p", FieldDef::pointer("w.A")))
            .unwrap();
        let doc = registry
            .document(
                DocDef::new("w.Doc")
                    .store("as1", StoreDef::of("w.A"))
                    .store("as2", StoreDef::of("w.A"))
                    .store("ys", StoreDef::of("w.Y")),
            )
            .unwrap();

        let err = registry.schema(doc).unwrap_err();
        assert!(matches!(err, DependencyError::AmbiguousPointer { .. }));
    }

    #[test]
    fn test_unknown_class_suggests() {
        let (mut registry, _) = registry_with_node();
        let doc = registry
            .document(DocDef::new("graph.Doc").store("nodes", StoreDef::of("Node")))
            .unwrap();

        let err = registry.schema(doc).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unknown class \"Node\""), "{message}");
        assert!(message.contains("did you mean \"graph.Node\"?"), "{message}");
    }

    #[test]
    fn test_wrong_store_type() {
        let mut registry = Registry::new();
        registry.annotation(AnnDef::new("w.A")).unwrap();
        registry.annotation(AnnDef::new("w.B")).unwrap();
        registry
            .annotation(AnnDef::new("w.Y").field("p", FieldDef::pointer("w.A").store("bs")))
            .unwrap();
        let doc = registry
            .document(
                DocDef::new("w.Doc")
                    .store("as_", StoreDef::of("w.A"))
                    .store("bs", StoreDef::of("w.B"))
                    .store("ys", StoreDef::of("w.Y")),
            )
            .unwrap();

        let err = registry.schema(doc).unwrap_err();
        assert!(matches!(err, DependencyError::WrongStoreType { .. }));
    }

    #[test]
    fn test_self_pointer_not_allowed_on_document() {
        let (mut registry, _) = registry_with_node();
        let doc = registry
            .document(
                DocDef::new("graph.Doc")
                    .field("root", FieldDef::self_pointer())
                    .store("nodes", StoreDef::of("graph.Node")),
            )
            .unwrap();

        let err = registry.schema(doc).unwrap_err();
        assert!(matches!(err, DependencyError::DocSelfPointer { .. }));
    }

    #[test]
    fn test_slices_resolve() {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("nlp.Token").field("span", FieldDef::byte_slice()))
            .unwrap();
        registry
            .annotation(AnnDef::new("nlp.Sent").field("span", FieldDef::slice("nlp.Token")))
            .unwrap();
        let doc = registry
            .document(
                DocDef::new("nlp.Doc")
                    .store("tokens", StoreDef::of("nlp.Token"))
                    .store("sents", StoreDef::of("nlp.Sent")),
            )
            .unwrap();

        let schema = registry.schema(doc).unwrap();
        let token_span = &schema.klasses()[0].fields()[0];
        assert_eq!(token_span.kind(), FieldKind::ByteSlice);
        assert_eq!(token_span.points_to(), None);

        let sent_span = &schema.klasses()[1].fields()[0];
        assert_eq!(sent_span.kind(), FieldKind::AnnSlice);
        assert_eq!(sent_span.points_to(), Some(0));
    }

    #[test]
    fn test_unknown_encoding() {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("w.X").field("text", FieldDef::text("not-a-charset")))
            .unwrap();
        let doc = registry
            .document(DocDef::new("w.Doc").store("xs", StoreDef::of("w.X")))
            .unwrap();

        assert!(matches!(
            registry.schema(doc).unwrap_err(),
            DependencyError::UnknownEncoding { .. }
        ));
    }
}
