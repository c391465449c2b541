//! Automagic synthesis: grow the reader's schema to match whatever the
//! stream declares.
//!
//! Every lazy class, store, and field left after header reconciliation gets
//! a synthesized schema element, after which instance reading proceeds as
//! if the model had been declared up front. Synthesized classes live in a
//! per-document namespace (`automagic.m{ordinal}`), so two documents
//! declaring differently-shaped classes under one serial name synthesize
//! disjoint classes and still round-trip exactly.

use std::collections::HashMap;

use tracing::debug;

use crate::field::FieldKind;
use crate::rt::{flags_match, KlassBind, Rt};
use crate::schema::{next_uid, AnnSchema, DocSchema, FieldSchema, StoreSchema};

pub(crate) struct Automagic {
    /// Ordinal of the document currently being read.
    count: u64,
    /// How much of the schema was user-declared. Read-time class and store
    /// lookups stop here, so synthesized elements never capture a later
    /// document's declarations.
    base_klasses: usize,
    base_stores: usize,
    /// Synthesized classes, keyed by (document ordinal, serial).
    synthetic: HashMap<(u64, String), usize>,
}

impl Automagic {
    pub fn new(schema: &DocSchema) -> Automagic {
        Automagic {
            count: 0,
            base_klasses: schema.klasses.len(),
            base_stores: schema.stores.len(),
            synthetic: HashMap::new(),
        }
    }

    /// The document schema a reader starts from when no model is supplied.
    pub fn bare_schema() -> DocSchema {
        DocSchema {
            uid: next_uid(),
            name: "automagic.m0.Doc".to_owned(),
            serial: "Doc".to_owned(),
            fields: Vec::new(),
            stores: Vec::new(),
            klasses: Vec::new(),
        }
    }

    pub fn base_klasses(&self) -> usize {
        self.base_klasses
    }

    pub fn base_stores(&self) -> usize {
        self.base_stores
    }

    pub fn bump(&mut self) {
        self.count += 1;
    }

    /// Bind every lazy element of `rt`, synthesizing schema elements as
    /// needed: classes first, then stores, then fields (a synthesized
    /// pointer field needs its target store bound).
    pub fn synthesize(&mut self, schema: &mut DocSchema, rt: &mut Rt) {
        for klass in rt.klasses.iter_mut().filter(|k| k.is_lazy()) {
            let key = (self.count, klass.serial.clone());
            let at = *self.synthetic.entry(key).or_insert_with(|| {
                debug!(serial = %klass.serial, ordinal = self.count, "synthesizing class");
                schema.klasses.push(AnnSchema {
                    name: format!("automagic.m{}.{}", self.count, klass.serial),
                    serial: klass.serial.clone(),
                    fields: Vec::new(),
                });
                schema.klasses.len() - 1
            });
            klass.defn = Some(KlassBind::Ann(at));
        }

        let Rt { klasses, stores, .. } = rt;

        for store in stores.iter_mut().filter(|s| s.is_lazy()) {
            let Some(KlassBind::Ann(stored)) = klasses[store.klass].defn else {
                continue;
            };
            debug!(serial = %store.serial, "synthesizing store");
            schema.stores.push(StoreSchema {
                name: store.serial.clone(),
                serial: store.serial.clone(),
                klass: stored,
            });
            store.defn = Some(schema.stores.len() - 1);
        }

        for klass in klasses.iter_mut() {
            let Some(bind) = klass.defn else { continue };
            for field in klass.fields.iter_mut().filter(|f| f.is_lazy()) {
                let fields = match bind {
                    KlassBind::Doc => &mut schema.fields,
                    KlassBind::Ann(at) => &mut schema.klasses[at].fields,
                };

                // An earlier document may have synthesized this field onto
                // the same class already.
                if let Some(at) = fields
                    .iter()
                    .position(|f| f.serial == field.serial && flags_match(f, field))
                {
                    field.defn = Some(at);
                    continue;
                }

                let kind = if field.is_self_pointer {
                    if field.is_collection {
                        FieldKind::SelfPointers
                    } else {
                        FieldKind::SelfPointer
                    }
                } else if field.is_slice {
                    if field.is_pointer() {
                        FieldKind::AnnSlice
                    } else {
                        FieldKind::ByteSlice
                    }
                } else if field.is_pointer() {
                    if field.is_collection {
                        FieldKind::Pointers
                    } else {
                        FieldKind::Pointer
                    }
                } else {
                    FieldKind::Scalar
                };

                let points_to = if kind.is_pointer() {
                    field
                        .points_to
                        .and_then(|store_id| stores.get(store_id))
                        .and_then(|rtstore| rtstore.defn)
                } else {
                    None
                };

                debug!(serial = %field.serial, ?kind, "synthesizing field");
                fields.push(FieldSchema {
                    name: field.serial.clone(),
                    serial: field.serial.clone(),
                    help: None,
                    kind,
                    points_to,
                });
                field.defn = Some(fields.len() - 1);
            }
        }
    }
}
