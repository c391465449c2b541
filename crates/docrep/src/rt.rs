//! The runtime schema: a per-document overlay that fixes the numeric ids
//! (class, store, field) used on the wire, remembers which stream elements
//! the schema does not cover (*lazy* elements, carried as opaque bytes or
//! raw values), and links pointer fields to the runtime stores they target.
//!
//! Ids are positions: the id of a class, store, or field is its index in
//! the owning vector, so ids are dense and merging can only append.

use std::collections::HashSet;

use bytes::Bytes;
use itertools::Itertools;

use crate::schema::{DocSchema, FieldSchema};
use crate::writer::WriteError;

/// What a runtime class is bound to: the document class itself, or a
/// position in [`DocSchema::klasses`]. Unbound (lazy) classes carry `None`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum KlassBind {
    Doc,
    Ann(usize),
}

#[derive(Clone, Debug)]
pub(crate) struct RtField {
    pub serial: String,
    /// For pointer fields: the wire store id while headers are being read,
    /// then the runtime store index once backfilled. `Some` is what makes a
    /// field a pointer on the wire.
    pub points_to: Option<usize>,
    pub is_slice: bool,
    pub is_self_pointer: bool,
    pub is_collection: bool,
    /// Field position within the bound class schema; `None` is lazy.
    pub defn: Option<usize>,
}

impl RtField {
    pub fn is_pointer(&self) -> bool {
        self.points_to.is_some()
    }

    pub fn is_lazy(&self) -> bool {
        self.defn.is_none()
    }

    fn from_schema(field: &FieldSchema, defn: usize) -> RtField {
        RtField {
            serial: field.serial.clone(),
            // A placeholder until pointer targets are backfilled.
            points_to: if field.kind.is_pointer() { Some(0) } else { None },
            is_slice: field.kind.is_slice(),
            is_self_pointer: field.kind.is_self_pointer(),
            is_collection: field.kind.is_collection(),
            defn: Some(defn),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RtAnn {
    pub serial: String,
    pub defn: Option<KlassBind>,
    pub fields: Vec<RtField>,
}

impl RtAnn {
    pub fn is_lazy(&self) -> bool {
        self.defn.is_none()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RtStore {
    pub serial: String,
    /// Runtime class index of the stored class.
    pub klass: usize,
    /// Element count read from the stream; meaningful for lazy stores,
    /// recomputed from the in-memory store otherwise.
    pub nelem: u64,
    /// Store position within the schema; `None` is lazy.
    pub defn: Option<usize>,
    /// For lazy stores: the store payload, byte-exact, re-emitted verbatim.
    pub lazy: Option<Bytes>,
}

impl RtStore {
    pub fn is_lazy(&self) -> bool {
        self.defn.is_none()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Rt {
    /// Identity of the schema the `defn` indices are valid against.
    pub schema_uid: u64,
    /// Index of the document (`__meta__`) class in `klasses`.
    pub doc: usize,
    pub klasses: Vec<RtAnn>,
    pub stores: Vec<RtStore>,
}

pub(crate) fn fields_of<'s>(schema: &'s DocSchema, bind: KlassBind) -> &'s [FieldSchema] {
    match bind {
        KlassBind::Doc => &schema.fields,
        KlassBind::Ann(at) => &schema.klasses[at].fields,
    }
}

pub(crate) fn flags_match(field: &FieldSchema, rt: &RtField) -> bool {
    field.kind.is_pointer() == rt.is_pointer()
        && field.kind.is_slice() == rt.is_slice
        && field.kind.is_self_pointer() == rt.is_self_pointer
        && field.kind.is_collection() == rt.is_collection
}

/// A fresh runtime schema mirroring `schema`: the document class first, then
/// the schema's classes, stores, and fields in declaration order.
pub(crate) fn build(schema: &DocSchema) -> Result<Rt, WriteError> {
    let mut rt = Rt {
        schema_uid: schema.uid,
        doc: 0,
        klasses: vec![RtAnn {
            serial: "__meta__".to_owned(),
            defn: Some(KlassBind::Doc),
            fields: Vec::new(),
        }],
        stores: Vec::new(),
    };
    merge(&mut rt, schema)?;
    Ok(rt)
}

/// Merge `schema` into an existing runtime schema.
///
/// Already-assigned ids are preserved. Elements the runtime schema does not
/// yet know (matched by serial name) are appended with the next free id;
/// lazy elements the schema has been extended to cover become bound. When
/// `schema` is not the schema this runtime was built against, every bound
/// `defn` link is first re-resolved by serial name.
pub(crate) fn merge(rt: &mut Rt, schema: &DocSchema) -> Result<(), WriteError> {
    if rt.schema_uid != schema.uid {
        rebind(rt, schema)?;
    }

    // Bind lazy elements the schema now covers. A lazy store binding here
    // drops its opaque payload: nothing was materialized for it, so it
    // serializes from the (empty) in-memory store.
    for (at, klass) in rt.klasses.iter_mut().enumerate() {
        if at != rt.doc && klass.defn.is_none() {
            if let Some(found) = schema.klass_by_serial(&klass.serial, schema.klasses.len()) {
                klass.defn = Some(KlassBind::Ann(found));
            }
        }
    }
    for store in rt.stores.iter_mut() {
        if store.defn.is_some() {
            continue;
        }
        if let Some(found) = schema.store_by_serial(&store.serial, schema.stores.len()) {
            let stored = &schema.klasses[schema.stores[found].klass];
            if rt.klasses[store.klass].serial == stored.serial {
                store.defn = Some(found);
                store.lazy = None;
            }
        }
    }
    for klass in rt.klasses.iter_mut() {
        let Some(bind) = klass.defn else { continue };
        let fields = fields_of(schema, bind);
        for field in klass.fields.iter_mut().filter(|f| f.defn.is_none()) {
            if let Some(found) = fields
                .iter()
                .position(|f| f.serial == field.serial && flags_match(f, field))
            {
                field.defn = Some(found);
            }
        }
    }

    // Extend with schema elements the runtime schema has no serial for.
    let known: HashSet<String> = rt.klasses.iter().map(|k| k.serial.clone()).collect();
    for (at, klass) in schema
        .klasses
        .iter()
        .enumerate()
        .unique_by(|(_, k)| k.serial.clone())
    {
        if known.contains(&klass.serial) {
            continue;
        }
        rt.klasses.push(RtAnn {
            serial: klass.serial.clone(),
            defn: Some(KlassBind::Ann(at)),
            fields: klass
                .fields
                .iter()
                .enumerate()
                .map(|(fi, f)| RtField::from_schema(f, fi))
                .collect(),
        });
    }

    let known: HashSet<String> = rt.stores.iter().map(|s| s.serial.clone()).collect();
    for (at, store) in schema
        .stores
        .iter()
        .enumerate()
        .unique_by(|(_, s)| s.serial.clone())
    {
        if known.contains(&store.serial) {
            continue;
        }
        let stored = &schema.klasses[store.klass].serial;
        let klass = rt
            .klasses
            .iter()
            .position(|k| k.serial == *stored)
            .ok_or_else(|| WriteError::SchemaGap {
                kind: "class",
                serial: stored.clone(),
            })?;
        rt.stores.push(RtStore {
            serial: store.serial.clone(),
            klass,
            nelem: 0,
            defn: Some(at),
            lazy: None,
        });
    }

    for klass in rt.klasses.iter_mut() {
        let Some(bind) = klass.defn else { continue };
        let fields = fields_of(schema, bind);
        let known: HashSet<String> = klass.fields.iter().map(|f| f.serial.clone()).collect();
        for (at, field) in fields.iter().enumerate().unique_by(|(_, f)| f.serial.clone()) {
            if known.contains(&field.serial) {
                continue;
            }
            klass.fields.push(RtField::from_schema(field, at));
        }
    }

    backfill(rt, schema)?;
    rt.schema_uid = schema.uid;
    Ok(())
}

/// Re-resolve every bound `defn` link by serial against a different schema.
/// A bound element never goes lazy again, so an element the new schema does
/// not cover is an error.
fn rebind(rt: &mut Rt, schema: &DocSchema) -> Result<(), WriteError> {
    let doc = rt.doc;
    for (at, klass) in rt.klasses.iter_mut().enumerate() {
        if at == doc || klass.defn.is_none() {
            continue;
        }
        match schema.klass_by_serial(&klass.serial, schema.klasses.len()) {
            Some(found) => klass.defn = Some(KlassBind::Ann(found)),
            None => {
                return Err(WriteError::SchemaGap {
                    kind: "class",
                    serial: klass.serial.clone(),
                })
            }
        }
    }

    for klass in rt.klasses.iter_mut() {
        let Some(bind) = klass.defn else { continue };
        let fields = fields_of(schema, bind);
        for field in klass.fields.iter_mut().filter(|f| f.defn.is_some()) {
            match fields
                .iter()
                .position(|f| f.serial == field.serial && flags_match(f, field))
            {
                Some(found) => field.defn = Some(found),
                None => {
                    return Err(WriteError::SchemaGap {
                        kind: "field",
                        serial: field.serial.clone(),
                    })
                }
            }
        }
    }

    let klasses = &rt.klasses;
    for store in rt.stores.iter_mut().filter(|s| s.defn.is_some()) {
        let found = schema
            .store_by_serial(&store.serial, schema.stores.len())
            .filter(|found| {
                schema.klasses[schema.stores[*found].klass].serial == klasses[store.klass].serial
            });
        match found {
            Some(found) => store.defn = Some(found),
            None => {
                return Err(WriteError::SchemaGap {
                    kind: "store",
                    serial: store.serial.clone(),
                })
            }
        }
    }
    Ok(())
}

/// Point every bound pointer field at the runtime store its schema target
/// resolves to. Lazy pointer fields keep whatever the stream said.
fn backfill(rt: &mut Rt, schema: &DocSchema) -> Result<(), WriteError> {
    let Rt { klasses, stores, .. } = rt;
    for klass in klasses.iter_mut() {
        let Some(bind) = klass.defn else { continue };
        let fields = fields_of(schema, bind);
        for field in klass.fields.iter_mut() {
            let Some(defn) = field.defn else { continue };
            match fields[defn].points_to {
                Some(target) => {
                    let serial = &schema.stores[target].serial;
                    let at = stores
                        .iter()
                        .position(|s| s.serial == *serial)
                        .ok_or_else(|| WriteError::SchemaGap {
                            kind: "store",
                            serial: serial.clone(),
                        })?;
                    field.points_to = Some(at);
                }
                None => field.points_to = None,
            }
        }
    }
    Ok(())
}
