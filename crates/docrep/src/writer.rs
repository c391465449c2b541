//! The stream writer: attaches or merges a runtime schema, stamps store
//! indices, and emits the envelope: headers, the document instance, then
//! one length-prefixed payload per store, with lazy regions re-emitted
//! byte-for-byte.

use std::collections::BTreeMap;
use std::io::{self, Write};

use rmp::encode::{write_array_len, write_map_len, write_str, write_str_len, write_uint};
use tracing::trace;

use crate::doc::{Ann, Document};
use crate::field::{EncodeFault, PointerCtx, Wire};
use crate::rt::{self, KlassBind, Rt};
use crate::schema::DocSchema;
use crate::value::Value;
use crate::wire::{self, field_type};

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error(
        "cannot serialize pointer in field {field:?} of class {klass:?} to an \
         annotation that is not not in any store"
    )]
    DanglingPointer { field: String, klass: String },
    #[error(
        "cannot serialize pointer in field {field:?} of class {klass:?} to an \
         annotation not in store {store:?}"
    )]
    NotInStore {
        field: String,
        klass: String,
        store: String,
    },
    #[error("cannot serialize field {field:?} of class {klass:?}: expected {expected}, got {found}")]
    BadValue {
        field: String,
        klass: String,
        expected: &'static str,
        found: String,
    },
    #[error("cannot serialize pointer field {field:?} of class {klass:?}: no target store")]
    NoTargetStore { field: String, klass: String },
    #[error("the write schema does not cover {kind} {serial:?} attached to this document")]
    SchemaGap { kind: &'static str, serial: String },
}

fn codec_err(err: rmp::encode::ValueWriteError) -> io::Error {
    match err {
        rmp::encode::ValueWriteError::InvalidMarkerWrite(err)
        | rmp::encode::ValueWriteError::InvalidDataWrite(err) => err,
    }
}

fn value_err(err: rmpv::encode::Error) -> io::Error {
    match err {
        rmpv::encode::Error::InvalidMarkerWrite(err)
        | rmpv::encode::Error::InvalidDataWrite(err) => err,
    }
}

/// A cursor emitting serialized documents onto an output stream.
pub struct Writer<W: Write> {
    output: W,
    schema: DocSchema,
}

impl<W: Write> Writer<W> {
    pub fn new(output: W, schema: DocSchema) -> Writer<W> {
        Writer { output, schema }
    }

    pub fn schema(&self) -> &DocSchema {
        &self.schema
    }

    /// Serialize one document.
    ///
    /// The document's runtime schema is built on first write and merged with
    /// the writer's schema on every later one, keeping wire ids stable.
    /// On error the document may have been partially emitted; callers that
    /// need atomic output should stage into a buffer.
    pub fn write(&mut self, doc: &mut Document) -> Result<(), WriteError> {
        let rtm = match doc.rt.take() {
            Some(mut rtm) => {
                rt::merge(&mut rtm, &self.schema)?;
                rtm
            }
            None => rt::build(&self.schema)?,
        };

        // Stores the merged runtime schema knows must exist on the document,
        // if only to serialize as empty.
        for rtstore in &rtm.stores {
            if let Some(at) = rtstore.defn {
                doc.ensure_store(&self.schema.stores[at].name);
            }
        }

        self.stamp_indices(&rtm, doc);

        write_uint(&mut self.output, wire::VERSION).map_err(codec_err)?;
        self.write_klasses(&rtm)?;
        self.write_stores(&rtm, doc)?;

        let get = |name: &str| doc.get(name);
        let instance = self.encode_instance(&rtm, rtm.doc, &get, &doc.lazy, None, doc)?;
        self.write_prefixed(&instance)?;

        self.write_store_instances(&rtm, doc)?;

        doc.rt = Some(rtm);
        Ok(())
    }

    /// Stamp every store member with its current position. Pointer encoding
    /// validates against these stamps.
    fn stamp_indices(&self, rt: &Rt, doc: &Document) {
        for rtstore in &rt.stores {
            let Some(at) = rtstore.defn else { continue };
            let Some(store) = doc.store(&self.schema.stores[at].name) else {
                continue;
            };
            for (i, ann) in store.iter().enumerate() {
                ann.set_index(Some(i));
            }
        }
    }

    fn write_klasses(&mut self, rt: &Rt) -> Result<(), WriteError> {
        write_array_len(&mut self.output, rt.klasses.len() as u32).map_err(codec_err)?;
        for (at, klass) in rt.klasses.iter().enumerate() {
            write_array_len(&mut self.output, 2).map_err(codec_err)?;

            let name: &str = if at == rt.doc {
                "__meta__"
            } else if let Some(KlassBind::Ann(i)) = klass.defn {
                &self.schema.klasses[i].serial
            } else {
                &klass.serial
            };
            write_str(&mut self.output, name).map_err(codec_err)?;

            write_array_len(&mut self.output, klass.fields.len() as u32).map_err(codec_err)?;
            for field in &klass.fields {
                let entries = 1
                    + field.is_pointer() as u32
                    + field.is_slice as u32
                    + field.is_self_pointer as u32
                    + field.is_collection as u32;
                write_map_len(&mut self.output, entries).map_err(codec_err)?;

                write_uint(&mut self.output, field_type::NAME).map_err(codec_err)?;
                let serial: &str = match (klass.defn, field.defn) {
                    (Some(bind), Some(defn)) => &rt::fields_of(&self.schema, bind)[defn].serial,
                    _ => &field.serial,
                };
                write_str(&mut self.output, serial).map_err(codec_err)?;

                if let Some(store_id) = field.points_to {
                    write_uint(&mut self.output, field_type::POINTER_TO).map_err(codec_err)?;
                    write_uint(&mut self.output, store_id as u64).map_err(codec_err)?;
                }
                if field.is_slice {
                    write_uint(&mut self.output, field_type::IS_SLICE).map_err(codec_err)?;
                    rmpv::encode::write_value(&mut self.output, &rmpv::Value::Nil).map_err(value_err)?;
                }
                if field.is_self_pointer {
                    write_uint(&mut self.output, field_type::IS_SELF_POINTER).map_err(codec_err)?;
                    rmpv::encode::write_value(&mut self.output, &rmpv::Value::Nil).map_err(value_err)?;
                }
                if field.is_collection {
                    write_uint(&mut self.output, field_type::IS_COLLECTION).map_err(codec_err)?;
                    rmpv::encode::write_value(&mut self.output, &rmpv::Value::Nil).map_err(value_err)?;
                }
            }
        }
        Ok(())
    }

    fn write_stores(&mut self, rt: &Rt, doc: &Document) -> Result<(), WriteError> {
        write_array_len(&mut self.output, rt.stores.len() as u32).map_err(codec_err)?;
        for rtstore in &rt.stores {
            write_array_len(&mut self.output, 3).map_err(codec_err)?;
            let (serial, nelem): (&str, u64) = match rtstore.defn {
                Some(at) => {
                    let schema_store = &self.schema.stores[at];
                    let nelem = doc
                        .store(&schema_store.name)
                        .map(|s| s.len() as u64)
                        .unwrap_or(0);
                    (&schema_store.serial, nelem)
                }
                None => (&rtstore.serial, rtstore.nelem),
            };
            write_str(&mut self.output, serial).map_err(codec_err)?;
            write_uint(&mut self.output, rtstore.klass as u64).map_err(codec_err)?;
            write_uint(&mut self.output, nelem).map_err(codec_err)?;
        }
        Ok(())
    }

    fn write_store_instances(&mut self, rt: &Rt, doc: &Document) -> Result<(), WriteError> {
        for rtstore in &rt.stores {
            let Some(at) = rtstore.defn else {
                // Lazy stores re-emit exactly the bytes that were read.
                match &rtstore.lazy {
                    Some(blob) => {
                        write_uint(&mut self.output, blob.len() as u64).map_err(codec_err)?;
                        self.output.write_all(blob)?;
                    }
                    None => {
                        // A lazy store with no retained payload has nothing
                        // to say: an empty instance array.
                        let empty = [0x90u8];
                        write_uint(&mut self.output, empty.len() as u64).map_err(codec_err)?;
                        self.output.write_all(&empty)?;
                    }
                }
                continue;
            };

            let name = &self.schema.stores[at].name;
            let anns: Vec<Ann> = match doc.store(name) {
                Some(store) => store.iter().cloned().collect(),
                None => Vec::new(),
            };

            let mut payload = Vec::new();
            write_array_len(&mut payload, anns.len() as u32).map_err(codec_err)?;
            for ann in &anns {
                let get = |field: &str| ann.get(field);
                let lazy = ann.lazy_snapshot();
                let instance =
                    self.encode_instance(rt, rtstore.klass, &get, &lazy, Some(name), doc)?;
                payload.extend_from_slice(&instance);
            }
            self.write_prefixed(&payload)?;
            trace!(store = %rtstore.serial, nelem = anns.len(), "wrote store payload");
        }
        Ok(())
    }

    /// Encode one instance map: lazy values merged with the encodable known
    /// fields, emitted in ascending field-id order. A known value wins over
    /// a lazy value under the same id.
    fn encode_instance(
        &self,
        rt: &Rt,
        klass_at: usize,
        get: &dyn Fn(&str) -> Value,
        lazy: &[(u64, rmpv::Value)],
        own_store: Option<&str>,
        doc: &Document,
    ) -> Result<Vec<u8>, WriteError> {
        let rtklass = &rt.klasses[klass_at];
        let klass_name = match rtklass.defn {
            Some(KlassBind::Doc) => self.schema.name.as_str(),
            Some(KlassBind::Ann(i)) => self.schema.klasses[i].name.as_str(),
            None => rtklass.serial.as_str(),
        };

        let mut entries: BTreeMap<u64, Wire> = BTreeMap::new();
        for (id, value) in lazy {
            entries.insert(*id, Wire::Value(value.clone()));
        }

        for (id, field) in rtklass.fields.iter().enumerate() {
            let (Some(bind), Some(defn)) = (rtklass.defn, field.defn) else {
                continue;
            };
            let schema_field = &rt::fields_of(&self.schema, bind)[defn];
            let value = get(&schema_field.name);
            if !schema_field.kind.should_write(&value) {
                continue;
            }

            let ctx = PointerCtx {
                target: field
                    .points_to
                    .and_then(|store_id| rt.stores.get(store_id))
                    .and_then(|rtstore| rtstore.defn)
                    .map(|at| &self.schema.stores[at])
                    .and_then(|schema_store| {
                        doc.store(&schema_store.name)
                            .map(|store| (schema_store.name.as_str(), store))
                    }),
                own: own_store.and_then(|name| doc.store(name).map(|store| (name, store))),
            };

            let wire = schema_field.kind.encode(&value, &ctx).map_err(|fault| {
                encode_fault(schema_field.name.clone(), klass_name.to_owned(), fault)
            })?;
            entries.insert(id as u64, wire);
        }

        let mut buf = Vec::new();
        write_map_len(&mut buf, entries.len() as u32).map_err(codec_err)?;
        for (id, wire) in entries {
            write_uint(&mut buf, id).map_err(codec_err)?;
            match wire {
                Wire::Value(value) => rmpv::encode::write_value(&mut buf, &value).map_err(value_err)?,
                Wire::Str(bytes) => {
                    write_str_len(&mut buf, bytes.len() as u32).map_err(codec_err)?;
                    buf.write_all(&bytes)?;
                }
            }
        }
        Ok(buf)
    }

    fn write_prefixed(&mut self, packed: &[u8]) -> Result<(), WriteError> {
        write_uint(&mut self.output, packed.len() as u64).map_err(codec_err)?;
        self.output.write_all(packed)?;
        Ok(())
    }
}

fn encode_fault(field: String, klass: String, fault: EncodeFault) -> WriteError {
    match fault {
        EncodeFault::Dangling => WriteError::DanglingPointer { field, klass },
        EncodeFault::NotInStore { store } => WriteError::NotInStore {
            field,
            klass,
            store,
        },
        EncodeFault::Type { expected, found } => WriteError::BadValue {
            field,
            klass,
            expected,
            found,
        },
        EncodeFault::NoStore => WriteError::NoTargetStore { field, klass },
    }
}
