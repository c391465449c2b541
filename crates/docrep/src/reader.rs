//! The stream reader: parses the wire envelope, reconciles each document's
//! declared classes and stores with the schema, materializes known fields
//! into typed values, and retains everything else verbatim for a later
//! write.

use std::io::{self, Read};

use tracing::debug;

use crate::automagic::Automagic;
use crate::doc::{Ann, Document, Store};
use crate::field::{DecodeFault, PointerCtx};
use crate::rt::{self, KlassBind, Rt, RtAnn, RtField, RtStore};
use crate::schema::DocSchema;
use crate::value::Value;
use crate::wire::{self, field_type};

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("malformed MessagePack: {0}")]
    Decode(#[from] rmpv::decode::Error),
    #[error("invalid wire format version: stream has {found} but this reader reads 2")]
    WireVersion { found: rmpv::Value },
    #[error("expected {expected}, got {found}")]
    Malformed {
        expected: &'static str,
        found: rmpv::Value,
    },
    #[error("unknown key {key} in <field> map")]
    UnknownFieldKey { key: rmpv::Value },
    #[error("expected nil value for {flag} key, got {found} instead")]
    FlagValue {
        flag: &'static str,
        found: rmpv::Value,
    },
    #[error("field number {number} did not contain a NAME key")]
    MissingName { number: usize },
    #[error(
        "field {field:?} of class {klass:?} has {flag} as {stream} on the stream, \
         but {declared} on the class's field"
    )]
    FlagMismatch {
        field: String,
        klass: String,
        flag: &'static str,
        stream: bool,
        declared: bool,
    },
    #[error("did not read in a __meta__ class")]
    MissingMeta,
    #[error("klass id value {id} >= number of klasses ({len})")]
    KlassIdRange { id: u64, len: usize },
    #[error("store id value {id} >= number of stores ({len})")]
    StoreIdRange { id: u64, len: usize },
    #[error("field id value {id} >= number of fields ({len}) of class {klass:?}")]
    FieldIdRange { id: u64, len: usize, klass: String },
    #[error(
        "store {store:?} holds {declared:?} but the store on the stream holds \
         a lazy type ({stream:?})"
    )]
    StoreLazyKlass {
        store: String,
        declared: String,
        stream: String,
    },
    #[error("store {store:?} holds {declared:?} but the stream says it holds {stream:?}")]
    StoreKlassMismatch {
        store: String,
        declared: String,
        stream: String,
    },
    #[error("pointer field {field:?} targets {targets:?} but store {store:?} holds {holds:?}")]
    PointerTypeMismatch {
        field: String,
        targets: String,
        store: String,
        holds: String,
    },
    #[error("pointer field {field:?} targets the lazy store {store:?}")]
    PointerLazyStore { field: String, store: String },
    #[error("pointer field {field:?} has no resolvable target store")]
    PointerNoStore { field: String },
    #[error("store {store:?} declares {nelem} elements but the payload carries {found}")]
    ElementCount {
        store: String,
        nelem: u64,
        found: usize,
    },
    #[error("pointer index {index} is out of range for store {store:?} ({len} elements)")]
    PointerRange {
        store: String,
        index: u64,
        len: usize,
    },
}

fn expect_array(value: rmpv::Value, expected: &'static str) -> Result<Vec<rmpv::Value>, ReadError> {
    match value {
        rmpv::Value::Array(items) => Ok(items),
        found => Err(ReadError::Malformed { expected, found }),
    }
}

fn expect_map(
    value: rmpv::Value,
    expected: &'static str,
) -> Result<Vec<(rmpv::Value, rmpv::Value)>, ReadError> {
    match value {
        rmpv::Value::Map(entries) => Ok(entries),
        found => Err(ReadError::Malformed { expected, found }),
    }
}

fn expect_str(value: rmpv::Value, expected: &'static str) -> Result<String, ReadError> {
    if let Some(text) = value.as_str() {
        return Ok(text.to_owned());
    }
    Err(ReadError::Malformed {
        expected,
        found: value,
    })
}

fn expect_u64(value: rmpv::Value, expected: &'static str) -> Result<u64, ReadError> {
    match value.as_u64() {
        Some(n) => Ok(n),
        None => Err(ReadError::Malformed {
            expected,
            found: value,
        }),
    }
}

/// A cursor over a stream of serialized documents.
///
/// `read` yields documents until the stream is exhausted; EOF cleanly at a
/// document boundary ends the stream, EOF anywhere else is an error. The
/// reader also implements `Iterator`.
pub struct Reader<R: Read> {
    input: R,
    schema: DocSchema,
    automagic: Option<Automagic>,
}

impl<R: Read> Reader<R> {
    /// A strict reader: the stream must be structurally compatible with
    /// `schema`, and anything the schema does not declare is carried
    /// opaquely.
    pub fn new(input: R, schema: DocSchema) -> Reader<R> {
        Reader {
            input,
            schema,
            automagic: None,
        }
    }

    /// An automagic reader with no declared model: every class, store, and
    /// field is synthesized from the stream.
    pub fn automagic(input: R) -> Reader<R> {
        let schema = Automagic::bare_schema();
        let automagic = Automagic::new(&schema);
        Reader {
            input,
            schema,
            automagic: Some(automagic),
        }
    }

    /// An automagic reader over a declared model: elements `schema` covers
    /// are read strictly, everything else is synthesized.
    pub fn automagic_with(input: R, schema: DocSchema) -> Reader<R> {
        let automagic = Automagic::new(&schema);
        Reader {
            input,
            schema,
            automagic: Some(automagic),
        }
    }

    /// The schema in use. In automagic mode this reflects every element
    /// synthesized so far, and is sufficient to re-serialize the documents
    /// read through it byte-for-byte.
    pub fn schema(&self) -> &DocSchema {
        &self.schema
    }

    /// Read the next document, or `None` at the end of the stream.
    pub fn read(&mut self) -> Result<Option<Document>, ReadError> {
        // A clean EOF before the version value is the end of the stream;
        // any later EOF is a truncated document.
        let mut first = [0u8; 1];
        loop {
            match self.input.read(&mut first) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        {
            let mut input = (&first[..]).chain(&mut self.input);
            let version = rmpv::decode::read_value(&mut input)?;
            if version.as_u64() != Some(wire::VERSION) {
                return Err(ReadError::WireVersion { found: version });
            }
        }

        let klasses = rmpv::decode::read_value(&mut self.input)?;
        let mut rt = self.read_klasses(klasses)?;
        let stores = rmpv::decode::read_value(&mut self.input)?;
        self.read_stores(&mut rt, stores)?;
        self.validate_pointer_fields(&rt)?;
        if let Some(automagic) = &mut self.automagic {
            automagic.synthesize(&mut self.schema, &mut rt);
        }
        debug!(
            klasses = rt.klasses.len(),
            stores = rt.stores.len(),
            "read document headers"
        );

        let mut doc = Document::new(&self.schema);
        self.create_stores(&rt, &mut doc);
        self.read_doc_instance(&rt, &mut doc)?;
        self.read_store_instances(&mut rt, &mut doc)?;

        doc.rt = Some(rt);
        if let Some(automagic) = &mut self.automagic {
            automagic.bump();
        }
        Ok(Some(doc))
    }

    fn klass_limit(&self) -> usize {
        match &self.automagic {
            Some(automagic) => automagic.base_klasses(),
            None => self.schema.klasses.len(),
        }
    }

    fn store_limit(&self) -> usize {
        match &self.automagic {
            Some(automagic) => automagic.base_stores(),
            None => self.schema.stores.len(),
        }
    }

    fn read_klasses(&self, value: rmpv::Value) -> Result<Rt, ReadError> {
        let mut rt = Rt {
            schema_uid: self.schema.uid,
            doc: usize::MAX,
            klasses: Vec::new(),
            stores: Vec::new(),
        };

        for (at, klass) in expect_array(value, "a <klasses> array")?.into_iter().enumerate() {
            let mut pair = expect_array(klass, "a (klass_name, fields) pair")?;
            if pair.len() != 2 {
                return Err(ReadError::Malformed {
                    expected: "a (klass_name, fields) pair",
                    found: rmpv::Value::Array(pair),
                });
            }
            let fields = pair.pop().unwrap_or(rmpv::Value::Nil);
            let name = expect_str(
                pair.pop().unwrap_or(rmpv::Value::Nil),
                "a klass name string",
            )?;

            let defn = if name == "__meta__" {
                rt.doc = at;
                Some(KlassBind::Doc)
            } else {
                self.schema
                    .klass_by_serial(&name, self.klass_limit())
                    .map(KlassBind::Ann)
            };
            let mut rtann = RtAnn {
                serial: name,
                defn,
                fields: Vec::new(),
            };

            for (number, field) in expect_array(fields, "a <fields> array")?
                .into_iter()
                .enumerate()
            {
                let rtfield = self.read_field(&rtann, number, field)?;
                rtann.fields.push(rtfield);
            }
            rt.klasses.push(rtann);
        }

        if rt.doc == usize::MAX {
            return Err(ReadError::MissingMeta);
        }
        Ok(rt)
    }

    fn read_field(
        &self,
        rtann: &RtAnn,
        number: usize,
        field: rmpv::Value,
    ) -> Result<RtField, ReadError> {
        let mut name = None;
        let mut points_to = None;
        let mut is_slice = false;
        let mut is_self_pointer = false;
        let mut is_collection = false;

        for (key, value) in expect_map(field, "a <field> map")? {
            let flag = |name: &'static str, value: rmpv::Value| -> Result<(), ReadError> {
                match value {
                    rmpv::Value::Nil => Ok(()),
                    found => Err(ReadError::FlagValue { flag: name, found }),
                }
            };
            match key.as_u64() {
                Some(field_type::NAME) => {
                    name = Some(expect_str(value, "a field name string")?);
                }
                Some(field_type::POINTER_TO) => {
                    points_to = Some(expect_u64(value, "a store id")? as usize);
                }
                Some(field_type::IS_SLICE) => {
                    flag("IS_SLICE", value)?;
                    is_slice = true;
                }
                Some(field_type::IS_SELF_POINTER) => {
                    flag("IS_SELF_POINTER", value)?;
                    is_self_pointer = true;
                }
                Some(field_type::IS_COLLECTION) => {
                    flag("IS_COLLECTION", value)?;
                    is_collection = true;
                }
                _ => return Err(ReadError::UnknownFieldKey { key }),
            }
        }

        let Some(serial) = name else {
            return Err(ReadError::MissingName { number: number + 1 });
        };

        let mut rtfield = RtField {
            serial,
            points_to,
            is_slice,
            is_self_pointer,
            is_collection,
            defn: None,
        };

        // Match the stream field against the declared class, and insist the
        // stream agrees with the declaration about the field's shape.
        // Unmatched fields on a known class stay lazy.
        if let Some(bind) = rtann.defn {
            let fields = rt::fields_of(&self.schema, bind);
            if let Some(at) = fields.iter().position(|f| f.serial == rtfield.serial) {
                let kind = fields[at].kind;
                let checks = [
                    ("IS_POINTER", kind.is_pointer(), rtfield.is_pointer()),
                    ("IS_SLICE", kind.is_slice(), rtfield.is_slice),
                    ("IS_SELF_POINTER", kind.is_self_pointer(), rtfield.is_self_pointer),
                    ("IS_COLLECTION", kind.is_collection(), rtfield.is_collection),
                ];
                for (flag, declared, stream) in checks {
                    if declared != stream {
                        return Err(ReadError::FlagMismatch {
                            field: rtfield.serial,
                            klass: rtann.serial.clone(),
                            flag,
                            stream,
                            declared,
                        });
                    }
                }
                rtfield.defn = Some(at);
            }
        }
        Ok(rtfield)
    }

    fn read_stores(&self, rt: &mut Rt, value: rmpv::Value) -> Result<(), ReadError> {
        for store in expect_array(value, "a <stores> array")? {
            let mut triple = expect_array(store, "a (store_name, klass_id, nelem) triple")?;
            if triple.len() != 3 {
                return Err(ReadError::Malformed {
                    expected: "a (store_name, klass_id, nelem) triple",
                    found: rmpv::Value::Array(triple),
                });
            }
            let nelem = expect_u64(triple.pop().unwrap_or(rmpv::Value::Nil), "an element count")?;
            let klass_id = expect_u64(triple.pop().unwrap_or(rmpv::Value::Nil), "a klass id")?;
            let serial = expect_str(triple.pop().unwrap_or(rmpv::Value::Nil), "a store name")?;

            if klass_id >= rt.klasses.len() as u64 {
                return Err(ReadError::KlassIdRange {
                    id: klass_id,
                    len: rt.klasses.len(),
                });
            }
            let klass = klass_id as usize;

            let defn = self.schema.store_by_serial(&serial, self.store_limit());
            if let Some(at) = defn {
                // The stream store and the declared store must agree on the
                // class they hold.
                let declared = &self.schema.klasses[self.schema.stores[at].klass];
                match rt.klasses[klass].defn {
                    Some(KlassBind::Ann(stored)) => {
                        if stored != self.schema.stores[at].klass {
                            return Err(ReadError::StoreKlassMismatch {
                                store: serial,
                                declared: declared.name.clone(),
                                stream: self.schema.klasses[stored].name.clone(),
                            });
                        }
                    }
                    Some(KlassBind::Doc) => {
                        return Err(ReadError::StoreKlassMismatch {
                            store: serial,
                            declared: declared.name.clone(),
                            stream: "__meta__".to_owned(),
                        });
                    }
                    None => {
                        return Err(ReadError::StoreLazyKlass {
                            store: serial,
                            declared: declared.name.clone(),
                            stream: rt.klasses[klass].serial.clone(),
                        });
                    }
                }
            }

            rt.stores.push(RtStore {
                serial,
                klass,
                nelem,
                defn,
                lazy: None,
            });
        }
        Ok(())
    }

    /// Every pointer field's store id must be in range, and for fields the
    /// schema declares, the targeted store must hold the declared class.
    /// Runtime stores are indexed in stream order, so the wire store id is
    /// already the runtime store index once validated.
    fn validate_pointer_fields(&self, rt: &Rt) -> Result<(), ReadError> {
        for klass in &rt.klasses {
            for field in &klass.fields {
                let Some(store_id) = field.points_to else {
                    continue;
                };
                if store_id >= rt.stores.len() {
                    return Err(ReadError::StoreIdRange {
                        id: store_id as u64,
                        len: rt.stores.len(),
                    });
                }
                let (Some(bind), Some(defn)) = (klass.defn, field.defn) else {
                    continue;
                };
                let schema_field = &rt::fields_of(&self.schema, bind)[defn];
                let Some(target) = schema_field.points_to else {
                    continue;
                };
                let rtstore = &rt.stores[store_id];
                match rtstore.defn {
                    None => {
                        return Err(ReadError::PointerLazyStore {
                            field: schema_field.name.clone(),
                            store: rtstore.serial.clone(),
                        });
                    }
                    Some(at) => {
                        if self.schema.stores[at].klass != self.schema.stores[target].klass {
                            return Err(ReadError::PointerTypeMismatch {
                                field: schema_field.name.clone(),
                                targets: self.schema.klasses[self.schema.stores[target].klass]
                                    .name
                                    .clone(),
                                store: rtstore.serial.clone(),
                                holds: self.schema.klasses[self.schema.stores[at].klass]
                                    .name
                                    .clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Populate the document's known stores with blank annotations, with
    /// collection fields defaulted, ready to be filled from the payloads.
    fn create_stores(&self, rt: &Rt, doc: &mut Document) {
        for rtstore in &rt.stores {
            let Some(at) = rtstore.defn else { continue };
            let schema_store = &self.schema.stores[at];
            let klass = &self.schema.klasses[schema_store.klass];
            let store = doc.ensure_store(&schema_store.name);
            let start = store.len();
            store.create_n(rtstore.nelem as usize);

            let defaults: Vec<_> = klass
                .fields
                .iter()
                .filter(|f| !f.kind.default_value().is_null())
                .collect();
            if defaults.is_empty() {
                continue;
            }
            for i in start..store.len() {
                if let Some(ann) = store.get(i) {
                    for field in &defaults {
                        ann.set(&field.name, field.kind.default_value());
                    }
                }
            }
        }
    }

    fn read_doc_instance(&mut self, rt: &Rt, doc: &mut Document) -> Result<(), ReadError> {
        // The byte-length prefix enables skipping, which this reader does
        // not need; the packed value itself delimits the instance.
        let prefix = rmpv::decode::read_value(&mut self.input)?;
        expect_u64(prefix, "a byte-length prefix")?;
        let instance = rmpv::decode::read_value(&mut self.input)?;

        let (values, lazy) = self.decode_instance(rt, rt.doc, instance, None, doc)?;
        for (name, value) in values {
            doc.set(&name, value);
        }
        doc.lazy.extend(lazy);
        Ok(())
    }

    fn read_store_instances(&mut self, rt: &mut Rt, doc: &mut Document) -> Result<(), ReadError> {
        for at in 0..rt.stores.len() {
            let prefix = rmpv::decode::read_value(&mut self.input)?;
            let nbytes = expect_u64(prefix, "a byte-length prefix")?;

            match rt.stores[at].defn {
                None => {
                    // Unknown store: the payload is retained byte-exactly,
                    // to be written back verbatim.
                    let mut blob = vec![0u8; nbytes as usize];
                    self.input.read_exact(&mut blob)?;
                    rt.stores[at].lazy = Some(blob.into());
                }
                Some(schema_at) => {
                    let payload = rmpv::decode::read_value(&mut self.input)?;
                    let instances = expect_array(payload, "a store payload array")?;
                    if instances.len() as u64 != rt.stores[at].nelem {
                        return Err(ReadError::ElementCount {
                            store: rt.stores[at].serial.clone(),
                            nelem: rt.stores[at].nelem,
                            found: instances.len(),
                        });
                    }

                    let name = self.schema.stores[schema_at].name.clone();
                    let anns: Vec<Ann> = match doc.store(&name) {
                        Some(store) => store.iter().cloned().collect(),
                        None => Vec::new(),
                    };
                    let klass = rt.stores[at].klass;
                    for (i, instance) in instances.into_iter().enumerate() {
                        let (values, lazy) =
                            self.decode_instance(rt, klass, instance, Some(&name), doc)?;
                        if let Some(ann) = anns.get(i) {
                            for (field, value) in values {
                                ann.set(&field, value);
                            }
                            for (id, value) in lazy {
                                ann.lazy_insert(id, value);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode one instance map against the runtime class `klass_at`,
    /// splitting known fields (decoded to typed values) from lazy ones
    /// (retained as raw wire values).
    #[allow(clippy::type_complexity)]
    fn decode_instance(
        &self,
        rt: &Rt,
        klass_at: usize,
        instance: rmpv::Value,
        own_store: Option<&str>,
        doc: &Document,
    ) -> Result<(Vec<(String, Value)>, Vec<(u64, rmpv::Value)>), ReadError> {
        let rtklass = &rt.klasses[klass_at];
        let mut values = Vec::new();
        let mut lazy = Vec::new();

        for (key, wire_value) in expect_map(instance, "an instance map")? {
            let id = expect_u64(key, "a field id")?;
            let Some(field) = rtklass.fields.get(id as usize) else {
                return Err(ReadError::FieldIdRange {
                    id,
                    len: rtklass.fields.len(),
                    klass: rtklass.serial.clone(),
                });
            };

            let (Some(bind), Some(defn)) = (rtklass.defn, field.defn) else {
                lazy.push((id, wire_value));
                continue;
            };
            let schema_field = &rt::fields_of(&self.schema, bind)[defn];

            let target = field
                .points_to
                .and_then(|store_id| rt.stores.get(store_id))
                .and_then(|rtstore| rtstore.defn)
                .map(|at| &self.schema.stores[at])
                .and_then(|schema_store| {
                    doc.store(&schema_store.name)
                        .map(|store| (schema_store.name.as_str(), store))
                });
            let own: Option<(&str, &Store)> =
                own_store.and_then(|name| doc.store(name).map(|store| (name, store)));
            let ctx = PointerCtx { target, own };

            let value = schema_field.kind.decode(wire_value, &ctx).map_err(|fault| {
                self.decode_fault(schema_field.name.clone(), fault)
            })?;
            values.push((schema_field.name.clone(), value));
        }
        Ok((values, lazy))
    }

    fn decode_fault(&self, field: String, fault: DecodeFault) -> ReadError {
        match fault {
            DecodeFault::PointerRange { store, index, len } => {
                ReadError::PointerRange { store, index, len }
            }
            DecodeFault::Malformed { expected, found } => {
                ReadError::Malformed { expected, found }
            }
            DecodeFault::NoStore => ReadError::PointerNoStore { field },
        }
    }
}

impl<R: Read> Iterator for Reader<R> {
    type Item = Result<Document, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}
