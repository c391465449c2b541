//! Streaming, self-describing binary serialization for annotated documents.
//!
//! A document owns typed *stores* of user-defined *annotations*; annotations
//! carry scalar fields, slice fields, and pointer fields into named stores
//! (self-pointers and collections included). Each document on a stream is
//! prefixed with its schema (classes, fields, stores), so consumers can
//! read strictly against a declared model, against a subset (everything
//! else is preserved opaquely and round-trips byte-for-byte), or in
//! *automagic* mode, synthesizing the model from the stream itself.
//!
//! ```
//! use docrep::{AnnDef, DocDef, Document, FieldDef, Reader, Registry, StoreDef, Writer};
//!
//! let mut registry = Registry::new();
//! registry
//!     .annotation(AnnDef::new("example.Token").field("norm", FieldDef::scalar()))
//!     .unwrap();
//! let doc_def = registry
//!     .document(DocDef::new("example.Doc").store("tokens", StoreDef::of("example.Token")))
//!     .unwrap();
//! let schema = registry.schema(doc_def).unwrap();
//!
//! let mut doc = Document::new(&schema);
//! doc.store_mut("tokens").unwrap().create().set("norm", "hello");
//!
//! let mut buf = Vec::new();
//! Writer::new(&mut buf, schema.clone()).write(&mut doc).unwrap();
//!
//! let mut reader = Reader::new(buf.as_slice(), schema);
//! let doc = reader.read().unwrap().unwrap();
//! assert_eq!(doc.store("tokens").unwrap().len(), 1);
//! ```

// Class declaration and the registry resolving by-name references.
mod model;
pub use model::{
    AnnDef, AnnHandle, ClassRef, DocDef, DocHandle, FieldDef, ModelError, Registry, StoreDef,
};

// Resolved, cross-linked schemas.
mod schema;
pub use schema::{AnnSchema, DependencyError, DocSchema, FieldSchema, StoreSchema};

// The closed set of field kinds and their wire rules.
mod field;
pub use field::FieldKind;

// Dynamically-typed field values.
mod value;
pub use value::{Slice, Value};

// The in-memory document model: shared annotation handles, stores, documents.
mod doc;
pub use doc::{Ann, Document, Store};

// The per-document runtime schema: wire ids and lazy regions.
mod rt;

// Wire-level constants.
mod wire;

// The codec.
mod reader;
pub use reader::{ReadError, Reader};
mod writer;
pub use writer::{WriteError, Writer};

// Automagic model synthesis for unknown stream elements.
mod automagic;

/// The wire protocol version this crate reads and writes.
pub const WIRE_VERSION: u64 = wire::VERSION;
