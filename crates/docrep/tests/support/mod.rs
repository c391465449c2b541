#![allow(dead_code)]

use docrep::{DocSchema, Document, Reader, Writer};

pub fn write_bytes(doc: &mut Document, schema: &DocSchema) -> Vec<u8> {
    let mut buf = Vec::new();
    Writer::new(&mut buf, schema.clone()).write(doc).unwrap();
    buf
}

pub fn read_one(bytes: &[u8], schema: &DocSchema) -> Document {
    let mut reader = Reader::new(bytes, schema.clone());
    let doc = reader.read().unwrap().expect("a document on the stream");
    assert!(reader.read().unwrap().is_none(), "exactly one document");
    doc
}

/// Serialize under `out`, deserialize under `read`.
pub fn write_read(doc: &mut Document, out: &DocSchema, read: &DocSchema) -> Document {
    let bytes = write_bytes(doc, out);
    read_one(&bytes, read)
}

/// Hex rendering for byte-level assertions; diffs read better than raw
/// `Vec<u8>` debug output.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
