//! Structural stream violations abort the document with a descriptive
//! error. Fixtures are hand-packed MessagePack, as in the wire tests.

mod support;

use docrep::{AnnDef, DocDef, DocSchema, Document, FieldDef, ReadError, Reader, Registry, StoreDef};
use support::write_bytes;

fn empty_doc_schema() -> DocSchema {
    let mut registry = Registry::new();
    let doc_def = registry.document(DocDef::new("err.Doc")).unwrap();
    registry.schema(doc_def).unwrap()
}

fn read_err(bytes: &[u8], schema: &DocSchema) -> ReadError {
    let mut reader = Reader::new(bytes, schema.clone());
    reader.read().expect_err("the read must fail")
}

#[test]
fn test_version_mismatch() {
    let schema = empty_doc_schema();

    let err = read_err(b"\x03", &schema);
    assert!(matches!(err, ReadError::WireVersion { .. }), "{err}");

    // A version-1 stream has no version marker at all; the first value is
    // the klasses array.
    let v1 = b"\x91\x92\xa8__meta__\x91\x81\x00\xa3foo\x90\x08\x81\x00\xa5hello";
    let err = read_err(v1, &schema);
    assert!(matches!(err, ReadError::WireVersion { .. }), "{err}");
}

#[test]
fn test_eof_mid_document() {
    let schema = empty_doc_schema();
    let mut doc = Document::new(&schema);
    let bytes = write_bytes(&mut doc, &schema);

    // EOF at the boundary ends the stream; EOF inside a document does not.
    for cut in 1..bytes.len() {
        let mut reader = Reader::new(&bytes[..cut], schema.clone());
        assert!(reader.read().is_err(), "truncation at {cut} must fail");
    }
    let mut reader = Reader::new(&bytes[..], schema.clone());
    assert!(reader.read().unwrap().is_some());
    assert!(reader.read().unwrap().is_none());
}

#[test]
fn test_unknown_field_key() {
    let schema = empty_doc_schema();
    // __meta__ declares one field whose map holds the unknown key 9.
    let err = read_err(b"\x02\x91\x92\xa8__meta__\x91\x81\x09\xc0", &schema);
    assert!(matches!(err, ReadError::UnknownFieldKey { .. }), "{err}");
}

#[test]
fn test_field_without_name() {
    let schema = empty_doc_schema();
    // A field map carrying only IS_SLICE.
    let err = read_err(b"\x02\x91\x92\xa8__meta__\x91\x81\x02\xc0", &schema);
    let message = err.to_string();
    assert!(message.contains("did not contain a NAME key"), "{message}");
}

#[test]
fn test_flag_with_non_nil_value() {
    let schema = empty_doc_schema();
    // IS_SLICE carries 5 instead of nil.
    let err = read_err(b"\x02\x91\x92\xa8__meta__\x91\x82\x00\xa1f\x02\x05", &schema);
    let message = err.to_string();
    assert!(message.contains("expected nil value for IS_SLICE"), "{message}");
}

#[test]
fn test_missing_meta_class() {
    let schema = empty_doc_schema();
    let err = read_err(b"\x02\x91\x92\xa1X\x90\x90", &schema);
    assert!(matches!(err, ReadError::MissingMeta), "{err}");
}

#[test]
fn test_klass_id_out_of_range() {
    let schema = empty_doc_schema();
    // One klass, but the store table points at klass 5.
    let err = read_err(b"\x02\x91\x92\xa8__meta__\x90\x91\x93\xa2xs\x05\x00", &schema);
    assert!(matches!(err, ReadError::KlassIdRange { id: 5, .. }), "{err}");
}

#[test]
fn test_store_id_out_of_range() {
    let schema = empty_doc_schema();
    // Class X's pointer field targets store 2, but only one store exists.
    let bytes = b"\x02\x92\x92\xa8__meta__\x90\x92\xa1X\x91\x82\x00\xa1p\x01\x02\x91\x93\xa2xs\x01\x00";
    let err = read_err(bytes, &schema);
    assert!(matches!(err, ReadError::StoreIdRange { id: 2, .. }), "{err}");
}

#[test]
fn test_element_count_mismatch() {
    let mut registry = Registry::new();
    registry.annotation(AnnDef::new("err.X")).unwrap();
    let doc_def = registry
        .document(DocDef::new("err.XDoc").store("xs", StoreDef::of("err.X")))
        .unwrap();
    let schema = registry.schema(doc_def).unwrap();

    // The store table declares one element; the payload carries none.
    let bytes = b"\x02\x92\x92\xa8__meta__\x90\x92\xa1X\x90\x91\x93\xa2xs\x01\x01\x01\x80\x01\x90";
    let err = read_err(bytes, &schema);
    assert!(
        matches!(err, ReadError::ElementCount { nelem: 1, found: 0, .. }),
        "{err}"
    );
}

#[test]
fn test_flag_mismatch_between_stream_and_declaration() {
    let writer_schema = {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("w.X").field("p", FieldDef::pointer("w.X")))
            .unwrap();
        let doc_def = registry
            .document(DocDef::new("w.Doc").store("xs", StoreDef::of("w.X")))
            .unwrap();
        registry.schema(doc_def).unwrap()
    };
    let reader_schema = {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("r.X").serial("X").field("p", FieldDef::byte_slice()))
            .unwrap();
        let doc_def = registry
            .document(DocDef::new("r.Doc").store("xs", StoreDef::of("r.X")))
            .unwrap();
        registry.schema(doc_def).unwrap()
    };

    let mut doc = Document::new(&writer_schema);
    let bytes = write_bytes(&mut doc, &writer_schema);

    let err = read_err(&bytes, &reader_schema);
    assert!(
        matches!(err, ReadError::FlagMismatch { flag: "IS_POINTER", .. }),
        "{err}"
    );
}

#[test]
fn test_store_points_to_lazy_type() {
    // The reader's class has a different serial than the stream's, so the
    // stream type is lazy while the store is declared.
    let writer_schema = {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("i8.Token").field("raw", FieldDef::scalar()))
            .unwrap();
        let doc_def = registry
            .document(DocDef::new("i8.DocToken").store("tokens", StoreDef::of("i8.Token")))
            .unwrap();
        registry.schema(doc_def).unwrap()
    };
    let reader_schema = {
        let mut registry = Registry::new();
        registry
            .annotation(AnnDef::new("i8.Tok").field("raw", FieldDef::scalar()))
            .unwrap();
        let doc_def = registry
            .document(DocDef::new("i8.DocTok").store("tokens", StoreDef::of("i8.Tok")))
            .unwrap();
        registry.schema(doc_def).unwrap()
    };

    let mut doc = Document::new(&writer_schema);
    doc.store_mut("tokens").unwrap().create().set("raw", "meow");
    let bytes = write_bytes(&mut doc, &writer_schema);

    let err = read_err(&bytes, &reader_schema);
    let message = err.to_string();
    assert!(
        matches!(err, ReadError::StoreLazyKlass { .. }),
        "{message}"
    );
    assert!(message.contains("i8.Tok"), "{message}");
    assert!(message.contains("lazy type"), "{message}");
}

#[test]
fn test_pointer_type_mismatch() {
    let writer_schema = {
        let mut registry = Registry::new();
        registry.annotation(AnnDef::new("pt.A")).unwrap();
        registry.annotation(AnnDef::new("pt.B")).unwrap();
        registry
            .annotation(AnnDef::new("pt.Y").field("p", FieldDef::pointer("pt.A").store("as")))
            .unwrap();
        let doc_def = registry
            .document(
                DocDef::new("pt.Doc")
                    .store("as", StoreDef::of("pt.A"))
                    .store("bs", StoreDef::of("pt.B"))
                    .store("ys", StoreDef::of("pt.Y")),
            )
            .unwrap();
        registry.schema(doc_def).unwrap()
    };
    // The same shape, except `p` targets the bs store of a different class.
    let reader_schema = {
        let mut registry = Registry::new();
        registry.annotation(AnnDef::new("pt.A").serial("A")).unwrap();
        registry.annotation(AnnDef::new("pt.B").serial("B")).unwrap();
        registry
            .annotation(AnnDef::new("pt.Y").serial("Y").field("p", FieldDef::pointer("pt.B").store("bs")))
            .unwrap();
        let doc_def = registry
            .document(
                DocDef::new("pt.Doc2")
                    .store("as", StoreDef::of("pt.A"))
                    .store("bs", StoreDef::of("pt.B"))
                    .store("ys", StoreDef::of("pt.Y")),
            )
            .unwrap();
        registry.schema(doc_def).unwrap()
    };

    let mut doc = Document::new(&writer_schema);
    let bytes = write_bytes(&mut doc, &writer_schema);

    let err = read_err(&bytes, &reader_schema);
    assert!(matches!(err, ReadError::PointerTypeMismatch { .. }), "{err}");
}
