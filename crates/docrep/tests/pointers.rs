//! Pointer materialization: identity across serialization, store-membership
//! enforcement on write, and self-pointers across sibling stores.

mod support;

use docrep::{AnnDef, DocDef, DocSchema, Document, FieldDef, Registry, StoreDef, WriteError, Writer};
use support::write_read;

fn node_schema() -> DocSchema {
    let mut registry = Registry::new();
    registry
        .annotation(
            AnnDef::new("graph.Node")
                .field("label", FieldDef::scalar())
                .field("parent", FieldDef::self_pointer())
                .field("other", FieldDef::pointer("graph.Node").store("nodes2")),
        )
        .unwrap();
    let doc_def = registry
        .document(
            DocDef::new("graph.Doc")
                .store("nodes1", StoreDef::of("graph.Node"))
                .store("nodes2", StoreDef::of("graph.Node"))
                .store("nodes3", StoreDef::of("graph.Node")),
        )
        .unwrap();
    registry.schema(doc_def).unwrap()
}

#[test]
fn test_self_pointer_graph() {
    let schema = node_schema();
    let mut doc = Document::new(&schema);

    // A self-parented root in its own store.
    let n1 = doc.store_mut("nodes3").unwrap().create();
    n1.set("label", "1");
    n1.set("parent", n1.clone());

    // A chain in nodes2.
    let (na2, nb2, nc2, nd2) = {
        let nodes2 = doc.store_mut("nodes2").unwrap();
        let na = nodes2.create();
        na.set("label", "A");
        let nb = nodes2.create();
        nb.set("label", "B");
        nb.set("parent", na.clone());
        let nc = nodes2.create();
        nc.set("label", "C");
        nc.set("parent", nb.clone());
        let nd = nodes2.create();
        nd.set("label", "D");
        nd.set("parent", nc.clone());
        (na, nb, nc, nd)
    };
    for node in [&na2, &nb2, &nc2, &nd2] {
        node.set("other", nd2.clone());
    }

    // A tree in nodes1 whose `other` pointers cross into nodes2.
    let nodes1 = doc.store_mut("nodes1").unwrap();
    let na = nodes1.create();
    na.set("label", "a");
    na.set("other", nd2.clone());
    let nb = nodes1.create();
    nb.set("label", "b");
    nb.set("parent", na.clone());
    nb.set("other", nc2.clone());
    let nc = nodes1.create();
    nc.set("label", "c");
    nc.set("parent", na.clone());
    nc.set("other", nb2.clone());

    let doc = write_read(&mut doc, &schema, &schema);

    let nodes1 = doc.store("nodes1").unwrap();
    let nodes2 = doc.store("nodes2").unwrap();
    let nodes3 = doc.store("nodes3").unwrap();
    assert_eq!(nodes1.len(), 3);
    assert_eq!(nodes2.len(), 4);
    assert_eq!(nodes3.len(), 1);

    // The root's parent is the identical object.
    let root = &nodes3[0];
    assert!(root.get("parent").as_ann().unwrap().ptr_eq(root));
    assert!(root.get("other").is_null());

    assert!(nodes1[0].get("parent").is_null());
    assert!(nodes1[1].get("parent").as_ann().unwrap().ptr_eq(&nodes1[0]));
    assert!(nodes1[2].get("parent").as_ann().unwrap().ptr_eq(&nodes1[0]));

    assert!(nodes1[0].get("other").as_ann().unwrap().ptr_eq(&nodes2[3]));
    assert!(nodes1[1].get("other").as_ann().unwrap().ptr_eq(&nodes2[2]));
    assert!(nodes1[2].get("other").as_ann().unwrap().ptr_eq(&nodes2[1]));

    assert!(nodes2[1].get("parent").as_ann().unwrap().ptr_eq(&nodes2[0]));
    assert!(nodes2[3].get("other").as_ann().unwrap().ptr_eq(&nodes2[3]));
}

fn foos_schema() -> DocSchema {
    let mut registry = Registry::new();
    registry
        .annotation(AnnDef::new("p.Foo").field("val", FieldDef::scalar()))
        .unwrap();
    registry
        .annotation(AnnDef::new("p.Bar").field("val", FieldDef::scalar()))
        .unwrap();
    let doc_def = registry
        .document(
            DocDef::new("p.Doc")
                .field("favourite", FieldDef::pointer("p.Foo").store("foos"))
                .store("foos", StoreDef::of("p.Foo"))
                .store("wrong_foos", StoreDef::of("p.Foo"))
                .store("bars", StoreDef::of("p.Bar")),
        )
        .unwrap();
    registry.schema(doc_def).unwrap()
}

fn filled_foos(schema: &DocSchema) -> Document {
    let mut doc = Document::new(schema);
    for name in ["foos", "wrong_foos", "bars"] {
        for val in 0..5i64 {
            doc.store_mut(name).unwrap().create().set("val", val);
        }
    }
    doc
}

fn write_err(doc: &mut Document, schema: &DocSchema) -> WriteError {
    let mut buf = Vec::new();
    Writer::new(&mut buf, schema.clone())
        .write(doc)
        .expect_err("the write must fail")
}

#[test]
fn test_pointer_to_sibling_store_of_same_type() {
    let schema = foos_schema();
    let mut doc = filled_foos(&schema);
    let wrong = doc.store("wrong_foos").unwrap().get(2).unwrap();
    doc.set("favourite", wrong);

    let err = write_err(&mut doc, &schema);
    assert!(err.to_string().contains("not in store"), "{err}");
}

#[test]
fn test_pointer_to_different_type() {
    let schema = foos_schema();
    let mut doc = filled_foos(&schema);
    let bar = doc.store("bars").unwrap().get(2).unwrap();
    doc.set("favourite", bar);

    let err = write_err(&mut doc, &schema);
    assert!(err.to_string().contains("not in store"), "{err}");
}

#[test]
fn test_deleted_target_fails_the_next_write() {
    let schema = foos_schema();
    let mut doc = filled_foos(&schema);
    let last = doc.store("foos").unwrap().get(4).unwrap();
    doc.set("favourite", last);

    // A first write stamps indices and succeeds.
    let mut buf = Vec::new();
    Writer::new(&mut buf, schema.clone()).write(&mut doc).unwrap();

    // Deleting the target leaves a dangling pointer behind.
    doc.store_mut("foos").unwrap().remove(4);
    let err = write_err(&mut doc, &schema);
    assert!(err.to_string().contains("not not in any store"), "{err}");
}

#[test]
fn test_sorted_store_round_trips_pointers() {
    let mut registry = Registry::new();
    registry
        .annotation(
            AnnDef::new("sort.Foo")
                .field("label", FieldDef::scalar())
                .field("other", FieldDef::pointer("sort.Foo")),
        )
        .unwrap();
    let doc_def = registry
        .document(DocDef::new("sort.Doc").store("foos", StoreDef::of("sort.Foo")))
        .unwrap();
    let schema = registry.schema(doc_def).unwrap();

    let mut doc = Document::new(&schema);
    let foos = doc.store_mut("foos").unwrap();
    let f1 = foos.create();
    let f2 = foos.create();
    let f3 = foos.create();
    let f4 = foos.create();
    for (foo, label) in [(&f1, "1"), (&f2, "2"), (&f3, "3"), (&f4, "4")] {
        foo.set("label", label);
    }
    foos.sort_by(|a, b| {
        let (a, b) = (a.get("label"), b.get("label"));
        b.as_str().cmp(&a.as_str())
    });
    f1.set("other", f3.clone());
    f2.set("other", f1.clone());
    f3.set("other", f2.clone());
    f4.set("other", f4.clone());

    let doc = write_read(&mut doc, &schema, &schema);

    let foos = doc.store("foos").unwrap();
    assert_eq!(foos.len(), 4);
    let labels: Vec<_> = foos
        .iter()
        .map(|f| f.get("label").as_str().unwrap().to_owned())
        .collect();
    assert_eq!(labels, vec!["4", "3", "2", "1"]);
    assert!(foos[0].get("other").as_ann().unwrap().ptr_eq(&foos[0]));
    assert!(foos[1].get("other").as_ann().unwrap().ptr_eq(&foos[2]));
    assert!(foos[2].get("other").as_ann().unwrap().ptr_eq(&foos[3]));
    assert!(foos[3].get("other").as_ann().unwrap().ptr_eq(&foos[1]));
}

#[test]
fn test_deleting_unreferenced_elements_is_fine() {
    let schema = foos_schema();
    let mut doc = filled_foos(&schema);
    doc.store_mut("foos").unwrap().remove(3);
    doc.store_mut("foos").unwrap().truncate(3);

    let doc = write_read(&mut doc, &schema, &schema);
    assert_eq!(doc.store("foos").unwrap().len(), 3);
    assert_eq!(doc.store("wrong_foos").unwrap().len(), 5);
}
