//! The closed set of field kinds and their wire encodings.
//!
//! Every decision about how a field value crosses the wire lives here, as
//! exhaustive matches over [`FieldKind`]: the `should_write` predicate, the
//! in-memory-to-wire encoding, and the wire-to-in-memory decoding. The
//! reader and writer supply pointer context (the resolved target store, and
//! the store owning the annotation being coded) and map faults into their
//! own error types.

use encoding_rs::Encoding;

use crate::doc::Store;
use crate::value::{format_datetime, parse_datetime, Slice, Value};

/// A resolved field kind. Pointer kinds (including typed slices) carry their
/// target store on the owning schema, not here.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldKind {
    /// Any MessagePack value, identity on the wire.
    Scalar,
    /// ISO-8601 text on the wire; unparseable text decodes to null.
    DateTime,
    /// Text carried in a fixed encoding under a str marker.
    Text {
        encoding: &'static Encoding,
        store_empty: bool,
    },
    /// `[start, length]` over external bytes.
    ByteSlice,
    /// `[start, length]` over the elements of a target store.
    AnnSlice,
    /// Index into a target store.
    Pointer,
    /// Array of indices into a target store.
    Pointers,
    /// Index into the store holding the annotation itself.
    SelfPointer,
    /// Array of indices into the owning store.
    SelfPointers,
}

impl FieldKind {
    /// Whether the wire header carries POINTER_TO (a target store id).
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            FieldKind::AnnSlice | FieldKind::Pointer | FieldKind::Pointers
        )
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, FieldKind::ByteSlice | FieldKind::AnnSlice)
    }

    pub fn is_self_pointer(&self) -> bool {
        matches!(self, FieldKind::SelfPointer | FieldKind::SelfPointers)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, FieldKind::Pointers | FieldKind::SelfPointers)
    }

    /// The value materialized for a field absent from the wire.
    pub(crate) fn default_value(&self) -> Value {
        if self.is_collection() {
            Value::AnnList(Vec::new())
        } else {
            Value::Null
        }
    }

    /// Whether `value` is serialized at all. Nulls are always skipped, empty
    /// pointer collections are skipped, and empty text is skipped unless the
    /// field stores empties.
    pub(crate) fn should_write(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => false,
            (FieldKind::Text { store_empty, .. }, Value::Str(s)) => *store_empty || !s.is_empty(),
            (FieldKind::Pointers | FieldKind::SelfPointers, Value::AnnList(anns)) => {
                !anns.is_empty()
            }
            _ => true,
        }
    }
}

/// Stores a pointer-valued field can reach: the resolved target store for
/// pointer kinds, and the store owning the annotation for self-pointers.
/// Either is absent when the instance being coded is the document itself or
/// the store was not materialized.
pub(crate) struct PointerCtx<'a> {
    pub target: Option<(&'a str, &'a Store)>,
    pub own: Option<(&'a str, &'a Store)>,
}

/// An encoded field value: either a plain MessagePack value, or raw bytes to
/// be emitted under a str marker (text in a non-UTF-8 encoding).
pub(crate) enum Wire {
    Value(rmpv::Value),
    Str(Vec<u8>),
}

#[derive(Debug)]
pub(crate) enum EncodeFault {
    /// The pointed-to annotation has no stamped index.
    Dangling,
    /// The pointed-to annotation is not the occupant of its stamped index.
    NotInStore { store: String },
    /// The in-memory value does not fit the declared kind.
    Type { expected: &'static str, found: String },
    /// No store to resolve the pointer against.
    NoStore,
}

#[derive(Debug)]
pub(crate) enum DecodeFault {
    PointerRange { store: String, index: u64, len: usize },
    Malformed { expected: &'static str, found: rmpv::Value },
    NoStore,
}

impl FieldKind {
    pub(crate) fn encode(
        &self,
        value: &Value,
        ctx: &PointerCtx<'_>,
    ) -> Result<Wire, EncodeFault> {
        match self {
            FieldKind::Scalar => scalar_to_wire(value).map(Wire::Value),
            FieldKind::DateTime => match value {
                Value::DateTime(dt) => Ok(Wire::Value(rmpv::Value::from(
                    format_datetime(dt).as_str(),
                ))),
                other => Err(type_fault("a datetime", other)),
            },
            FieldKind::Text { encoding, .. } => match value {
                Value::Str(s) => {
                    let (bytes, _, _) = encoding.encode(s);
                    Ok(Wire::Str(bytes.into_owned()))
                }
                other => Err(type_fault("text", other)),
            },
            FieldKind::ByteSlice | FieldKind::AnnSlice => match value {
                Value::Slice(s) => Ok(Wire::Value(rmpv::Value::Array(vec![
                    rmpv::Value::from(s.start),
                    rmpv::Value::from(s.len()),
                ]))),
                other => Err(type_fault("a slice", other)),
            },
            FieldKind::Pointer => match value {
                Value::Ann(ann) => {
                    let (name, store) = ctx.target.ok_or(EncodeFault::NoStore)?;
                    Ok(Wire::Value(rmpv::Value::from(wire_index(ann, name, store)?)))
                }
                other => Err(type_fault("an annotation", other)),
            },
            FieldKind::Pointers => match value {
                Value::AnnList(anns) => {
                    let (name, store) = ctx.target.ok_or(EncodeFault::NoStore)?;
                    let indices = anns
                        .iter()
                        .map(|ann| wire_index(ann, name, store).map(rmpv::Value::from))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Wire::Value(rmpv::Value::Array(indices)))
                }
                other => Err(type_fault("annotations", other)),
            },
            FieldKind::SelfPointer => match value {
                Value::Ann(ann) => {
                    let (name, store) = ctx.own.ok_or(EncodeFault::NoStore)?;
                    Ok(Wire::Value(rmpv::Value::from(wire_index(ann, name, store)?)))
                }
                other => Err(type_fault("an annotation", other)),
            },
            FieldKind::SelfPointers => match value {
                Value::AnnList(anns) => {
                    let (name, store) = ctx.own.ok_or(EncodeFault::NoStore)?;
                    let indices = anns
                        .iter()
                        .map(|ann| wire_index(ann, name, store).map(rmpv::Value::from))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Wire::Value(rmpv::Value::Array(indices)))
                }
                other => Err(type_fault("annotations", other)),
            },
        }
    }

    pub(crate) fn decode(
        &self,
        wire: rmpv::Value,
        ctx: &PointerCtx<'_>,
    ) -> Result<Value, DecodeFault> {
        if let rmpv::Value::Nil = wire {
            return Ok(Value::Null);
        }
        match self {
            FieldKind::Scalar => Ok(scalar_from_wire(wire)),
            // A malformed datetime payload degrades to null rather than
            // aborting the document.
            FieldKind::DateTime => Ok(wire
                .as_str()
                .and_then(parse_datetime)
                .map(Value::DateTime)
                .unwrap_or(Value::Null)),
            FieldKind::Text { encoding, .. } => {
                let bytes = match &wire {
                    rmpv::Value::String(s) => s.as_bytes(),
                    rmpv::Value::Binary(b) => b.as_slice(),
                    _ => return Ok(Value::Null),
                };
                let (text, _, _) = encoding.decode(bytes);
                Ok(Value::Str(text.into_owned()))
            }
            FieldKind::ByteSlice | FieldKind::AnnSlice => match wire {
                rmpv::Value::Array(items) if items.len() == 2 => {
                    match (items[0].as_u64(), items[1].as_u64()) {
                        (Some(start), Some(len)) => {
                            Ok(Value::Slice(Slice::new(start, start + len)))
                        }
                        _ => Err(DecodeFault::Malformed {
                            expected: "a [start, length] array",
                            found: rmpv::Value::Array(items),
                        }),
                    }
                }
                other => Err(DecodeFault::Malformed {
                    expected: "a [start, length] array",
                    found: other,
                }),
            },
            FieldKind::Pointer => {
                let (name, store) = ctx.target.ok_or(DecodeFault::NoStore)?;
                decode_index(wire, name, store).map(Value::Ann)
            }
            FieldKind::Pointers => {
                let (name, store) = ctx.target.ok_or(DecodeFault::NoStore)?;
                decode_indices(wire, name, store).map(Value::AnnList)
            }
            FieldKind::SelfPointer => {
                let (name, store) = ctx.own.ok_or(DecodeFault::NoStore)?;
                decode_index(wire, name, store).map(Value::Ann)
            }
            FieldKind::SelfPointers => {
                let (name, store) = ctx.own.ok_or(DecodeFault::NoStore)?;
                decode_indices(wire, name, store).map(Value::AnnList)
            }
        }
    }
}

fn type_fault(expected: &'static str, found: &Value) -> EncodeFault {
    EncodeFault::Type {
        expected,
        found: format!("{found:?}"),
    }
}

/// The wire index of a pointed-to annotation, enforcing store membership:
/// the annotation must carry a stamped index, and the target store's element
/// at that index must be the annotation itself.
fn wire_index(ann: &crate::doc::Ann, name: &str, store: &Store) -> Result<u64, EncodeFault> {
    let index = ann.index().ok_or(EncodeFault::Dangling)?;
    match store.get(index) {
        Some(occupant) if occupant.ptr_eq(ann) => Ok(index as u64),
        _ => Err(EncodeFault::NotInStore {
            store: name.to_owned(),
        }),
    }
}

fn decode_index(
    wire: rmpv::Value,
    name: &str,
    store: &Store,
) -> Result<crate::doc::Ann, DecodeFault> {
    let index = wire.as_u64().ok_or_else(|| DecodeFault::Malformed {
        expected: "a store index",
        found: wire.clone(),
    })?;
    store.get(index as usize).ok_or(DecodeFault::PointerRange {
        store: name.to_owned(),
        index,
        len: store.len(),
    })
}

fn decode_indices(
    wire: rmpv::Value,
    name: &str,
    store: &Store,
) -> Result<Vec<crate::doc::Ann>, DecodeFault> {
    match wire {
        rmpv::Value::Array(items) => items
            .into_iter()
            .map(|item| decode_index(item, name, store))
            .collect(),
        other => Err(DecodeFault::Malformed {
            expected: "an array of store indices",
            found: other,
        }),
    }
}

/// Scalars cross the wire by identity. `F32` and exotic shapes are retained
/// as `Raw` so they re-encode byte-identically.
pub(crate) fn scalar_from_wire(wire: rmpv::Value) -> Value {
    match wire {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => {
            if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Raw(rmpv::Value::Integer(n))
            }
        }
        rmpv::Value::F64(n) => Value::Float(n),
        rmpv::Value::String(s) => match s.as_str() {
            Some(text) => Value::Str(text.to_owned()),
            None => Value::Raw(rmpv::Value::String(s)),
        },
        rmpv::Value::Binary(b) => Value::Bytes(b),
        other => Value::Raw(other),
    }
}

pub(crate) fn scalar_to_wire(value: &Value) -> Result<rmpv::Value, EncodeFault> {
    match value {
        Value::Null => Ok(rmpv::Value::Nil),
        Value::Bool(b) => Ok(rmpv::Value::from(*b)),
        Value::UInt(n) => Ok(rmpv::Value::from(*n)),
        Value::Int(n) => Ok(rmpv::Value::from(*n)),
        Value::Float(n) => Ok(rmpv::Value::from(*n)),
        Value::Str(s) => Ok(rmpv::Value::from(s.as_str())),
        Value::Bytes(b) => Ok(rmpv::Value::Binary(b.clone())),
        Value::Raw(v) => Ok(v.clone()),
        other => Err(type_fault("a scalar", other)),
    }
}

#[cfg(test)]
mod test {
    use super::{scalar_from_wire, FieldKind, Value};

    #[test]
    fn test_should_write() {
        let utf8 = FieldKind::Text {
            encoding: encoding_rs::UTF_8,
            store_empty: false,
        };
        let utf8_empties = FieldKind::Text {
            encoding: encoding_rs::UTF_8,
            store_empty: true,
        };

        assert!(!FieldKind::Scalar.should_write(&Value::Null));
        assert!(FieldKind::Scalar.should_write(&Value::Bool(false)));
        assert!(FieldKind::Scalar.should_write(&Value::Str(String::new())));

        assert!(!utf8.should_write(&Value::Str(String::new())));
        assert!(utf8_empties.should_write(&Value::Str(String::new())));
        assert!(utf8.should_write(&Value::Str("x".into())));

        assert!(!FieldKind::Pointers.should_write(&Value::AnnList(vec![])));
        assert!(!FieldKind::SelfPointers.should_write(&Value::Null));
    }

    #[test]
    fn test_scalar_identity() {
        assert_eq!(scalar_from_wire(rmpv::Value::from(7u64)), Value::UInt(7));
        assert_eq!(scalar_from_wire(rmpv::Value::from(-7i64)), Value::Int(-7));
        assert_eq!(
            scalar_from_wire(rmpv::Value::from("hi")),
            Value::Str("hi".into())
        );
        // F32 stays raw so it re-encodes with the same marker.
        assert_eq!(
            scalar_from_wire(rmpv::Value::F32(0.5)),
            Value::Raw(rmpv::Value::F32(0.5))
        );
    }

    #[test]
    fn test_slice_wire_shape() {
        let ctx = super::PointerCtx {
            target: None,
            own: None,
        };
        let wire = rmpv::Value::Array(vec![rmpv::Value::from(4u64), rmpv::Value::from(5u64)]);
        let value = FieldKind::ByteSlice.decode(wire, &ctx).unwrap();
        assert_eq!(value, Value::Slice(crate::Slice::new(4, 9)));

        let super::Wire::Value(back) = FieldKind::ByteSlice.encode(&value, &ctx).unwrap() else {
            panic!("slices encode as plain values");
        };
        assert_eq!(
            back,
            rmpv::Value::Array(vec![rmpv::Value::from(4u64), rmpv::Value::from(5u64)])
        );
    }
}
