use std::fmt;

use crate::error::DecodeError;
use crate::handle::HandleRef;

/// The canonical representation of a value crossing the boundary.
///
/// Structs are positional: field `i` sits at index `i` in declaration order
/// and the array length must equal the declared field count. Enums are their
/// zero-based declaration ordinal. Optional slots are `Optional(None)` when
/// absent so that absence never collides with a real value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Unit,
    Bool(bool),
    /// Integers that fit the host's native 64-bit int.
    Int(i64),
    /// Integers wider than the host's native int, carried boxed.
    BigInt(i128),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Struct(Vec<WireValue>),
    List(Vec<WireValue>),
    Optional(Option<Box<WireValue>>),
    Enum(u32),
    /// Carries exactly one share of the referenced resource.
    Handle(HandleRef),
}

impl WireValue {
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Unit => "unit",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::BigInt(_) => "bigint",
            WireValue::Float(_) => "float",
            WireValue::Str(_) => "string",
            WireValue::Bytes(_) => "bytes",
            WireValue::Struct(_) => "struct",
            WireValue::List(_) => "list",
            WireValue::Optional(_) => "optional",
            WireValue::Enum(_) => "enum",
            WireValue::Handle(_) => "handle",
        }
    }

    /// All handle references embedded anywhere in this value.
    pub fn handles(&self) -> Vec<HandleRef> {
        let mut out = Vec::new();
        self.collect_handles(&mut out);
        out
    }

    fn collect_handles(&self, out: &mut Vec<HandleRef>) {
        match self {
            WireValue::Handle(h) => out.push(*h),
            WireValue::Struct(items) | WireValue::List(items) => {
                items.iter().for_each(|item| item.collect_handles(out))
            }
            WireValue::Optional(Some(inner)) => inner.collect_handles(out),
            _ => {}
        }
    }
}

/// The shape a decoder expects a wire value to have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Unit,
    Bool,
    Int,
    BigInt,
    Float,
    Str,
    Bytes,
    Struct {
        name: &'static str,
        fields: Vec<Shape>,
    },
    List(Box<Shape>),
    Optional(Box<Shape>),
    Enum {
        name: &'static str,
        variants: u32,
    },
    Handle {
        type_name: &'static str,
    },
    /// Accepts any wire value.
    Any,
}

impl Shape {
    /// Validate `value` against this shape without consuming it.
    pub fn check(&self, value: &WireValue) -> Result<(), DecodeError> {
        match (self, value) {
            (Shape::Any, _)
            | (Shape::Unit, WireValue::Unit)
            | (Shape::Bool, WireValue::Bool(_))
            // Either integer form; the target type checks the range.
            | (Shape::Int | Shape::BigInt, WireValue::Int(_) | WireValue::BigInt(_))
            | (Shape::Float, WireValue::Float(_))
            | (Shape::Str, WireValue::Str(_))
            | (Shape::Bytes, WireValue::Bytes(_))
            | (Shape::Handle { .. }, WireValue::Handle(_)) => Ok(()),
            (Shape::Struct { name, fields }, WireValue::Struct(items)) => {
                if fields.len() != items.len() {
                    return Err(DecodeError::Arity {
                        name: *name,
                        expected: fields.len(),
                        found: items.len(),
                    });
                }
                fields
                    .iter()
                    .zip(items)
                    .try_for_each(|(shape, item)| shape.check(item))
            }
            (Shape::List(inner), WireValue::List(items)) => {
                items.iter().try_for_each(|item| inner.check(item))
            }
            (Shape::Optional(_), WireValue::Optional(None)) => Ok(()),
            (Shape::Optional(inner), WireValue::Optional(Some(item))) => inner.check(item),
            (Shape::Enum { name, variants }, WireValue::Enum(ordinal)) => {
                if ordinal < variants {
                    Ok(())
                } else {
                    Err(DecodeError::Ordinal {
                        name: *name,
                        ordinal: *ordinal,
                        variants: *variants,
                    })
                }
            }
            (shape, value) => Err(DecodeError::mismatch(shape, value.kind())),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Shape::Unit => f.write_str("unit"),
            Shape::Bool => f.write_str("bool"),
            Shape::Int => f.write_str("int"),
            Shape::BigInt => f.write_str("bigint"),
            Shape::Float => f.write_str("float"),
            Shape::Str => f.write_str("string"),
            Shape::Bytes => f.write_str("bytes"),
            Shape::Struct { name, fields } => write!(f, "struct {}/{}", name, fields.len()),
            Shape::List(inner) => write!(f, "list<{}>", inner),
            Shape::Optional(inner) => write!(f, "optional<{}>", inner),
            Shape::Enum { name, .. } => write!(f, "enum {}", name),
            Shape::Handle { type_name } => write!(f, "handle<{}>", type_name),
            Shape::Any => f.write_str("any"),
        }
    }
}
