use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use super::{Shape, WireValue};
use crate::error::{DecodeError, LogicError, Result};
use crate::handle::{HandleRef, HandleTable, OpaqueHandle};

/// Encode a value into its wire representation.
///
/// Encoding is fallible only where it touches shared state: embedding a
/// borrowed handle adds a share, which fails for a freed handle.
pub trait IntoWire {
    fn into_wire(self) -> Result<WireValue>;
}

/// Decode a value from its wire representation.
pub trait FromWire: Sized {
    fn shape() -> Shape;
    fn from_wire(wire: WireValue, de: &Decoder) -> Result<Self>;
}

/// Decoding context: the handle table that embedded handles are adopted
/// from, and a record of which shares were adopted so that a failed decode
/// can release the rest.
pub struct Decoder {
    handles: Arc<HandleTable>,
    adopted: RefCell<Vec<HandleRef>>,
}

impl Decoder {
    pub fn new(handles: Arc<HandleTable>) -> Self {
        Self {
            handles,
            adopted: RefCell::new(Vec::new()),
        }
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    fn adopt<T: Send + Sync + 'static>(&self, raw: HandleRef) -> Result<OpaqueHandle<T>> {
        // Type check before taking ownership of the share.
        self.handles.get::<T>(raw)?;
        self.adopted.borrow_mut().push(raw);
        Ok(OpaqueHandle::adopt(raw, Arc::clone(&self.handles)))
    }

    /// Release every share in `carried` that was not adopted into a proxy.
    pub(crate) fn release_unclaimed(&self, carried: Vec<HandleRef>) {
        let mut adopted = self.adopted.borrow_mut();
        for handle in carried {
            match adopted.iter().position(|h| *h == handle) {
                Some(pos) => {
                    adopted.swap_remove(pos);
                }
                None => {
                    let _ = self.handles.release(handle);
                }
            }
        }
    }
}

/// Reads the fields of a positional struct after checking its arity.
pub struct StructFields {
    fields: VecDeque<WireValue>,
}

impl StructFields {
    pub fn open(wire: WireValue, name: &'static str, arity: usize) -> Result<Self> {
        match wire {
            WireValue::Struct(fields) if fields.len() == arity => Ok(Self {
                fields: fields.into(),
            }),
            WireValue::Struct(fields) => Err(DecodeError::Arity {
                name,
                expected: arity,
                found: fields.len(),
            }
            .into()),
            other => Err(DecodeError::mismatch(format!("struct {}", name), other.kind()).into()),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next<T: FromWire>(&mut self, de: &Decoder) -> Result<T> {
        // Arity was checked in `open`, so a missing field is a macro bug.
        let wire = self.fields.pop_front().unwrap_or(WireValue::Unit);
        T::from_wire(wire, de)
    }
}

#[derive(Default)]
struct Embedded {
    depth: usize,
    shares: Vec<(HandleRef, Arc<HandleTable>)>,
}

thread_local! {
    /// Handle shares embedded by the sequences being encoded on this thread,
    /// with the table each one counts in.
    static EMBEDDED: RefCell<Embedded> = RefCell::new(Embedded::default());
}

fn embed<T: Send + Sync + 'static>(handle: OpaqueHandle<T>) -> WireValue {
    let table = Arc::clone(handle.table());
    let raw = handle.into_raw();
    EMBEDDED.with(|embedded| {
        let mut embedded = embedded.borrow_mut();
        if embedded.depth > 0 {
            embedded.shares.push((raw, table));
        }
    });
    WireValue::Handle(raw)
}

/// The items of a struct, list or argument list being encoded.
///
/// If the sequence is dropped without [`finish`](Self::finish), because an
/// item failed to encode, the handle shares embedded by the items encoded so
/// far are released. Shares inside prebuilt [`WireValue`]s are the caller's.
pub struct WireSeq {
    items: Vec<WireValue>,
    mark: usize,
    finished: bool,
    // Tied to the thread-local journal.
    _local: PhantomData<*const ()>,
}

impl WireSeq {
    pub fn with_capacity(capacity: usize) -> Self {
        let mark = EMBEDDED.with(|embedded| {
            let mut embedded = embedded.borrow_mut();
            embedded.depth += 1;
            embedded.shares.len()
        });
        Self {
            items: Vec::with_capacity(capacity),
            mark,
            finished: false,
            _local: PhantomData,
        }
    }

    pub fn push<T: IntoWire>(&mut self, value: T) -> Result<()> {
        self.items.push(value.into_wire()?);
        Ok(())
    }

    pub fn finish(mut self) -> Vec<WireValue> {
        self.finished = true;
        mem::take(&mut self.items)
    }
}

impl Drop for WireSeq {
    fn drop(&mut self) {
        let (orphaned, forgotten) = EMBEDDED.with(|embedded| {
            let mut embedded = embedded.borrow_mut();
            embedded.depth -= 1;
            let mut orphaned = Vec::new();
            let mut forgotten = Vec::new();
            if !self.finished {
                let mark = self.mark.min(embedded.shares.len());
                let mut carried: Vec<HandleRef> =
                    self.items.iter().flat_map(WireValue::handles).collect();
                for (raw, table) in embedded.shares.split_off(mark) {
                    match carried.iter().position(|h| *h == raw) {
                        Some(pos) => {
                            carried.swap_remove(pos);
                            orphaned.push((raw, table));
                        }
                        None => forgotten.push((raw, table)),
                    }
                }
            }
            if embedded.depth == 0 {
                forgotten.append(&mut embedded.shares);
            }
            (orphaned, forgotten)
        });
        // Releasing may run arbitrary drops, so not while borrowed.
        for (raw, table) in orphaned {
            let _ = table.release(raw);
        }
        drop(forgotten);
    }
}

fn mismatch<T>(expected: Shape, found: &WireValue) -> Result<T> {
    Err(DecodeError::mismatch(expected, found.kind()).into())
}

impl IntoWire for WireValue {
    fn into_wire(self) -> Result<WireValue> {
        Ok(self)
    }
}

impl FromWire for WireValue {
    fn shape() -> Shape {
        Shape::Any
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        Ok(wire)
    }
}

impl IntoWire for () {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Unit)
    }
}

impl FromWire for () {
    fn shape() -> Shape {
        Shape::Unit
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Unit => Ok(()),
            other => mismatch(Self::shape(), &other),
        }
    }
}

impl IntoWire for bool {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Bool(self))
    }
}

impl FromWire for bool {
    fn shape() -> Shape {
        Shape::Bool
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Bool(b) => Ok(b),
            other => mismatch(Self::shape(), &other),
        }
    }
}

macro_rules! wire_int {
    ($($ty:ty),*) => {$(
        impl IntoWire for $ty {
            fn into_wire(self) -> Result<WireValue> {
                Ok(WireValue::Int(i64::from(self)))
            }
        }

        impl FromWire for $ty {
            fn shape() -> Shape {
                Shape::Int
            }
            fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
                let value = match wire {
                    WireValue::Int(v) => i128::from(v),
                    WireValue::BigInt(v) => v,
                    other => return mismatch(Self::shape(), &other),
                };
                <$ty>::try_from(value).map_err(|_| {
                    DecodeError::IntRange {
                        value,
                        target: stringify!($ty),
                    }
                    .into()
                })
            }
        }
    )*};
}

// Fits the host's 64-bit int.
wire_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! wire_bigint {
    ($($ty:ty),*) => {$(
        impl IntoWire for $ty {
            fn into_wire(self) -> Result<WireValue> {
                Ok(WireValue::BigInt(self as i128))
            }
        }

        impl FromWire for $ty {
            fn shape() -> Shape {
                Shape::BigInt
            }
            fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
                let value = match wire {
                    WireValue::Int(v) => i128::from(v),
                    WireValue::BigInt(v) => v,
                    other => return mismatch(Self::shape(), &other),
                };
                <$ty>::try_from(value).map_err(|_| {
                    DecodeError::IntRange {
                        value,
                        target: stringify!($ty),
                    }
                    .into()
                })
            }
        }
    )*};
}

// Wider than the host's native int: carried boxed.
wire_bigint!(u64, usize, i128);

impl IntoWire for f64 {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Float(self))
    }
}

impl FromWire for f64 {
    fn shape() -> Shape {
        Shape::Float
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Float(v) => Ok(v),
            other => mismatch(Self::shape(), &other),
        }
    }
}

impl IntoWire for f32 {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Float(f64::from(self)))
    }
}

impl FromWire for f32 {
    fn shape() -> Shape {
        Shape::Float
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Float(v) => Ok(v as f32),
            other => mismatch(Self::shape(), &other),
        }
    }
}

impl IntoWire for String {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Str(self))
    }
}

impl IntoWire for &str {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Str(self.to_owned()))
    }
}

impl FromWire for String {
    fn shape() -> Shape {
        Shape::Str
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Str(s) => Ok(s),
            other => mismatch(Self::shape(), &other),
        }
    }
}

/// An owned byte buffer, carried as `Bytes` rather than a list of ints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuf(pub Vec<u8>);

impl IntoWire for ByteBuf {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Bytes(self.0))
    }
}

impl FromWire for ByteBuf {
    fn shape() -> Shape {
        Shape::Bytes
    }
    fn from_wire(wire: WireValue, _de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Bytes(b) => Ok(ByteBuf(b)),
            other => mismatch(Self::shape(), &other),
        }
    }
}

impl<T: IntoWire> IntoWire for Vec<T> {
    fn into_wire(self) -> Result<WireValue> {
        let mut seq = WireSeq::with_capacity(self.len());
        for item in self {
            seq.push(item)?;
        }
        Ok(WireValue::List(seq.finish()))
    }
}

impl<T: FromWire> FromWire for Vec<T> {
    fn shape() -> Shape {
        Shape::List(Box::new(T::shape()))
    }
    fn from_wire(wire: WireValue, de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::List(items) => items.into_iter().map(|item| T::from_wire(item, de)).collect(),
            other => mismatch(Self::shape(), &other),
        }
    }
}

impl<T: IntoWire> IntoWire for Option<T> {
    fn into_wire(self) -> Result<WireValue> {
        match self {
            Some(value) => Ok(WireValue::Optional(Some(Box::new(value.into_wire()?)))),
            None => Ok(WireValue::Optional(None)),
        }
    }
}

impl<T: FromWire> FromWire for Option<T> {
    fn shape() -> Shape {
        Shape::Optional(Box::new(T::shape()))
    }
    fn from_wire(wire: WireValue, de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Optional(None) => Ok(None),
            WireValue::Optional(Some(inner)) => T::from_wire(*inner, de).map(Some),
            other => mismatch(Self::shape(), &other),
        }
    }
}

/// Moves the proxy's share into the wire value.
impl<T: Send + Sync + 'static> IntoWire for OpaqueHandle<T> {
    fn into_wire(self) -> Result<WireValue> {
        Ok(embed(self))
    }
}

/// Embeds a new share; the borrowed proxy keeps its own.
impl<T: Send + Sync + 'static> IntoWire for &OpaqueHandle<T> {
    fn into_wire(self) -> Result<WireValue> {
        self.share().map(embed)
    }
}

impl<T: Send + Sync + 'static> FromWire for OpaqueHandle<T> {
    fn shape() -> Shape {
        Shape::Handle {
            type_name: std::any::type_name::<T>(),
        }
    }
    fn from_wire(wire: WireValue, de: &Decoder) -> Result<Self> {
        match wire {
            WireValue::Handle(raw) => de.adopt(raw),
            other => mismatch(Self::shape(), &other),
        }
    }
}

impl IntoWire for LogicError {
    fn into_wire(self) -> Result<WireValue> {
        Ok(WireValue::Struct(vec![WireValue::Str(self.message)]))
    }
}

impl FromWire for LogicError {
    fn shape() -> Shape {
        Shape::Struct {
            name: "LogicError",
            fields: vec![Shape::Str],
        }
    }
    fn from_wire(wire: WireValue, de: &Decoder) -> Result<Self> {
        let mut fields = StructFields::open(wire, "LogicError", 1)?;
        Ok(LogicError {
            message: fields.next(de)?,
        })
    }
}

/// Declare a struct whose wire form is a positional array in field
/// declaration order.
///
/// Reordering fields changes the wire format and must be coordinated with
/// the host.
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $($(#[$fmeta])* $fvis $field: $ty),*
        }

        impl $crate::codec::IntoWire for $name {
            #[allow(unused_mut)]
            fn into_wire(self) -> $crate::Result<$crate::codec::WireValue> {
                let arity = <[&str]>::len(&[$(stringify!($field)),*]);
                let mut seq = $crate::codec::WireSeq::with_capacity(arity);
                $(seq.push(self.$field)?;)*
                Ok($crate::codec::WireValue::Struct(seq.finish()))
            }
        }

        impl $crate::codec::FromWire for $name {
            fn shape() -> $crate::codec::Shape {
                $crate::codec::Shape::Struct {
                    name: stringify!($name),
                    fields: vec![$(<$ty as $crate::codec::FromWire>::shape()),*],
                }
            }

            #[allow(unused_variables, unused_mut)]
            fn from_wire(
                wire: $crate::codec::WireValue,
                de: &$crate::codec::Decoder,
            ) -> $crate::Result<Self> {
                let arity = <[&str]>::len(&[$(stringify!($field)),*]);
                let mut fields = $crate::codec::StructFields::open(wire, stringify!($name), arity)?;
                Ok(Self {
                    $($field: fields.next::<$ty>(de)?),*
                })
            }
        }
    };
}

/// Declare a fieldless enum whose wire form is its zero-based declaration
/// ordinal.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $variant),*
        }

        impl $crate::codec::IntoWire for $name {
            fn into_wire(self) -> $crate::Result<$crate::codec::WireValue> {
                Ok($crate::codec::WireValue::Enum(self as u32))
            }
        }

        impl $crate::codec::FromWire for $name {
            fn shape() -> $crate::codec::Shape {
                $crate::codec::Shape::Enum {
                    name: stringify!($name),
                    variants: <[&str]>::len(&[$(stringify!($variant)),*]) as u32,
                }
            }

            fn from_wire(
                wire: $crate::codec::WireValue,
                _de: &$crate::codec::Decoder,
            ) -> $crate::Result<Self> {
                let variants = <[&str]>::len(&[$(stringify!($variant)),*]) as u32;
                match wire {
                    $crate::codec::WireValue::Enum(ordinal) => [$($name::$variant),*]
                        .into_iter()
                        .nth(ordinal as usize)
                        .ok_or_else(|| {
                            $crate::error::DecodeError::Ordinal {
                                name: stringify!($name),
                                ordinal,
                                variants,
                            }
                            .into()
                        }),
                    other => Err($crate::error::DecodeError::Mismatch {
                        expected: format!("enum {}", stringify!($name)),
                        found: other.kind(),
                    }
                    .into()),
                }
            }
        }
    };
}

/// Encode each argument into a `Result<Vec<WireValue>>`, stopping at the
/// first failure. Handle shares taken for the earlier arguments are released
/// when a later one fails.
#[macro_export]
macro_rules! wire_args {
    ($($arg:expr),* $(,)?) => {
        (|| -> $crate::Result<::std::vec::Vec<$crate::codec::WireValue>> {
            #[allow(unused_mut)]
            let mut seq = $crate::codec::WireSeq::with_capacity(0);
            $(seq.push($arg)?;)*
            Ok(seq.finish())
        })()
    };
}
