//! Wire codec
//!
//! - `value`: the [`WireValue`] representation and expected [`Shape`]s
//! - `convert`: [`IntoWire`]/[`FromWire`] for scalars, containers, handles and
//!   the `wire_struct!`/`wire_enum!` declaration macros
//! - `frame`: byte framing for hosts that only exchange buffers
//! - `envelope`: completions and stream events as framable values

mod convert;
mod envelope;
mod frame;
mod value;

pub use convert::{ByteBuf, Decoder, FromWire, IntoWire, StructFields, WireSeq};
pub use envelope::{completion_envelope, stream_envelope, EnvelopeKind};
pub use frame::{decode_frame, encode_frame, MAX_DEPTH};
pub use value::{Shape, WireValue};

use std::sync::Arc;

use crate::error::Result;
use crate::handle::HandleTable;

pub fn encode<T: IntoWire>(value: T) -> Result<WireValue> {
    value.into_wire()
}

/// Decode `wire` as a `T`, adopting any embedded handles from `handles`.
///
/// On failure every handle share carried by `wire` that did not end up in a
/// proxy is released, so a malformed value never leaks a refcount.
pub fn decode<T: FromWire>(wire: WireValue, handles: &Arc<HandleTable>) -> Result<T> {
    let carried = wire.handles();
    let de = Decoder::new(Arc::clone(handles));
    match T::from_wire(wire, &de) {
        Ok(value) => Ok(value),
        Err(e) => {
            de.release_unclaimed(carried);
            Err(e)
        }
    }
}

/// Release the shares carried by a value nobody will decode.
pub fn discard(wire: WireValue, handles: &HandleTable) {
    let carried = wire.handles();
    if !carried.is_empty() {
        handles.release_all(carried);
    }
}
