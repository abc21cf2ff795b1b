//! Completion and stream envelopes for hosts that only exchange framed
//! buffers and so cannot receive a `Completion` directly.
//!
//! An envelope is a two-field struct: an [`EnvelopeKind`] ordinal followed by
//! the payload. `Failed` and `Closed` carry the error message as an optional
//! string.

use super::WireValue;
use crate::types::{Completion, StreamEvent};

crate::wire_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EnvelopeKind {
        Value,
        LogicFailure,
        Failed,
        Item,
        Closed,
    }
}

fn envelope(kind: EnvelopeKind, payload: WireValue) -> WireValue {
    WireValue::Struct(vec![WireValue::Enum(kind as u32), payload])
}

fn message(error: Option<String>) -> WireValue {
    WireValue::Optional(error.map(|e| Box::new(WireValue::Str(e))))
}

/// Handle shares in the payload are copied, not moved: whoever receives
/// the envelope takes them over, and the caller must not also release them.
pub fn completion_envelope(completion: &Completion) -> WireValue {
    match completion {
        Completion::Value(wire) => envelope(EnvelopeKind::Value, wire.clone()),
        Completion::LogicFailure(wire) => envelope(EnvelopeKind::LogicFailure, wire.clone()),
        Completion::Failed(e) => envelope(EnvelopeKind::Failed, message(Some(e.to_string()))),
    }
}

pub fn stream_envelope(event: &StreamEvent) -> WireValue {
    match event {
        StreamEvent::Item(wire) => envelope(EnvelopeKind::Item, wire.clone()),
        StreamEvent::Closed(error) => {
            envelope(EnvelopeKind::Closed, message(error.as_ref().map(|e| e.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_frame, encode_frame};
    use crate::Error;

    #[test]
    fn test_failed_completion_carries_message() {
        let wire = completion_envelope(&Completion::Failed(Error::NotRunning));
        assert_eq!(
            decode_frame(&encode_frame(&wire).unwrap()).unwrap(),
            WireValue::Struct(vec![
                WireValue::Enum(2),
                WireValue::Optional(Some(Box::new(WireValue::Str("bridge is not running".into())))),
            ])
        );
    }

    #[test]
    fn test_stream_envelopes() {
        assert_eq!(
            stream_envelope(&StreamEvent::Item(WireValue::Int(4))),
            WireValue::Struct(vec![WireValue::Enum(3), WireValue::Int(4)])
        );
        assert_eq!(
            stream_envelope(&StreamEvent::Closed(None)),
            WireValue::Struct(vec![WireValue::Enum(4), WireValue::Optional(None)])
        );
    }
}
