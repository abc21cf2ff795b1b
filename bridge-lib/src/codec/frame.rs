//! Byte framing for hosts that exchange raw buffers.
//!
//! Every value is a one-byte tag followed by its payload. Integers are
//! big-endian; strings and byte buffers are a `u32` length followed by the
//! bytes (no terminator); structs and lists are a `u32` count followed by
//! their items; optionals are a presence byte.

use super::WireValue;
use crate::error::{DecodeError, Error};
use crate::handle::HandleRef;

const TAG_UNIT: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_BIGINT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_STRUCT: u8 = 0x07;
const TAG_LIST: u8 = 0x08;
const TAG_OPTIONAL: u8 = 0x09;
const TAG_ENUM: u8 = 0x0a;
const TAG_HANDLE: u8 = 0x0b;

pub const MAX_DEPTH: usize = 64;

/// Fails only if a string, buffer or sequence is too long for its `u32`
/// length prefix.
pub fn encode_frame(value: &WireValue) -> crate::Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(buf)
}

fn frame_len(len: usize) -> crate::Result<u32> {
    u32::try_from(len).map_err(|_| Error::FrameTooLarge(len))
}

fn write_len(buf: &mut Vec<u8>, len: usize) -> crate::Result<()> {
    buf.extend_from_slice(&frame_len(len)?.to_be_bytes());
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, value: &WireValue) -> crate::Result<()> {
    match value {
        WireValue::Unit => buf.push(TAG_UNIT),
        WireValue::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        WireValue::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        WireValue::BigInt(v) => {
            buf.push(TAG_BIGINT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        WireValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        WireValue::Str(s) => {
            buf.push(TAG_STR);
            write_len(buf, s.len())?;
            buf.extend_from_slice(s.as_bytes());
        }
        WireValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_len(buf, b.len())?;
            buf.extend_from_slice(b);
        }
        WireValue::Struct(items) | WireValue::List(items) => {
            let tag = if matches!(value, WireValue::Struct(_)) {
                TAG_STRUCT
            } else {
                TAG_LIST
            };
            buf.push(tag);
            write_len(buf, items.len())?;
            for item in items {
                write_value(buf, item)?;
            }
        }
        WireValue::Optional(inner) => {
            buf.push(TAG_OPTIONAL);
            match inner {
                Some(item) => {
                    buf.push(1);
                    write_value(buf, item)?;
                }
                None => buf.push(0),
            }
        }
        WireValue::Enum(ordinal) => {
            buf.push(TAG_ENUM);
            buf.extend_from_slice(&ordinal.to_be_bytes());
        }
        WireValue::Handle(handle) => {
            buf.push(TAG_HANDLE);
            buf.extend_from_slice(&handle.to_bits().to_be_bytes());
        }
    }
    Ok(())
}

/// Decode exactly one value; trailing bytes are an error.
pub fn decode_frame(bytes: &[u8]) -> Result<WireValue, DecodeError> {
    let mut reader = Reader { bytes, offset: 0 };
    let value = reader.value(0)?;
    match bytes.len() - reader.offset {
        0 => Ok(value),
        n => Err(DecodeError::TrailingBytes(n)),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::Truncated(self.offset))?;
        let out = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn len(&mut self) -> Result<usize, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn value(&mut self, depth: usize) -> Result<WireValue, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }
        let offset = self.offset;
        let [tag] = self.array::<1>()?;
        let value = match tag {
            TAG_UNIT => WireValue::Unit,
            TAG_BOOL => match self.array::<1>()? {
                [0] => WireValue::Bool(false),
                [1] => WireValue::Bool(true),
                _ => return Err(DecodeError::mismatch("bool byte 0 or 1", "byte")),
            },
            TAG_INT => WireValue::Int(i64::from_be_bytes(self.array()?)),
            TAG_BIGINT => WireValue::BigInt(i128::from_be_bytes(self.array()?)),
            TAG_FLOAT => WireValue::Float(f64::from_be_bytes(self.array()?)),
            TAG_STR => {
                let len = self.len()?;
                WireValue::Str(String::from_utf8(self.take(len)?.to_vec())?)
            }
            TAG_BYTES => {
                let len = self.len()?;
                WireValue::Bytes(self.take(len)?.to_vec())
            }
            TAG_STRUCT | TAG_LIST => {
                let count = self.len()?;
                // Every item takes at least one byte.
                if count > self.bytes.len() - self.offset {
                    return Err(DecodeError::Truncated(self.offset));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                if tag == TAG_STRUCT {
                    WireValue::Struct(items)
                } else {
                    WireValue::List(items)
                }
            }
            TAG_OPTIONAL => match self.array::<1>()? {
                [0] => WireValue::Optional(None),
                [1] => WireValue::Optional(Some(Box::new(self.value(depth + 1)?))),
                _ => return Err(DecodeError::mismatch("presence byte 0 or 1", "byte")),
            },
            TAG_ENUM => WireValue::Enum(u32::from_be_bytes(self.array()?)),
            TAG_HANDLE => WireValue::Handle(HandleRef::from_bits(u64::from_be_bytes(self.array()?))),
            tag => return Err(DecodeError::UnknownTag { tag, offset }),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_is_length_prefixed() {
        let bytes = encode_frame(&WireValue::Str("héllo".to_owned())).unwrap();
        assert_eq!(bytes[0], TAG_STR);
        assert_eq!(&bytes[1..5], &6u32.to_be_bytes());
        assert_eq!(&bytes[5..], "héllo".as_bytes());
    }

    #[test]
    fn test_nested_value_roundtrip() {
        let value = WireValue::Struct(vec![
            WireValue::Int(-3),
            WireValue::BigInt(u64::MAX as i128),
            WireValue::List(vec![WireValue::Str("a".into()), WireValue::Str(String::new())]),
            WireValue::Optional(None),
            WireValue::Optional(Some(Box::new(WireValue::Enum(2)))),
            WireValue::Handle(HandleRef {
                index: 5,
                generation: 9,
            }),
            WireValue::Bytes(vec![0, 255]),
            WireValue::Float(1.5),
            WireValue::Bool(true),
            WireValue::Unit,
        ]);
        assert_eq!(decode_frame(&encode_frame(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_truncated_frame() {
        let mut bytes = encode_frame(&WireValue::Str("hello".to_owned())).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(decode_frame(&bytes), Err(DecodeError::Truncated(5))));
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = [TAG_STR, 0, 0, 0, 2, 0xc3, 0x28];
        assert!(matches!(decode_frame(&bytes), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn test_trailing_bytes_and_unknown_tag() {
        assert!(matches!(
            decode_frame(&[TAG_UNIT, TAG_UNIT]),
            Err(DecodeError::TrailingBytes(1))
        ));
        assert!(matches!(
            decode_frame(&[0x7f]),
            Err(DecodeError::UnknownTag { tag: 0x7f, offset: 0 })
        ));
    }

    #[test]
    fn test_huge_count_is_rejected_without_allocating() {
        let bytes = [TAG_LIST, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(decode_frame(&bytes), Err(DecodeError::Truncated(5))));
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = Vec::new();
        for _ in 0..=MAX_DEPTH + 1 {
            bytes.extend_from_slice(&[TAG_OPTIONAL, 1]);
        }
        bytes.push(TAG_UNIT);
        assert!(matches!(decode_frame(&bytes), Err(DecodeError::TooDeep(MAX_DEPTH))));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_length_beyond_u32_is_an_error() {
        let too_long = u32::MAX as usize + 1;
        assert!(matches!(frame_len(too_long), Err(Error::FrameTooLarge(n)) if n == too_long));
        assert_eq!(frame_len(u32::MAX as usize).unwrap(), u32::MAX);
    }
}
