//! IE TLV Encoding/Decoding

use super::{Composite, IeType, InformationElement, LengthClass, MAX_NESTING_DEPTH};
use crate::errors::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

/// Outcome of decoding one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Element(InformationElement),
    /// Unassigned type nibble; the payload was consumed and discarded
    Skipped { tag: u8, code: u8, len: usize },
}

/// Tag, code and explicit length bytes for a payload of `len`
fn header_len(ie_type: IeType, len: usize) -> usize {
    let length_bytes = match (ie_type.fixed_width(), len) {
        (Some(_), _) | (None, 0) => 0,
        (None, 1..=0xFF) => 1,
        (None, _) => 2,
    };
    2 + length_bytes
}

fn put_header(
    buf: &mut BytesMut,
    ie_type: IeType,
    code: u8,
    len: usize,
) -> Result<(), CodecError> {
    let class = LengthClass::for_len(len)?;
    buf.put_u8(ie_type as u8 | class as u8);
    buf.put_u8(code);
    match class {
        LengthClass::Implicit => {}
        LengthClass::OneByte => buf.put_u8(len as u8),
        LengthClass::TwoBytes => buf.put_u16(len as u16),
    }
    Ok(())
}

fn ensure(buf: &Bytes, declared: usize) -> Result<(), CodecError> {
    if buf.remaining() < declared {
        return Err(CodecError::MalformedLength {
            declared,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

impl InformationElement {
    /// Payload size, excluding tag, code and length bytes
    pub fn payload_len(&self) -> usize {
        match self {
            Self::ByteArray { value, .. } => value.len(),
            Self::Composite(c) => c.children_len(),
            other => other.ie_type().fixed_width().unwrap_or_default(),
        }
    }

    /// Full encoded size
    pub fn encoded_len(&self) -> usize {
        let len = self.payload_len();
        header_len(self.ie_type(), len) + len
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Self::Byte { code, value } => {
                buf.put_u8(IeType::Byte as u8);
                buf.put_u8(*code);
                buf.put_i8(*value);
            }
            Self::Short { code, value } => {
                buf.put_u8(IeType::Short as u8);
                buf.put_u8(*code);
                buf.put_i16(*value);
            }
            Self::Int { code, value } => {
                buf.put_u8(IeType::Int as u8);
                buf.put_u8(*code);
                buf.put_i32(*value);
            }
            Self::Long { code, value } => {
                buf.put_u8(IeType::Long as u8);
                buf.put_u8(*code);
                buf.put_i64(*value);
            }
            Self::ByteArray { code, value } => {
                put_header(buf, IeType::ByteArray, *code, value.len())?;
                buf.put_slice(value);
            }
            Self::Composite(c) => {
                put_header(buf, IeType::Composite, c.code(), c.children_len())?;
                c.encode_children(buf)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one element from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Decoded, CodecError> {
        Self::decode_at(buf, 0)
    }

    /// `depth` counts the composites enclosing the element
    fn decode_at(buf: &mut Bytes, depth: usize) -> Result<Decoded, CodecError> {
        ensure(buf, 2)?;
        let tag = buf.get_u8();
        let code = buf.get_u8();
        let ie_type = IeType::from_tag(tag);

        let len = match LengthClass::from_tag(tag)? {
            LengthClass::Implicit => ie_type.and_then(|t| t.fixed_width()).unwrap_or(0),
            LengthClass::OneByte => {
                ensure(buf, 1)?;
                buf.get_u8() as usize
            }
            LengthClass::TwoBytes => {
                ensure(buf, 2)?;
                buf.get_u16() as usize
            }
        };
        ensure(buf, len)?;
        let mut payload = buf.split_to(len);

        let Some(ie_type) = ie_type else {
            return Ok(Decoded::Skipped { tag, code, len });
        };

        if let Some(width) = ie_type.fixed_width() {
            if width != len {
                return Err(CodecError::WidthMismatch {
                    ie_type: ie_type.name(),
                    expected: width,
                    actual: len,
                });
            }
        }

        let ie = match ie_type {
            IeType::Byte => Self::byte(code, payload.get_i8()),
            IeType::Short => Self::short(code, payload.get_i16()),
            IeType::Int => Self::int(code, payload.get_i32()),
            IeType::Long => Self::long(code, payload.get_i64()),
            IeType::ByteArray => Self::bytes(code, payload),
            IeType::Composite => {
                Self::Composite(Composite::decode_children_at(code, payload, depth + 1)?)
            }
        };
        Ok(Decoded::Element(ie))
    }
}

impl Composite {
    /// Encoded size of all children
    pub fn children_len(&self) -> usize {
        self.iter().map(InformationElement::encoded_len).sum()
    }

    pub fn encode_children(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.reserve(self.children_len());
        for ie in self.iter() {
            ie.encode(buf)?;
        }
        Ok(())
    }

    /// Decode a children payload; the payload must be consumed exactly
    pub fn decode_children(code: u8, payload: Bytes) -> Result<Self, CodecError> {
        Self::decode_children_at(code, payload, 0)
    }

    fn decode_children_at(code: u8, mut payload: Bytes, depth: usize) -> Result<Self, CodecError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CodecError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        let mut composite = Self::new(code);
        while payload.has_remaining() {
            match InformationElement::decode_at(&mut payload, depth)? {
                Decoded::Element(ie) => composite.push(ie),
                Decoded::Skipped { tag, code, len } => {
                    debug!(tag, code, len, "skipping unknown information element");
                }
            }
        }
        Ok(composite)
    }
}
