//! Information Elements
//!
//! Typed, coded units of the wire protocol. Every element carries a one-byte
//! code scoped to its enclosing composite; primitives hold a fixed-width
//! signed integer or an opaque byte string, composites hold an ordered
//! multiset of children keyed by code.

mod codec;

pub use codec::Decoded;

use crate::errors::CodecError;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;

/// Mask selecting the element type in the tag byte
pub const IE_TYPE_MASK: u8 = 0xF0;

/// Mask selecting the length class in the tag byte
pub const LENGTH_CLASS_MASK: u8 = 0x03;

/// Largest payload expressible with a two-byte length
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

/// Deepest composite nesting accepted from the wire
pub const MAX_NESTING_DEPTH: usize = 64;

/// Element type (high nibble of the tag byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum IeType {
    Byte = 0x00,
    Short = 0x10,
    Int = 0x20,
    Long = 0x30,
    ByteArray = 0x80,
    Composite = 0xF0,
}

impl IeType {
    /// Resolve the type from a tag byte, `None` for unassigned nibbles
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag & IE_TYPE_MASK {
            0x00 => Some(Self::Byte),
            0x10 => Some(Self::Short),
            0x20 => Some(Self::Int),
            0x30 => Some(Self::Long),
            0x80 => Some(Self::ByteArray),
            0xF0 => Some(Self::Composite),
            _ => None,
        }
    }

    /// Payload width of fixed-size primitives
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Byte => Some(1),
            Self::Short => Some(2),
            Self::Int => Some(4),
            Self::Long => Some(8),
            Self::ByteArray | Self::Composite => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::ByteArray => "byteArray",
            Self::Composite => "composite",
        }
    }
}

/// Number of explicit length bytes following the code (low 2 bits of the tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LengthClass {
    Implicit = 0x00,
    OneByte = 0x01,
    TwoBytes = 0x02,
}

impl LengthClass {
    /// Smallest class able to carry `len` payload bytes
    pub fn for_len(len: usize) -> Result<Self, CodecError> {
        match len {
            0 => Ok(Self::Implicit),
            1..=0xFF => Ok(Self::OneByte),
            0x100..=MAX_PAYLOAD_LEN => Ok(Self::TwoBytes),
            _ => Err(CodecError::LengthOverflow(len)),
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag & LENGTH_CLASS_MASK {
            0x00 => Ok(Self::Implicit),
            0x01 => Ok(Self::OneByte),
            0x02 => Ok(Self::TwoBytes),
            bits => Err(CodecError::InvalidLengthClass(bits)),
        }
    }

    /// Number of length bytes on the wire
    pub fn width(&self) -> usize {
        *self as usize
    }
}

/// A validated element code
///
/// Element constructors take `u8` directly; `Code` is the checked entry point
/// for codes coming from wider integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Code(u8);

impl Code {
    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Code {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl From<Code> for u8 {
    fn from(code: Code) -> Self {
        code.0
    }
}

macro_rules! code_try_from {
    ($($t:ty),*) => {
        $(
            impl TryFrom<$t> for Code {
                type Error = CodecError;

                fn try_from(v: $t) -> Result<Self, Self::Error> {
                    u8::try_from(v)
                        .map(Self)
                        .map_err(|_| CodecError::InvalidCode(v as i64))
                }
            }
        )*
    };
}

code_try_from!(i16, i32, i64, u16, u32);

/// Information Element
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InformationElement {
    Byte { code: u8, value: i8 },
    Short { code: u8, value: i16 },
    Int { code: u8, value: i32 },
    Long { code: u8, value: i64 },
    ByteArray { code: u8, value: Bytes },
    Composite(Composite),
}

impl InformationElement {
    pub fn byte(code: u8, value: i8) -> Self {
        Self::Byte { code, value }
    }

    pub fn short(code: u8, value: i16) -> Self {
        Self::Short { code, value }
    }

    pub fn int(code: u8, value: i32) -> Self {
        Self::Int { code, value }
    }

    pub fn long(code: u8, value: i64) -> Self {
        Self::Long { code, value }
    }

    pub fn bytes(code: u8, value: impl Into<Bytes>) -> Self {
        Self::ByteArray {
            code,
            value: value.into(),
        }
    }

    /// Byte array carrying the UTF-8 bytes of `value`
    pub fn string(code: u8, value: &str) -> Self {
        Self::bytes(code, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Byte { code, .. }
            | Self::Short { code, .. }
            | Self::Int { code, .. }
            | Self::Long { code, .. }
            | Self::ByteArray { code, .. } => *code,
            Self::Composite(c) => c.code(),
        }
    }

    pub fn ie_type(&self) -> IeType {
        match self {
            Self::Byte { .. } => IeType::Byte,
            Self::Short { .. } => IeType::Short,
            Self::Int { .. } => IeType::Int,
            Self::Long { .. } => IeType::Long,
            Self::ByteArray { .. } => IeType::ByteArray,
            Self::Composite(_) => IeType::Composite,
        }
    }

    pub fn as_byte(&self) -> Option<i8> {
        match self {
            Self::Byte { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_short(&self) -> Option<i16> {
        match self {
            Self::Short { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::ByteArray { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Byte array contents as text, invalid UTF-8 replaced
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            Self::Composite(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Composite> for InformationElement {
    fn from(c: Composite) -> Self {
        Self::Composite(c)
    }
}

/// Composite Information Element
///
/// Children are kept per code in insertion order; the wire order is ascending
/// code, then insertion order within a code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Composite {
    code: u8,
    children: BTreeMap<u8, Vec<InformationElement>>,
}

impl Composite {
    pub fn new(code: u8) -> Self {
        Self {
            code,
            children: BTreeMap::new(),
        }
    }

    pub fn from_elements(code: u8, ies: impl IntoIterator<Item = InformationElement>) -> Self {
        let mut composite = Self::new(code);
        composite.extend(ies);
        composite
    }

    /// Builder-style push
    pub fn with(mut self, ie: impl Into<InformationElement>) -> Self {
        self.push(ie.into());
        self
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub(crate) fn set_code(&mut self, code: u8) {
        self.code = code;
    }

    /// Append a child; duplicates under one code are kept in order
    pub fn push(&mut self, ie: InformationElement) {
        self.children.entry(ie.code()).or_default().push(ie);
    }

    pub fn extend(&mut self, ies: impl IntoIterator<Item = InformationElement>) {
        for ie in ies {
            self.push(ie);
        }
    }

    pub fn contains(&self, code: u8) -> bool {
        self.children.contains_key(&code)
    }

    /// First child under `code`
    pub fn get(&self, code: u8) -> Option<&InformationElement> {
        self.children.get(&code).and_then(|v| v.first())
    }

    /// Every child under `code`, in insertion order
    pub fn get_all(&self, code: u8) -> &[InformationElement] {
        self.children
            .get(&code)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Remove every child under `code`
    pub fn remove(&mut self, code: u8) -> Vec<InformationElement> {
        self.children.remove(&code).unwrap_or_default()
    }

    /// Total number of direct children
    pub fn len(&self) -> usize {
        self.children.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Direct children in wire order
    pub fn iter(&self) -> impl Iterator<Item = &InformationElement> {
        self.children.values().flatten()
    }

    pub fn get_byte(&self, code: u8) -> Option<i8> {
        self.get(code).and_then(InformationElement::as_byte)
    }

    pub fn get_short(&self, code: u8) -> Option<i16> {
        self.get(code).and_then(InformationElement::as_short)
    }

    pub fn get_int(&self, code: u8) -> Option<i32> {
        self.get(code).and_then(InformationElement::as_int)
    }

    pub fn get_long(&self, code: u8) -> Option<i64> {
        self.get(code).and_then(InformationElement::as_long)
    }

    pub fn get_bytes(&self, code: u8) -> Option<&Bytes> {
        self.get(code).and_then(InformationElement::as_bytes)
    }

    pub fn get_string(&self, code: u8) -> Option<String> {
        self.get(code).and_then(InformationElement::as_string)
    }

    pub fn get_composite(&self, code: u8) -> Option<&Composite> {
        self.get(code).and_then(InformationElement::as_composite)
    }
}

impl Extend<InformationElement> for Composite {
    fn extend<T: IntoIterator<Item = InformationElement>>(&mut self, iter: T) {
        Composite::extend(self, iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_range() {
        assert_eq!(Code::try_from(255i32).unwrap().value(), 255);
        assert_eq!(Code::try_from(256i32), Err(CodecError::InvalidCode(256)));
        assert_eq!(Code::try_from(-1i32), Err(CodecError::InvalidCode(-1)));
    }

    #[test]
    fn test_tag_resolution() {
        assert_eq!(IeType::from_tag(0x21), Some(IeType::Int));
        assert_eq!(IeType::from_tag(0xF2), Some(IeType::Composite));
        assert_eq!(IeType::from_tag(0x40), None);
        assert_eq!(LengthClass::from_tag(0x82), Ok(LengthClass::TwoBytes));
        assert_eq!(
            LengthClass::from_tag(0x83),
            Err(CodecError::InvalidLengthClass(3))
        );
    }

    #[test]
    fn test_length_class_boundaries() {
        assert_eq!(LengthClass::for_len(0), Ok(LengthClass::Implicit));
        assert_eq!(LengthClass::for_len(255), Ok(LengthClass::OneByte));
        assert_eq!(LengthClass::for_len(256), Ok(LengthClass::TwoBytes));
        assert_eq!(LengthClass::for_len(65535), Ok(LengthClass::TwoBytes));
        assert_eq!(
            LengthClass::for_len(65536),
            Err(CodecError::LengthOverflow(65536))
        );
    }

    #[test]
    fn test_duplicate_codes_keep_order() {
        let c = Composite::new(9)
            .with(InformationElement::int(1, 10))
            .with(InformationElement::string(2, "x"))
            .with(InformationElement::int(1, 20));

        assert_eq!(c.len(), 3);
        assert_eq!(c.get_int(1), Some(10));
        let all: Vec<i32> = c.get_all(1).iter().filter_map(|ie| ie.as_int()).collect();
        assert_eq!(all, vec![10, 20]);
        assert!(c.get_all(7).is_empty());
    }

    #[test]
    fn test_typed_getters_check_variant() {
        let c = Composite::new(0)
            .with(InformationElement::short(3, 7))
            .with(InformationElement::string(4, "hello"));

        assert_eq!(c.get_short(3), Some(7));
        assert_eq!(c.get_int(3), None);
        assert_eq!(c.get_string(4).as_deref(), Some("hello"));
        assert_eq!(c.get_composite(4), None);
    }

    #[test]
    fn test_clone_is_deep() {
        let inner = Composite::new(1).with(InformationElement::long(0, 5));
        let original = Composite::new(0).with(inner);
        let mut copy = original.clone();
        copy.remove(1);

        assert!(copy.is_empty());
        assert_eq!(
            original.get_composite(1).and_then(|c| c.get_long(0)),
            Some(5)
        );
    }
}
