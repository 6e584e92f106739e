//! Message header framing

use super::{IoType, Message, MessageType, PROTOCOL_VERSION};
use crate::errors::{CodecError, MessageError};
use crate::ie::{Composite, LengthClass};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub io_type: IoType,
    pub message_type: MessageType,
    pub length_class: LengthClass,
    pub id: u32,
    pub time_to_live: u8,
    pub code: u8,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Version and type bytes
    pub const PREFIX_LEN: usize = 2;

    /// Prefix, id, time to live, code and a two-byte length
    pub const MAX_LEN: usize = Self::PREFIX_LEN + 4 + 1 + 1 + 2;

    /// Header bytes following the prefix, as announced by the type byte
    pub fn tail_len(type_byte: u8) -> Result<usize, CodecError> {
        let io_type = IoType::from_type_byte(type_byte);
        let message_type = MessageType::from_type_byte(type_byte);
        let mut len = LengthClass::from_tag(type_byte)?.width();

        if io_type == IoType::Sync {
            len += 4;
            if message_type == MessageType::Call {
                len += 1;
            }
        }
        if io_type == IoType::Async || message_type == MessageType::Call {
            len += 1;
        }
        Ok(len)
    }

    /// Parse a header from the front of `buf`
    pub fn parse(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < Self::PREFIX_LEN {
            return Err(CodecError::MalformedLength {
                declared: Self::PREFIX_LEN,
                remaining: buf.remaining(),
            });
        }
        let version = buf.get_u8();
        let type_byte = buf.get_u8();
        let tail = Self::tail_len(type_byte)?;
        if buf.remaining() < tail {
            return Err(CodecError::MalformedLength {
                declared: tail,
                remaining: buf.remaining(),
            });
        }

        let io_type = IoType::from_type_byte(type_byte);
        let message_type = MessageType::from_type_byte(type_byte);
        let length_class = LengthClass::from_tag(type_byte)?;
        let mut header = Self {
            version,
            io_type,
            message_type,
            length_class,
            id: 0,
            time_to_live: super::DEFAULT_TIME_TO_LIVE,
            code: 0,
            payload_len: 0,
        };

        if io_type == IoType::Sync {
            header.id = buf.get_u32();
            if message_type == MessageType::Call {
                header.time_to_live = buf.get_u8();
            }
        }
        if io_type == IoType::Async || message_type == MessageType::Call {
            header.code = buf.get_u8();
        }
        header.payload_len = match length_class {
            LengthClass::Implicit => 0,
            LengthClass::OneByte => buf.get_u8() as usize,
            LengthClass::TwoBytes => buf.get_u16() as usize,
        };
        Ok(header)
    }

    /// Encoded header length
    pub fn encoded_len(&self) -> usize {
        let type_byte = self.io_type as u8 | self.message_type as u8 | self.length_class as u8;
        Self::PREFIX_LEN + Self::tail_len(type_byte).unwrap_or_default()
    }
}

impl Message {
    pub fn encoded_len(&self) -> usize {
        let payload = self.body().children_len();
        let mut len = FrameHeader::PREFIX_LEN + payload;
        len += match payload {
            0 => 0,
            1..=0xFF => 1,
            _ => 2,
        };
        if self.has_id() {
            len += 4;
        }
        if self.has_time_to_live() {
            len += 1;
        }
        if self.has_code() {
            len += 1;
        }
        len
    }

    /// Serialize header and body into one frame
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let payload_len = self.body().children_len();
        let class = LengthClass::for_len(payload_len)?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.version());
        buf.put_u8(self.type_flags() | class as u8);
        if self.has_id() {
            buf.put_u32(self.id());
        }
        if self.has_time_to_live() {
            buf.put_u8(self.time_to_live());
        }
        if self.has_code() {
            buf.put_u8(self.code());
        }
        match class {
            LengthClass::Implicit => {}
            LengthClass::OneByte => buf.put_u8(payload_len as u8),
            LengthClass::TwoBytes => buf.put_u16(payload_len as u16),
        }
        self.body().encode_children(&mut buf)?;
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, MessageError> {
        let header = FrameHeader::parse(buf)?;
        if header.version != PROTOCOL_VERSION {
            return Err(MessageError::UnsupportedVersion(header.version));
        }
        if buf.remaining() < header.payload_len {
            return Err(CodecError::MalformedLength {
                declared: header.payload_len,
                remaining: buf.remaining(),
            }
            .into());
        }
        let payload = buf.split_to(header.payload_len);
        Self::from_frame(header, payload)
    }

    /// Assemble a message from a parsed header and its payload
    pub fn from_frame(header: FrameHeader, payload: Bytes) -> Result<Self, MessageError> {
        if header.time_to_live == 0 {
            return Err(MessageError::InvalidTimeToLive(0));
        }
        let body = Composite::decode_children(header.code, payload)?;
        let mut msg = Self::new(
            header.version,
            header.io_type,
            header.message_type,
            header.code,
            [],
        );
        msg.set_id(header.id);
        msg.time_to_live = header.time_to_live;
        msg.body = body;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::InformationElement;

    #[test]
    fn test_sync_call_bytes() {
        let msg = Message::call(1, [InformationElement::int(0, 42)]);
        let encoded = msg.encode().unwrap();

        assert_eq!(
            encoded.as_ref(),
            &[
                0x20, 0x21, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01, 0x06, 0x20, 0x00, 0x00, 0x00,
                0x00, 0x2A
            ]
        );
        assert_eq!(encoded.len(), msg.encoded_len());
    }

    #[test]
    fn test_sync_ret_omits_code_and_ttl() {
        let mut msg = Message::ret([InformationElement::byte(0, 1)]);
        msg.set_id(0x0102_0304);
        let encoded = msg.encode().unwrap();

        assert_eq!(
            encoded.as_ref(),
            &[0x20, 0x31, 0x01, 0x02, 0x03, 0x04, 0x03, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_async_call_without_body() {
        let msg = Message::async_call(9, []);
        assert_eq!(msg.encode().unwrap().as_ref(), &[0x20, 0x00, 0x09]);
    }

    #[test]
    fn test_roundtrip_with_two_byte_length() {
        let mut msg = Message::call(
            12,
            [
                InformationElement::bytes(0, vec![0xA5u8; 400]),
                InformationElement::long(1, -9),
            ],
        )
        .with_time_to_live(30)
        .unwrap();
        msg.set_id(77);

        let mut encoded = msg.encode().unwrap().freeze();
        assert_eq!(encoded[1] & 0x03, 0x02);
        let header = FrameHeader::parse(&mut encoded.clone()).unwrap();
        assert_eq!(header.encoded_len(), 2 + 4 + 1 + 1 + 2);
        assert_eq!(header.payload_len, 4 + 400 + 10);

        let decoded = Message::decode(&mut encoded).unwrap();
        assert_eq!(decoded, msg);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_tail_len() {
        assert_eq!(FrameHeader::tail_len(0x21).unwrap(), 4 + 1 + 1 + 1);
        assert_eq!(FrameHeader::tail_len(0x30).unwrap(), 4);
        assert_eq!(FrameHeader::tail_len(0x12).unwrap(), 1 + 2);
        assert_eq!(
            FrameHeader::tail_len(0x23),
            Err(CodecError::InvalidLengthClass(3))
        );
    }

    #[test]
    fn test_version_mismatch() {
        let mut frame = Bytes::from_static(&[0x10, 0x00, 0x01]);
        assert_eq!(
            Message::decode(&mut frame),
            Err(MessageError::UnsupportedVersion(0x10))
        );
    }

    #[test]
    fn test_truncated_frame() {
        let mut frame = Bytes::from_static(&[0x20, 0x01, 0x05, 0x08, 0x00]);
        assert_eq!(
            Message::decode(&mut frame),
            Err(MessageError::Codec(CodecError::MalformedLength {
                declared: 8,
                remaining: 1
            }))
        );

        let mut short_header = Bytes::from_static(&[0x20, 0x20, 0x00]);
        assert!(matches!(
            Message::decode(&mut short_header),
            Err(MessageError::Codec(CodecError::MalformedLength { .. }))
        ));
    }

    #[test]
    fn test_zero_time_to_live_rejected() {
        let mut frame = Bytes::from_static(&[0x20, 0x20, 0x00, 0x00, 0x00, 0x01, 0x00, 0x05]);
        assert_eq!(
            Message::decode(&mut frame),
            Err(MessageError::InvalidTimeToLive(0))
        );
    }
}
