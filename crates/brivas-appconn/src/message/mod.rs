//! Message envelope
//!
//! A message is a composite body wrapped in a header carrying the protocol
//! version, the I/O type (async/sync), the message type (call/ret), a
//! correlation id for sync traffic and a time to live for sync calls.

mod app;
mod codec;

pub use app::{ie_code, RegisterResult, ECHO_CALL, PROTOCOL_VERSION, REGISTER_CALL};
pub use codec::FrameHeader;

use crate::errors::MessageError;
use crate::ie::{Composite, InformationElement};
use serde::Serialize;
use std::ops::{Deref, DerefMut};

/// Mask selecting the I/O type in the header type byte
pub const IO_TYPE_MASK: u8 = 0x20;

/// Mask selecting the message type in the header type byte
pub const MESSAGE_TYPE_MASK: u8 = 0x10;

/// Default sync call time to live, in seconds
pub const DEFAULT_TIME_TO_LIVE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum IoType {
    Async = 0x00,
    Sync = 0x20,
}

impl IoType {
    pub fn from_type_byte(b: u8) -> Self {
        if b & IO_TYPE_MASK != 0 {
            Self::Sync
        } else {
            Self::Async
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum MessageType {
    Call = 0x00,
    Ret = 0x10,
}

impl MessageType {
    pub fn from_type_byte(b: u8) -> Self {
        if b & MESSAGE_TYPE_MASK != 0 {
            Self::Ret
        } else {
            Self::Call
        }
    }
}

/// Protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    version: u8,
    io_type: IoType,
    message_type: MessageType,
    id: u32,
    time_to_live: u8,
    body: Composite,
}

impl Message {
    pub fn new(
        version: u8,
        io_type: IoType,
        message_type: MessageType,
        code: u8,
        ies: impl IntoIterator<Item = InformationElement>,
    ) -> Self {
        Self {
            version,
            io_type,
            message_type,
            id: 0,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            body: Composite::from_elements(code, ies),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_sync(&self) -> bool {
        self.io_type == IoType::Sync
    }

    pub fn is_async(&self) -> bool {
        self.io_type == IoType::Async
    }

    pub fn is_call(&self) -> bool {
        self.message_type == MessageType::Call
    }

    pub fn is_ret(&self) -> bool {
        self.message_type == MessageType::Ret
    }

    pub fn is_sync_call(&self) -> bool {
        self.is_sync() && self.is_call()
    }

    /// Header type bits, without the length class
    pub fn type_flags(&self) -> u8 {
        self.io_type as u8 | self.message_type as u8
    }

    /// Correlation id; only carried on the wire by sync messages
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    /// Task code; not carried on the wire by sync rets
    pub fn code(&self) -> u8 {
        self.body.code()
    }

    pub fn set_code(&mut self, code: u8) {
        self.body.set_code(code);
    }

    /// Seconds the receiver has to produce a reply
    pub fn time_to_live(&self) -> u8 {
        self.time_to_live
    }

    pub fn set_time_to_live(&mut self, seconds: u16) -> Result<(), MessageError> {
        match u8::try_from(seconds) {
            Ok(ttl) if ttl > 0 => {
                self.time_to_live = ttl;
                Ok(())
            }
            _ => Err(MessageError::InvalidTimeToLive(seconds)),
        }
    }

    pub fn with_time_to_live(mut self, seconds: u16) -> Result<Self, MessageError> {
        self.set_time_to_live(seconds)?;
        Ok(self)
    }

    pub(crate) fn has_id(&self) -> bool {
        self.is_sync()
    }

    pub(crate) fn has_time_to_live(&self) -> bool {
        self.is_sync_call()
    }

    pub(crate) fn has_code(&self) -> bool {
        self.is_async() || self.is_call()
    }

    pub fn body(&self) -> &Composite {
        &self.body
    }

    pub fn into_body(self) -> Composite {
        self.body
    }

    /// Structured rendering for trace logs
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Deref for Message {
    type Target = Composite;

    fn deref(&self) -> &Composite {
        &self.body
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Composite {
        &mut self.body
    }
}
