//! Application message factory and reserved codes

use super::{IoType, Message, MessageType};
use crate::ie::InformationElement;
use serde::Serialize;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 0x20;

/// Liveness probe
pub const ECHO_CALL: u8 = 0;

/// Connection registration
pub const REGISTER_CALL: u8 = 1;

/// Element codes used by the reserved calls
pub mod ie_code {
    pub const LOCAL_ID: u8 = 0;
    pub const REMOTE_ID: u8 = 1;
    pub const INDEX: u8 = 2;
    pub const RET: u8 = 0;
}

/// Registration outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i8)]
pub enum RegisterResult {
    Failed = 0,
    Accepted = 1,
}

impl RegisterResult {
    /// Read the result IE of a register reply; anything but ACCEPTED fails
    pub fn from_ret(msg: &Message) -> Self {
        match msg.get_byte(ie_code::RET) {
            Some(v) if v == Self::Accepted as i8 => Self::Accepted,
            _ => Self::Failed,
        }
    }
}

impl Message {
    pub fn async_call(code: u8, ies: impl IntoIterator<Item = InformationElement>) -> Self {
        Self::new(PROTOCOL_VERSION, IoType::Async, MessageType::Call, code, ies)
    }

    pub fn async_ret(code: u8, ies: impl IntoIterator<Item = InformationElement>) -> Self {
        Self::new(PROTOCOL_VERSION, IoType::Async, MessageType::Ret, code, ies)
    }

    /// Sync call; id and deadline are assigned on dispatch
    pub fn call(code: u8, ies: impl IntoIterator<Item = InformationElement>) -> Self {
        Self::new(PROTOCOL_VERSION, IoType::Sync, MessageType::Call, code, ies)
    }

    /// Sync ret; the id is copied from the call it answers
    pub fn ret(ies: impl IntoIterator<Item = InformationElement>) -> Self {
        Self::new(PROTOCOL_VERSION, IoType::Sync, MessageType::Ret, 0, ies)
    }

    pub fn echo_call() -> Self {
        Self::call(ECHO_CALL, [])
    }

    pub fn echo_ret() -> Self {
        Self::ret([])
    }

    pub fn register_call(local_id: i32, remote_id: i32, index: i16) -> Self {
        Self::call(
            REGISTER_CALL,
            [
                InformationElement::int(ie_code::LOCAL_ID, local_id),
                InformationElement::int(ie_code::REMOTE_ID, remote_id),
                InformationElement::short(ie_code::INDEX, index),
            ],
        )
    }

    pub fn register_ret(result: RegisterResult) -> Self {
        Self::ret([InformationElement::byte(ie_code::RET, result as i8)])
    }
}
