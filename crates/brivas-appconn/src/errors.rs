//! Error types for the application connection stack

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AppConnError>;

/// Top-level error
#[derive(Debug, Error)]
pub enum AppConnError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// IE codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Invalid code {0}, expected 0..=255")]
    InvalidCode(i64),

    #[error("Malformed length: declared {declared}, remaining {remaining}")]
    MalformedLength { declared: usize, remaining: usize },

    #[error("Length overflow: {0} bytes exceeds 65535")]
    LengthOverflow(usize),

    #[error("Invalid length class {0:#04b}")]
    InvalidLengthClass(u8),

    #[error("Width mismatch for {ie_type}: expected {expected}, got {actual}")]
    WidthMismatch {
        ie_type: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Composite nesting exceeds {0} levels")]
    NestingTooDeep(usize),
}

/// Message envelope errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Invalid time to live {0}, expected 1..=255 seconds")]
    InvalidTimeToLive(u16),

    #[error("Unsupported protocol version 0x{0:02X}")]
    UnsupportedVersion(u8),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// RPC and connection errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Sync call timeout: remote {remote_id} code {code} after {time_to_live}s")]
    Timeout {
        remote_id: i32,
        code: u8,
        time_to_live: u8,
    },

    #[error("No healthy connection: remote {remote_id} code {code}")]
    NoHealthyConnection { remote_id: i32, code: u8 },

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Registration refused: remote {remote_id} index {index}")]
    RegistrationRefused { remote_id: i32, index: i16 },

    #[error("Connection interrupted: remote {remote_id} index {index}")]
    Interrupted { remote_id: i32, index: i16 },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl DispatchError {
    /// Whether a later retry may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Codec(_))
    }
}

/// Startup configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing property: {0}")]
    NullProperty(String),

    #[error("Invalid property {key}: {value:?}")]
    InvalidProperty { key: String, value: String },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: impl Into<String>) -> Self {
        Self::InvalidProperty {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: AppConnError = CodecError::LengthOverflow(70000).into();
        assert!(matches!(err, AppConnError::Codec(CodecError::LengthOverflow(70000))));
        assert_eq!(
            err.to_string(),
            "Codec error: Length overflow: 70000 bytes exceeds 65535"
        );
    }

    #[test]
    fn test_transient_dispatch_errors() {
        let timeout = DispatchError::Timeout {
            remote_id: 7,
            code: 3,
            time_to_live: 4,
        };
        assert!(timeout.is_transient());
        assert!(!DispatchError::Codec(CodecError::InvalidCode(300)).is_transient());
    }
}
