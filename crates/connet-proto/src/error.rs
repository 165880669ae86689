//! The stable error taxonomy shared by every stream role.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Protocol error codes. The numeric values are stable: they appear inside
/// framed [`Error`] messages and as QUIC close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    RequestUnknown,
    AuthenticationFailed,
    RelayInvalidCertificate,
    RelayDestinationValidationFailed,
    RelaySourceValidationFailed,
    DestinationValidationFailed,
    DestinationInvalidCertificate,
    SourceValidationFailed,
    SourceInvalidCertificate,
    DestinationNotFound,
    DestinationDialFailed,
}

impl ErrorCode {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Unknown => 0,
            ErrorCode::RequestUnknown => 1,
            ErrorCode::AuthenticationFailed => 100,
            ErrorCode::RelayInvalidCertificate => 200,
            ErrorCode::RelayDestinationValidationFailed => 201,
            ErrorCode::RelaySourceValidationFailed => 202,
            ErrorCode::DestinationValidationFailed => 300,
            ErrorCode::DestinationInvalidCertificate => 301,
            ErrorCode::SourceValidationFailed => 400,
            ErrorCode::SourceInvalidCertificate => 401,
            ErrorCode::DestinationNotFound => 500,
            ErrorCode::DestinationDialFailed => 501,
        }
    }

    /// Decode a wire value; unrecognized values fold into `Unknown`.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::RequestUnknown,
            100 => ErrorCode::AuthenticationFailed,
            200 => ErrorCode::RelayInvalidCertificate,
            201 => ErrorCode::RelayDestinationValidationFailed,
            202 => ErrorCode::RelaySourceValidationFailed,
            300 => ErrorCode::DestinationValidationFailed,
            301 => ErrorCode::DestinationInvalidCertificate,
            400 => ErrorCode::SourceValidationFailed,
            401 => ErrorCode::SourceInvalidCertificate,
            500 => ErrorCode::DestinationNotFound,
            501 => ErrorCode::DestinationDialFailed,
            _ => ErrorCode::Unknown,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ErrorCode::from_u16(u16::deserialize(deserializer)?))
    }
}

/// A typed protocol error, carried inside responses and used as the close
/// reason for streams and connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let codes = [
            (ErrorCode::Unknown, 0),
            (ErrorCode::RequestUnknown, 1),
            (ErrorCode::AuthenticationFailed, 100),
            (ErrorCode::RelayInvalidCertificate, 200),
            (ErrorCode::RelayDestinationValidationFailed, 201),
            (ErrorCode::RelaySourceValidationFailed, 202),
            (ErrorCode::DestinationValidationFailed, 300),
            (ErrorCode::DestinationInvalidCertificate, 301),
            (ErrorCode::SourceValidationFailed, 400),
            (ErrorCode::SourceInvalidCertificate, 401),
            (ErrorCode::DestinationNotFound, 500),
            (ErrorCode::DestinationDialFailed, 501),
        ];
        for (code, value) in codes {
            assert_eq!(code.as_u16(), value);
            assert_eq!(ErrorCode::from_u16(value), code);
        }
    }

    #[test]
    fn test_unrecognized_code_folds_to_unknown() {
        assert_eq!(ErrorCode::from_u16(999), ErrorCode::Unknown);
    }

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorCode::DestinationNotFound, "sws not found");
        assert_eq!(err.to_string(), "DestinationNotFound: sws not found");
    }
}
