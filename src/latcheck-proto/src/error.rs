//! Result codes and protocol errors.
//!
//! `ResultCode` is the numeric taxonomy carried in LOGIN_OK/LOGIN_FAIL and
//! REPORT_OK/REPORT_FAIL payloads; `ProtoError` covers everything that can go
//! wrong while encoding or decoding a frame.

use thiserror::Error;

/// Numeric result codes carried in response payloads.
///
/// Codes are grouped by class: 1xxx user, 2xxx database, 3xxx data format,
/// 4xxx network, 5xxx server internal. `Success` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,

    // User class
    InvalidUser = 1001,
    UserDisabled = 1002,
    PermissionDenied = 1003,
    InvalidPassword = 1004,
    UserExists = 1005,
    UserNotFound = 1006,
    PasswordTooShort = 1007,
    PasswordTooSimple = 1008,
    PasswordSameAsOld = 1009,

    // Database class
    DatabaseError = 2001,
    ConnectionFailed = 2002,
    QueryFailed = 2003,
    TransactionFailed = 2004,

    // Data class
    InvalidData = 3001,
    InvalidJson = 3002,
    MissingParameter = 3003,
    InvalidParameter = 3004,

    // Network class
    NetworkError = 4001,
    ConnectionTimeout = 4002,
    TlsError = 4003,
    HttpError = 4004,

    // Internal class
    ServerInternal = 5001,
    ConfigError = 5002,
    LogError = 5003,
    SecurityError = 5004,
}

impl ResultCode {
    /// Wire representation of this code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parse a wire value back into a known code.
    pub fn from_code(value: u32) -> Option<Self> {
        use ResultCode::*;
        Some(match value {
            0 => Success,
            1001 => InvalidUser,
            1002 => UserDisabled,
            1003 => PermissionDenied,
            1004 => InvalidPassword,
            1005 => UserExists,
            1006 => UserNotFound,
            1007 => PasswordTooShort,
            1008 => PasswordTooSimple,
            1009 => PasswordSameAsOld,
            2001 => DatabaseError,
            2002 => ConnectionFailed,
            2003 => QueryFailed,
            2004 => TransactionFailed,
            3001 => InvalidData,
            3002 => InvalidJson,
            3003 => MissingParameter,
            3004 => InvalidParameter,
            4001 => NetworkError,
            4002 => ConnectionTimeout,
            4003 => TlsError,
            4004 => HttpError,
            5001 => ServerInternal,
            5002 => ConfigError,
            5003 => LogError,
            5004 => SecurityError,
            _ => return None,
        })
    }

    /// True for `Success`.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Error type for frame and payload codecs.
///
/// Every variant is a protocol violation: the receiver answers (where a
/// response is still possible) with `InvalidParameter` and closes the
/// connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Header carries a message type outside the recognized range
    #[error("unknown message type 0x{0:04x}")]
    UnknownMessageType(u32),

    /// Header announces a payload larger than the 1 MiB cap
    #[error("payload of {0} bytes exceeds frame limit")]
    OversizeFrame(u32),

    /// Fixed-width payload does not match the expected size exactly
    #[error("{kind} payload size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Fixed string field has no NUL terminator inside its buffer
    #[error("{0} field is not NUL-terminated")]
    UnterminatedString(&'static str),

    /// String field is not valid UTF-8
    #[error("{0} field is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// String field too long to fit its fixed wire buffer
    #[error("{field} of {len} bytes does not fit in {max} byte field")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Response carries a result code outside the taxonomy
    #[error("unknown result code {0}")]
    UnknownResultCode(u32),
}

impl ProtoError {
    /// Result code reported to the peer for this violation.
    pub fn result_code(&self) -> ResultCode {
        ResultCode::InvalidParameter
    }
}
