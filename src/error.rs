use thiserror::Error;

/// CTAP2 status codes as returned in the first byte of a CBOR response.
pub const CTAP2_OK: u8 = 0x00;
pub const CTAP1_ERR_INVALID_COMMAND: u8 = 0x01;
pub const CTAP1_ERR_INVALID_PARAMETER: u8 = 0x02;
pub const CTAP1_ERR_INVALID_LENGTH: u8 = 0x03;
pub const CTAP1_ERR_INVALID_SEQ: u8 = 0x04;
pub const CTAP1_ERR_TIMEOUT: u8 = 0x05;
pub const CTAP1_ERR_CHANNEL_BUSY: u8 = 0x06;
pub const CTAP1_ERR_INVALID_CHANNEL: u8 = 0x0B;
pub const CTAP2_ERR_CBOR_UNEXPECTED_TYPE: u8 = 0x11;
pub const CTAP2_ERR_INVALID_CBOR: u8 = 0x12;
pub const CTAP2_ERR_MISSING_PARAMETER: u8 = 0x14;
pub const CTAP2_ERR_LIMIT_EXCEEDED: u8 = 0x15;
pub const CTAP2_ERR_FP_DATABASE_FULL: u8 = 0x17;
pub const CTAP2_ERR_LARGE_BLOB_STORAGE_FULL: u8 = 0x18;
pub const CTAP2_ERR_CREDENTIAL_EXCLUDED: u8 = 0x19;
pub const CTAP2_ERR_UNSUPPORTED_ALGORITHM: u8 = 0x26;
pub const CTAP2_ERR_OPERATION_DENIED: u8 = 0x27;
pub const CTAP2_ERR_KEY_STORE_FULL: u8 = 0x28;
pub const CTAP2_ERR_UNSUPPORTED_OPTION: u8 = 0x2B;
pub const CTAP2_ERR_INVALID_OPTION: u8 = 0x2C;
pub const CTAP2_ERR_KEEPALIVE_CANCEL: u8 = 0x2D;
pub const CTAP2_ERR_NO_CREDENTIALS: u8 = 0x2E;
pub const CTAP2_ERR_USER_ACTION_TIMEOUT: u8 = 0x2F;
pub const CTAP2_ERR_NOT_ALLOWED: u8 = 0x30;
pub const CTAP2_ERR_PIN_INVALID: u8 = 0x31;
pub const CTAP2_ERR_PIN_BLOCKED: u8 = 0x32;
pub const CTAP2_ERR_PIN_AUTH_INVALID: u8 = 0x33;
pub const CTAP2_ERR_PIN_AUTH_BLOCKED: u8 = 0x34;
pub const CTAP2_ERR_PIN_NOT_SET: u8 = 0x35;
pub const CTAP2_ERR_PIN_REQUIRED: u8 = 0x36;
pub const CTAP2_ERR_PIN_POLICY_VIOLATION: u8 = 0x37;
pub const CTAP2_ERR_PIN_TOKEN_EXPIRED: u8 = 0x38;
pub const CTAP2_ERR_REQUEST_TOO_LARGE: u8 = 0x39;
pub const CTAP2_ERR_ACTION_TIMEOUT: u8 = 0x3A;
pub const CTAP2_ERR_UP_REQUIRED: u8 = 0x3B;
pub const CTAP2_ERR_UV_BLOCKED: u8 = 0x3C;
pub const CTAP2_ERR_INTEGRITY_FAILURE: u8 = 0x3D;
pub const CTAP2_ERR_UV_INVALID: u8 = 0x3E;
pub const CTAP2_ERR_UNAUTHORIZED_PERMISSION: u8 = 0x40;

/// Decode failures of the CTAP2 CBOR subset.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CborError {
    #[error("CBOR item is truncated")]
    Truncated,
    #[error("CBOR item uses a type outside the CTAP2 subset")]
    BadType,
    #[error("CBOR item is not canonically encoded")]
    NonCanonical,
    #[error("CBOR map contains a duplicate key")]
    DuplicateKey,
    #[error("CBOR nesting exceeds the CTAP2 depth limit")]
    DepthExceeded,
}

/// Every failure the library surfaces. Authenticator refusals map 1:1
/// from CTAP2 status bytes; the remaining variants are produced locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not valid in the current session state")]
    InvalidState,
    #[error("command not allowed on this channel")]
    InvalidChannel,
    #[error("write to device failed: {0}")]
    Tx(String),
    #[error("read from device failed: {0}")]
    Rx(String),
    #[error("device reply is not CBOR")]
    RxNotCbor,
    #[error("device reply contains invalid CBOR")]
    RxInvalidCbor,
    #[error("device reply has an invalid length")]
    RxInvalidLen,
    #[error("assertion signature does not verify")]
    RxInvalidSig,
    #[error("operation timed out")]
    Timeout,
    #[error("operation canceled by the user")]
    UserCanceled,
    #[error("another operation is in flight")]
    Busy,
    #[error("internal error")]
    Internal,
    #[error("device is not a FIDO device")]
    NotFidoDevice,
    #[error("operation not allowed")]
    NotAllowed,
    #[error("PIN required")]
    PinRequired,
    #[error("PIN invalid")]
    PinInvalid,
    #[error("PIN blocked")]
    PinBlocked,
    #[error("PIN authentication blocked until power cycle")]
    PinAuthBlocked,
    #[error("PIN authentication failed")]
    PinAuthInvalid,
    #[error("PIN does not satisfy the authenticator's PIN policy")]
    PinPolicyViolation,
    #[error("no PIN is set on the authenticator")]
    PinNotSet,
    #[error("user verification blocked")]
    UvBlocked,
    #[error("user verification failed")]
    UvInvalid,
    #[error("authenticator action timed out")]
    ActionTimeout,
    #[error("algorithm not supported")]
    UnsupportedAlgorithm,
    #[error("option not supported")]
    UnsupportedOption,
    #[error("a credential from the exclude list is present")]
    CredExcluded,
    #[error("no eligible credentials")]
    NoCredentials,
    #[error("authenticator key storage is full")]
    KeyStoreFull,
    #[error("operation denied by the authenticator")]
    OperationDenied,
    #[error("large-blob storage is full")]
    LargeBlobStorageFull,
    #[error("large-blob integrity check failed")]
    IntegrityFailure,
    #[error("fingerprint database is full")]
    FpDatabaseFull,
    #[error("required parameter missing")]
    MissingParameter,
    #[error("CTAPHID error frame: status 0x{0:02x}")]
    Transport(u8),
    #[error("authenticator returned status 0x{0:02x}")]
    Device(u8),
    #[error(transparent)]
    Cbor(#[from] CborError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a non-zero CTAP2 status byte to the error taxonomy. Unknown
    /// status values are carried verbatim in `Device`.
    pub fn from_status(status: u8) -> Self {
        match status {
            CTAP1_ERR_INVALID_COMMAND => Error::NotAllowed,
            CTAP1_ERR_INVALID_PARAMETER | CTAP2_ERR_INVALID_OPTION => Error::InvalidArgument,
            CTAP1_ERR_INVALID_LENGTH | CTAP2_ERR_REQUEST_TOO_LARGE => Error::RxInvalidLen,
            CTAP1_ERR_INVALID_SEQ => Error::Rx("invalid message sequencing".into()),
            CTAP1_ERR_TIMEOUT | CTAP2_ERR_USER_ACTION_TIMEOUT | CTAP2_ERR_ACTION_TIMEOUT => {
                Error::ActionTimeout
            }
            CTAP1_ERR_CHANNEL_BUSY => Error::Busy,
            CTAP1_ERR_INVALID_CHANNEL => Error::InvalidChannel,
            CTAP2_ERR_CBOR_UNEXPECTED_TYPE => Error::RxNotCbor,
            CTAP2_ERR_INVALID_CBOR => Error::RxInvalidCbor,
            CTAP2_ERR_MISSING_PARAMETER => Error::MissingParameter,
            CTAP2_ERR_FP_DATABASE_FULL => Error::FpDatabaseFull,
            CTAP2_ERR_LARGE_BLOB_STORAGE_FULL => Error::LargeBlobStorageFull,
            CTAP2_ERR_CREDENTIAL_EXCLUDED => Error::CredExcluded,
            CTAP2_ERR_UNSUPPORTED_ALGORITHM => Error::UnsupportedAlgorithm,
            CTAP2_ERR_OPERATION_DENIED | CTAP2_ERR_UNAUTHORIZED_PERMISSION => {
                Error::OperationDenied
            }
            CTAP2_ERR_KEY_STORE_FULL => Error::KeyStoreFull,
            CTAP2_ERR_UNSUPPORTED_OPTION => Error::UnsupportedOption,
            CTAP2_ERR_KEEPALIVE_CANCEL => Error::UserCanceled,
            CTAP2_ERR_NO_CREDENTIALS => Error::NoCredentials,
            CTAP2_ERR_NOT_ALLOWED | CTAP2_ERR_UP_REQUIRED => Error::NotAllowed,
            CTAP2_ERR_PIN_INVALID => Error::PinInvalid,
            CTAP2_ERR_PIN_BLOCKED => Error::PinBlocked,
            CTAP2_ERR_PIN_AUTH_INVALID => Error::PinAuthInvalid,
            CTAP2_ERR_PIN_AUTH_BLOCKED => Error::PinAuthBlocked,
            CTAP2_ERR_PIN_NOT_SET => Error::PinNotSet,
            CTAP2_ERR_PIN_REQUIRED | CTAP2_ERR_PIN_TOKEN_EXPIRED => Error::PinRequired,
            CTAP2_ERR_PIN_POLICY_VIOLATION => Error::PinPolicyViolation,
            CTAP2_ERR_UV_BLOCKED => Error::UvBlocked,
            CTAP2_ERR_UV_INVALID => Error::UvInvalid,
            CTAP2_ERR_INTEGRITY_FAILURE => Error::IntegrityFailure,
            other => Error::Device(other),
        }
    }

    /// True for the statuses after which a cached pinUvAuthToken must be
    /// considered stale. The authenticator may have power-cycled without
    /// the host noticing, so any of these invalidates the cache.
    pub(crate) fn invalidates_token(&self) -> bool {
        matches!(
            self,
            Error::PinRequired | Error::PinAuthInvalid | Error::PinAuthBlocked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::from_status(CTAP2_ERR_PIN_INVALID), Error::PinInvalid);
        assert_eq!(
            Error::from_status(CTAP2_ERR_KEEPALIVE_CANCEL),
            Error::UserCanceled
        );
        assert_eq!(
            Error::from_status(CTAP2_ERR_NO_CREDENTIALS),
            Error::NoCredentials
        );
        assert_eq!(Error::from_status(0x7F), Error::Device(0x7F));
    }

    #[test]
    fn test_pin_token_expiry_invalidates_cache() {
        assert!(Error::from_status(CTAP2_ERR_PIN_TOKEN_EXPIRED).invalidates_token());
        assert!(Error::from_status(CTAP2_ERR_PIN_AUTH_INVALID).invalidates_token());
        assert!(!Error::from_status(CTAP2_ERR_PIN_INVALID).invalidates_token());
    }

    #[test]
    fn test_cbor_error_wraps() {
        let err: Error = CborError::DuplicateKey.into();
        assert_eq!(err, Error::Cbor(CborError::DuplicateKey));
    }
}
