//! Error types for Shoal operations.

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::constants::*;

/// Wire status words returned by the key/value service.
///
/// These correspond to the 16-bit status field of a response header and
/// enable clients to handle specific server conditions appropriately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    /// The operation succeeded.
    Success = STATUS_SUCCESS,
    /// The key does not exist.
    KeyNotFound = STATUS_KEY_NOT_FOUND,
    /// The key exists or a CAS precondition failed.
    KeyExists = STATUS_KEY_EXISTS,
    /// The value exceeds the server's size limit.
    ValueTooLarge = STATUS_VALUE_TOO_LARGE,
    /// The request was malformed or its arguments invalid.
    InvalidArguments = STATUS_INVALID_ARGUMENTS,
    /// The item was not stored.
    NotStored = STATUS_NOT_STORED,
    /// Arithmetic on a non-numeric value.
    DeltaBadval = STATUS_DELTA_BADVAL,
    /// The vBucket is not owned by the receiving node.
    NotMyVBucket = STATUS_NOT_MY_VBUCKET,
    /// No bucket is selected on the connection.
    NoBucket = STATUS_NO_BUCKET,
    /// The document is locked.
    Locked = STATUS_LOCKED,
    /// Authentication material has gone stale.
    AuthStale = STATUS_AUTH_STALE,
    /// Authentication failed.
    AuthError = STATUS_AUTH_ERROR,
    /// The SASL conversation requires a further step.
    AuthContinue = STATUS_AUTH_CONTINUE,
    /// A numeric argument was out of range.
    Erange = STATUS_ERANGE,
    /// Access denied for the authenticated user.
    Eaccess = STATUS_EACCESS,
    /// The node is still warming up.
    NotInitialized = STATUS_NOT_INITIALIZED,
    /// The opcode is unknown to the server.
    UnknownCommand = STATUS_UNKNOWN_COMMAND,
    /// The server is out of memory.
    OutOfMemory = STATUS_OUT_OF_MEMORY,
    /// The operation is not supported.
    NotSupported = STATUS_NOT_SUPPORTED,
    /// Internal server error.
    InternalError = STATUS_INTERNAL_ERROR,
    /// The server is too busy.
    Busy = STATUS_BUSY,
    /// Temporary failure; retry later.
    TemporaryFailure = STATUS_TEMPORARY_FAILURE,
    /// The collection id is unknown to the server.
    UnknownCollection = STATUS_UNKNOWN_COLLECTION,
    /// The requested durability level is invalid.
    DurabilityInvalidLevel = STATUS_DURABILITY_INVALID_LEVEL,
    /// The requested durability level cannot currently be met.
    DurabilityImpossible = STATUS_DURABILITY_IMPOSSIBLE,
    /// A durable write on this key is already in progress.
    SyncWriteInProgress = STATUS_SYNC_WRITE_IN_PROGRESS,
    /// A durable write completed ambiguously.
    SyncWriteAmbiguous = STATUS_SYNC_WRITE_AMBIGUOUS,
    /// Sub-document: path not found.
    SubdocPathNotFound = STATUS_SUBDOC_PATH_NOT_FOUND,
    /// Sub-document: path type mismatch.
    SubdocPathMismatch = STATUS_SUBDOC_PATH_MISMATCH,
    /// Sub-document: invalid path syntax.
    SubdocPathInvalid = STATUS_SUBDOC_PATH_INVALID,
    /// Sub-document: path too long or too deep.
    SubdocPathTooBig = STATUS_SUBDOC_PATH_TOO_BIG,
    /// Sub-document: document too deep to parse.
    SubdocDocTooDeep = STATUS_SUBDOC_DOC_TOO_DEEP,
    /// Sub-document: value cannot be inserted at the path.
    SubdocCannotInsert = STATUS_SUBDOC_CANNOT_INSERT,
    /// Sub-document: the document is not JSON.
    SubdocDocNotJson = STATUS_SUBDOC_DOC_NOT_JSON,
    /// Sub-document: numeric value out of range.
    SubdocNumRange = STATUS_SUBDOC_NUM_RANGE,
    /// Sub-document: counter delta out of range.
    SubdocDeltaRange = STATUS_SUBDOC_DELTA_RANGE,
    /// Sub-document: the path already exists.
    SubdocPathExists = STATUS_SUBDOC_PATH_EXISTS,
    /// Sub-document: the resulting value would be too deep.
    SubdocValueTooDeep = STATUS_SUBDOC_VALUE_TOO_DEEP,
    /// Sub-document: invalid spec combination.
    SubdocInvalidCombo = STATUS_SUBDOC_INVALID_COMBO,
    /// Sub-document: one or more paths failed.
    SubdocMultiPathFailure = STATUS_SUBDOC_MULTI_PATH_FAILURE,
}

impl Status {
    /// Creates a `Status` from its wire value.
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            STATUS_SUCCESS => Some(Self::Success),
            STATUS_KEY_NOT_FOUND => Some(Self::KeyNotFound),
            STATUS_KEY_EXISTS => Some(Self::KeyExists),
            STATUS_VALUE_TOO_LARGE => Some(Self::ValueTooLarge),
            STATUS_INVALID_ARGUMENTS => Some(Self::InvalidArguments),
            STATUS_NOT_STORED => Some(Self::NotStored),
            STATUS_DELTA_BADVAL => Some(Self::DeltaBadval),
            STATUS_NOT_MY_VBUCKET => Some(Self::NotMyVBucket),
            STATUS_NO_BUCKET => Some(Self::NoBucket),
            STATUS_LOCKED => Some(Self::Locked),
            STATUS_AUTH_STALE => Some(Self::AuthStale),
            STATUS_AUTH_ERROR => Some(Self::AuthError),
            STATUS_AUTH_CONTINUE => Some(Self::AuthContinue),
            STATUS_ERANGE => Some(Self::Erange),
            STATUS_EACCESS => Some(Self::Eaccess),
            STATUS_NOT_INITIALIZED => Some(Self::NotInitialized),
            STATUS_UNKNOWN_COMMAND => Some(Self::UnknownCommand),
            STATUS_OUT_OF_MEMORY => Some(Self::OutOfMemory),
            STATUS_NOT_SUPPORTED => Some(Self::NotSupported),
            STATUS_INTERNAL_ERROR => Some(Self::InternalError),
            STATUS_BUSY => Some(Self::Busy),
            STATUS_TEMPORARY_FAILURE => Some(Self::TemporaryFailure),
            STATUS_UNKNOWN_COLLECTION => Some(Self::UnknownCollection),
            STATUS_DURABILITY_INVALID_LEVEL => Some(Self::DurabilityInvalidLevel),
            STATUS_DURABILITY_IMPOSSIBLE => Some(Self::DurabilityImpossible),
            STATUS_SYNC_WRITE_IN_PROGRESS => Some(Self::SyncWriteInProgress),
            STATUS_SYNC_WRITE_AMBIGUOUS => Some(Self::SyncWriteAmbiguous),
            STATUS_SUBDOC_PATH_NOT_FOUND => Some(Self::SubdocPathNotFound),
            STATUS_SUBDOC_PATH_MISMATCH => Some(Self::SubdocPathMismatch),
            STATUS_SUBDOC_PATH_INVALID => Some(Self::SubdocPathInvalid),
            STATUS_SUBDOC_PATH_TOO_BIG => Some(Self::SubdocPathTooBig),
            STATUS_SUBDOC_DOC_TOO_DEEP => Some(Self::SubdocDocTooDeep),
            STATUS_SUBDOC_CANNOT_INSERT => Some(Self::SubdocCannotInsert),
            STATUS_SUBDOC_DOC_NOT_JSON => Some(Self::SubdocDocNotJson),
            STATUS_SUBDOC_NUM_RANGE => Some(Self::SubdocNumRange),
            STATUS_SUBDOC_DELTA_RANGE => Some(Self::SubdocDeltaRange),
            STATUS_SUBDOC_PATH_EXISTS => Some(Self::SubdocPathExists),
            STATUS_SUBDOC_VALUE_TOO_DEEP => Some(Self::SubdocValueTooDeep),
            STATUS_SUBDOC_INVALID_COMBO => Some(Self::SubdocInvalidCombo),
            STATUS_SUBDOC_MULTI_PATH_FAILURE => Some(Self::SubdocMultiPathFailure),
            _ => None,
        }
    }

    /// Returns the numeric wire value.
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Returns `true` if the status indicates a retryable condition.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NotMyVBucket
                | Self::TemporaryFailure
                | Self::Busy
                | Self::OutOfMemory
                | Self::NotInitialized
                | Self::Locked
                | Self::SyncWriteInProgress
        )
    }

    /// Returns `true` for an authentication-family status.
    pub fn is_auth_failure(self) -> bool {
        matches!(
            self,
            Self::AuthError | Self::AuthStale | Self::AuthContinue | Self::Eaccess
        )
    }

    /// Returns `true` for a sub-document path status.
    pub fn is_subdoc_path(self) -> bool {
        (self.value() & 0xffc0) == 0x00c0 && self != Self::SubdocMultiPathFailure
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.value())
    }
}

/// The main error type for Shoal operations.
///
/// Covers client-side failures (connection, configuration, routing) and
/// server statuses translated through the table in the protocol design.
#[derive(Debug, Error, Clone)]
pub enum ShoalError {
    /// The document does not exist.
    #[error("document not found")]
    NotFound,

    /// The document already exists.
    #[error("document already exists")]
    Exists,

    /// A CAS-guarded mutation lost the race.
    #[error("CAS mismatch")]
    CasMismatch,

    /// The value exceeds the server's size limit.
    #[error("value too large")]
    ValueTooLarge,

    /// The server rejected the request arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A transient server-side failure; the caller may retry.
    #[error("temporary failure")]
    Temporary,

    /// The document is locked by another holder.
    #[error("document locked")]
    Locked,

    /// The linked token fired because the operation timed out.
    ///
    /// `ambiguous` is `true` when the operation was a mutation whose
    /// outcome on the server is unknown.
    #[error("operation timed out (ambiguous: {ambiguous})")]
    Timeout {
        /// Whether the server may have applied the operation.
        ambiguous: bool,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Authentication failed; fatal for the connection.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// A durability requirement could not be met.
    #[error("durability error: {0}")]
    Durability(DurabilityError),

    /// A sub-document path failed within an otherwise successful op.
    #[error("sub-document path error: {0}")]
    SubdocPath(PathError),

    /// The vBucket moved; a fresher config was published.
    #[error("not my vBucket")]
    NotMyVBucket,

    /// The cached collection id is stale.
    #[error("collection outdated")]
    CollectionOutdated,

    /// The node's circuit breaker is open.
    #[error("circuit breaker open")]
    CircuitBreakerOpen,

    /// No node in the cluster hosts the requested service.
    #[error("no node hosts service {0}")]
    ServiceMissing(String),

    /// Bootstrap exhausted every endpoint without finding the bucket.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// Connection-level failure (dial, reset, dead socket).
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed frames or protocol violations.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid client configuration or connection string.
    #[error("configuration error: {0}")]
    Config(String),

    /// A server status with no dedicated variant.
    #[error("server status {status}: {message}")]
    Server {
        /// The wire status.
        status: Status,
        /// Human-readable context, usually the error-map name.
        message: String,
    },

    /// I/O errors from the standard library (wrapped in `Arc` for `Clone`).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ShoalError {
    fn from(err: io::Error) -> Self {
        ShoalError::Io(Arc::new(err))
    }
}

impl ShoalError {
    /// Translates a non-success wire status into an error.
    ///
    /// `is_mutation` selects the ambiguous timeout flavor downstream and
    /// `has_cas` turns KeyExists into a CAS mismatch.
    pub fn from_status(status: u16, is_mutation: bool, has_cas: bool) -> Self {
        let status = match Status::from_wire(status) {
            Some(status) => status,
            None => {
                return Self::Server {
                    status: Status::InternalError,
                    message: format!("unknown status 0x{status:04x}"),
                }
            }
        };

        match status {
            Status::KeyNotFound => Self::NotFound,
            Status::KeyExists if has_cas && is_mutation => Self::CasMismatch,
            Status::KeyExists | Status::NotStored => Self::Exists,
            Status::ValueTooLarge => Self::ValueTooLarge,
            Status::InvalidArguments | Status::Erange | Status::DeltaBadval => {
                Self::InvalidArgument(format!("status {status}"))
            }
            Status::TemporaryFailure | Status::Busy | Status::OutOfMemory
            | Status::NotInitialized => Self::Temporary,
            Status::Locked => Self::Locked,
            Status::NotMyVBucket => Self::NotMyVBucket,
            Status::UnknownCollection => Self::CollectionOutdated,
            Status::DurabilityInvalidLevel => Self::Durability(DurabilityError::InvalidLevel),
            Status::DurabilityImpossible => Self::Durability(DurabilityError::Impossible),
            Status::SyncWriteInProgress => Self::Durability(DurabilityError::WriteInProgress),
            Status::SyncWriteAmbiguous => Self::Durability(DurabilityError::WriteAmbiguous),
            s if s.is_auth_failure() => {
                Self::AuthenticationFailure(format!("status {s}"))
            }
            s if s.is_subdoc_path() => Self::SubdocPath(PathError::from_status(s)),
            s => Self::Server {
                status: s,
                message: String::new(),
            },
        }
    }

    /// Returns `true` if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotMyVBucket | Self::Temporary | Self::Locked => true,
            Self::Connection(_) | Self::Io(_) => true,
            Self::CollectionOutdated => true,
            Self::Server { status, .. } => status.is_retryable(),
            _ => false,
        }
    }

    /// Returns the wire status behind this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::NotFound => Some(Status::KeyNotFound),
            Self::Exists | Self::CasMismatch => Some(Status::KeyExists),
            Self::ValueTooLarge => Some(Status::ValueTooLarge),
            Self::Temporary => Some(Status::TemporaryFailure),
            Self::Locked => Some(Status::Locked),
            Self::NotMyVBucket => Some(Status::NotMyVBucket),
            Self::CollectionOutdated => Some(Status::UnknownCollection),
            Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Durability failure kinds, surfaced verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityError {
    /// The requested level is invalid for this bucket.
    InvalidLevel,
    /// The cluster cannot currently satisfy the level.
    Impossible,
    /// Another durable write on the key is in flight.
    WriteInProgress,
    /// The durable write finished with an unknown outcome.
    WriteAmbiguous,
}

impl fmt::Display for DurabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLevel => write!(f, "invalid durability level"),
            Self::Impossible => write!(f, "durability impossible"),
            Self::WriteInProgress => write!(f, "sync write in progress"),
            Self::WriteAmbiguous => write!(f, "sync write ambiguous"),
        }
    }
}

/// Sub-document path failure kinds, attached to the failing spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// The path was not found.
    NotFound,
    /// The path type conflicts with the document.
    Mismatch,
    /// The path syntax is invalid.
    Invalid,
    /// The path is too long or too deep.
    TooBig,
    /// The document is too deep to parse.
    DocTooDeep,
    /// The value cannot be inserted at the path.
    CannotInsert,
    /// The document is not JSON.
    DocNotJson,
    /// The numeric value is out of range.
    NumRange,
    /// The counter delta is out of range.
    DeltaRange,
    /// The path already exists.
    Exists,
    /// The resulting value would be too deep.
    ValueTooDeep,
    /// Invalid combination of specs.
    InvalidCombo,
}

impl PathError {
    /// Maps a sub-document path status to its kind.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::SubdocPathMismatch => Self::Mismatch,
            Status::SubdocPathInvalid => Self::Invalid,
            Status::SubdocPathTooBig => Self::TooBig,
            Status::SubdocDocTooDeep => Self::DocTooDeep,
            Status::SubdocCannotInsert => Self::CannotInsert,
            Status::SubdocDocNotJson => Self::DocNotJson,
            Status::SubdocNumRange => Self::NumRange,
            Status::SubdocDeltaRange => Self::DeltaRange,
            Status::SubdocPathExists => Self::Exists,
            Status::SubdocValueTooDeep => Self::ValueTooDeep,
            Status::SubdocInvalidCombo => Self::InvalidCombo,
            _ => Self::NotFound,
        }
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "path not found"),
            Self::Mismatch => write!(f, "path mismatch"),
            Self::Invalid => write!(f, "path invalid"),
            Self::TooBig => write!(f, "path too big"),
            Self::DocTooDeep => write!(f, "document too deep"),
            Self::CannotInsert => write!(f, "cannot insert"),
            Self::DocNotJson => write!(f, "document not JSON"),
            Self::NumRange => write!(f, "number out of range"),
            Self::DeltaRange => write!(f, "delta out of range"),
            Self::Exists => write!(f, "path exists"),
            Self::ValueTooDeep => write!(f, "value too deep"),
            Self::InvalidCombo => write!(f, "invalid spec combination"),
        }
    }
}

/// A specialized `Result` type for Shoal operations.
pub type Result<T> = std::result::Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_wire() {
        assert_eq!(Status::from_wire(0x0000), Some(Status::Success));
        assert_eq!(Status::from_wire(0x0007), Some(Status::NotMyVBucket));
        assert_eq!(Status::from_wire(0x00a3), Some(Status::SyncWriteAmbiguous));
        assert_eq!(Status::from_wire(0xbeef), None);
    }

    #[test]
    fn test_status_retryability() {
        assert!(Status::NotMyVBucket.is_retryable());
        assert!(Status::TemporaryFailure.is_retryable());
        assert!(Status::Busy.is_retryable());
        assert!(!Status::KeyNotFound.is_retryable());
        assert!(!Status::AuthError.is_retryable());
    }

    #[test]
    fn test_subdoc_path_detection() {
        assert!(Status::SubdocPathNotFound.is_subdoc_path());
        assert!(Status::SubdocInvalidCombo.is_subdoc_path());
        assert!(!Status::SubdocMultiPathFailure.is_subdoc_path());
        assert!(!Status::KeyExists.is_subdoc_path());
    }

    #[test]
    fn test_key_not_found_maps_to_not_found() {
        let err = ShoalError::from_status(STATUS_KEY_NOT_FOUND, false, false);
        assert!(matches!(err, ShoalError::NotFound));
    }

    #[test]
    fn test_key_exists_with_cas_maps_to_cas_mismatch() {
        let err = ShoalError::from_status(STATUS_KEY_EXISTS, true, true);
        assert!(matches!(err, ShoalError::CasMismatch));

        let err = ShoalError::from_status(STATUS_KEY_EXISTS, true, false);
        assert!(matches!(err, ShoalError::Exists));
    }

    #[test]
    fn test_temporary_family() {
        for status in [STATUS_TEMPORARY_FAILURE, STATUS_BUSY, STATUS_OUT_OF_MEMORY] {
            let err = ShoalError::from_status(status, false, false);
            assert!(matches!(err, ShoalError::Temporary), "status {status:#x}");
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_auth_family_is_fatal() {
        for status in [STATUS_AUTH_ERROR, STATUS_AUTH_STALE, STATUS_EACCESS] {
            let err = ShoalError::from_status(status, false, false);
            assert!(matches!(err, ShoalError::AuthenticationFailure(_)));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_durability_statuses() {
        let err = ShoalError::from_status(STATUS_SYNC_WRITE_AMBIGUOUS, true, false);
        assert!(matches!(
            err,
            ShoalError::Durability(DurabilityError::WriteAmbiguous)
        ));
    }

    #[test]
    fn test_subdoc_path_statuses() {
        let err = ShoalError::from_status(STATUS_SUBDOC_PATH_EXISTS, true, false);
        assert!(matches!(err, ShoalError::SubdocPath(PathError::Exists)));
    }

    #[test]
    fn test_not_my_vbucket_retryable() {
        let err = ShoalError::from_status(STATUS_NOT_MY_VBUCKET, false, false);
        assert!(matches!(err, ShoalError::NotMyVBucket));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_collection_maps_to_collection_outdated() {
        let err = ShoalError::from_status(STATUS_UNKNOWN_COLLECTION, false, false);
        assert!(matches!(err, ShoalError::CollectionOutdated));
    }

    #[test]
    fn test_unknown_status_survives() {
        let err = ShoalError::from_status(0x7777, false, false);
        assert!(matches!(err, ShoalError::Server { .. }));
    }

    #[test]
    fn test_timeout_display_carries_ambiguity() {
        let err = ShoalError::Timeout { ambiguous: true };
        assert!(err.to_string().contains("ambiguous: true"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err: ShoalError = io_err.into();
        assert!(matches!(err, ShoalError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_is_clone_and_send_sync() {
        fn assert_clone_send_sync<T: Clone + Send + Sync>() {}
        assert_clone_send_sync::<ShoalError>();
    }
}
