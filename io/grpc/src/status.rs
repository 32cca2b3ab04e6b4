//! gRPC status codes and status resolution from trailers.

use crate::metadata::{self, Metadata};
use crate::percent;
use bytes::Bytes;
use std::fmt;

/// gRPC status codes (different from HTTP status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Invalid argument was provided.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Requested entity was not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Permission denied.
    PermissionDenied = 7,
    /// Resource has been exhausted.
    ResourceExhausted = 8,
    /// Operation was rejected because the system is not in a state required for execution.
    FailedPrecondition = 9,
    /// Operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// Service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Create a Code from its numeric value.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Get the numeric value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Check if this is a successful status.
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }

    /// Map an HTTP status to a gRPC code for responses that carry no
    /// `grpc-status`.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{}", name)
    }
}

/// gRPC status returned from an RPC.
///
/// A status is the terminal outcome of a call. Along with the code and
/// message it carries the trailers the server sent and the optional
/// binary details from `grpc-status-details-bin`.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// The status code.
    code: Code,
    /// Optional human-readable message.
    message: Option<String>,
    /// Encoded `google.rpc.Status`, if the server sent one.
    details: Option<Bytes>,
    /// Trailing metadata received with the status.
    trailers: Metadata,
}

impl Status {
    /// Create a new status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: None,
            trailers: Metadata::new(),
        }
    }

    /// Create an OK status.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// Create a status from just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: None,
            trailers: Metadata::new(),
        }
    }

    /// Attach trailing metadata.
    pub fn with_trailers(mut self, trailers: Metadata) -> Self {
        self.trailers = trailers;
        self
    }

    /// Attach binary status details.
    pub fn with_details(mut self, details: Bytes) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the status message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Get the binary status details, if any.
    pub fn details(&self) -> Option<&Bytes> {
        self.details.as_ref()
    }

    /// Get the trailers that accompanied this status.
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    /// Check if this is a successful status.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// Resolve the call status from trailers (or from the headers of a
    /// trailers-only response).
    ///
    /// Protocol violations produce an `Internal` status rather than an
    /// error: a missing or unparseable `grpc-status`, repeated
    /// `grpc-status`/`grpc-message` values, a message that fails to
    /// percent-decode, or malformed binary details.
    pub fn from_trailers(trailers: Metadata) -> Status {
        let code = match single_value(&trailers, metadata::GRPC_STATUS) {
            Err(status) => return status,
            Ok(None) => return Status::internal("No grpc-status found on response."),
            Ok(Some(value)) => match value.parse::<u32>() {
                Ok(raw) => Code::from_u32(raw),
                Err(_) => {
                    return Status::internal(format!(
                        "Unexpected grpc-status value: {value:?}"
                    ));
                }
            },
        };

        let message = match single_value(&trailers, metadata::GRPC_MESSAGE) {
            Err(status) => return status,
            Ok(None) => None,
            Ok(Some(value)) => match percent::decode(value) {
                Ok(decoded) => Some(decoded),
                Err(e) => return Status::internal(format!("Error decoding grpc-message: {e}")),
            },
        };

        let details = match trailers.get_bin(metadata::GRPC_STATUS_DETAILS) {
            None => None,
            Some(Ok(bytes)) => Some(bytes),
            Some(Err(e)) => {
                return Status::internal(format!("Error decoding grpc-status-details-bin: {e}"));
            }
        };

        Status {
            code,
            message,
            details,
            trailers,
        }
    }

    /// Encode this status as trailers for the wire. Custom trailers are
    /// included; reserved keys among them are dropped.
    pub fn to_trailers(&self) -> Metadata {
        let mut out = Metadata::new();
        for (key, value) in self.trailers.iter() {
            if !metadata::is_reserved(key)
                && key != metadata::GRPC_STATUS
                && key != metadata::GRPC_MESSAGE
                && key != metadata::GRPC_STATUS_DETAILS
            {
                out.insert(key, value);
            }
        }
        out.insert(metadata::GRPC_STATUS, self.code.as_u32().to_string());
        if let Some(message) = &self.message {
            out.insert(metadata::GRPC_MESSAGE, percent::encode(message));
        }
        if let Some(details) = &self.details {
            out.insert_bin(metadata::GRPC_STATUS_DETAILS, details);
        }
        out
    }
}

/// Fetch a header that must appear at most once.
fn single_value<'a>(md: &'a Metadata, key: &str) -> Result<Option<&'a str>, Status> {
    match md.get_all(key) {
        None => Ok(None),
        Some([value]) => Ok(Some(value.as_str())),
        Some([]) => Ok(None),
        Some(_) => Err(Status::internal(format!(
            "Multiple {key} headers found on response; expected a single value."
        ))),
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}
