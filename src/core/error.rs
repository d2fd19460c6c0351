//! Unified error handling for roomscale
//!
//! Every layer (store, protocol client, routing, command queue) reports
//! through [`GatewayError`]. The gateway boundary turns whatever reaches it
//! into a protocol level error response, so none of these ever reach a
//! tenant as a transport failure.

use std::fmt;

use crate::protocol::Resource;

/// Unified error types for the gateway
#[derive(Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    Configuration(String),

    /// Validation errors
    Validation(String),

    /// Encoding or decoding of wire and store data failed
    Serialization(String),

    /// The shared store rejected or failed an operation
    Store(String),

    /// A backend could not be reached or answered garbage
    Transport { backend: String, message: String },

    /// A meeting is already bound to a different owner
    BindingConflict {
        meeting_id: String,
        field: &'static str,
        bound: String,
        requested: String,
    },

    /// The meeting is not bound to any backend
    NoBackendForMeeting(String),

    /// The router produced an empty candidate set
    NoBackendAvailable,

    /// The request did not carry an identified frontend
    NoFrontend,

    /// Responses of this type are not collections
    CantBeMerged(&'static str),

    /// Responses disagree on envelope or payload flags
    MergeConflict(String),

    /// The request was cancelled before it reached a backend
    Cancelled,

    /// The request deadline passed while it was in flight
    DeadlineExceeded,

    /// A queued command names an action nobody handles
    UnknownCommand(String),

    /// No middleware in the pipeline handled the resource
    Unhandled(Resource),

    /// Authentication of an inbound request failed
    Unauthorized(String),

    /// Resource not found errors
    NotFound(String),

    /// Internal system errors
    Internal(String),

    /// Network and I/O errors
    Io(std::io::Error),
}

impl GatewayError {
    /// Unknown entities are normal outcomes, not faults.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GatewayError::NotFound(_)
                | GatewayError::NoBackendForMeeting(_)
                | GatewayError::NoBackendAvailable
        )
    }

    pub fn transport(backend: &str, err: impl fmt::Display) -> Self {
        GatewayError::Transport {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            GatewayError::Validation(msg) => write!(f, "Validation error: {msg}"),
            GatewayError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            GatewayError::Store(msg) => write!(f, "Store error: {msg}"),
            GatewayError::Transport { backend, message } => {
                write!(f, "Backend {backend} failed: {message}")
            }
            GatewayError::BindingConflict {
                meeting_id,
                field,
                bound,
                requested,
            } => write!(
                f,
                "Meeting {meeting_id} is bound to {field} {bound}, refusing to rebind to {requested}"
            ),
            GatewayError::NoBackendForMeeting(id) => write!(f, "No backend for meeting: {id}"),
            GatewayError::NoBackendAvailable => write!(f, "No backend available"),
            GatewayError::NoFrontend => write!(f, "No frontend in request context"),
            GatewayError::CantBeMerged(kind) => {
                write!(f, "Responses of type {kind} can not be merged")
            }
            GatewayError::MergeConflict(msg) => write!(f, "Responses have conflicting values: {msg}"),
            GatewayError::Cancelled => write!(f, "Request cancelled"),
            GatewayError::DeadlineExceeded => write!(f, "Request deadline exceeded"),
            GatewayError::UnknownCommand(action) => write!(f, "Unknown command: {action}"),
            GatewayError::Unhandled(resource) => {
                write!(f, "No handler for resource: {}", resource.as_str())
            }
            GatewayError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            GatewayError::NotFound(msg) => write!(f, "Resource not found: {msg}"),
            GatewayError::Internal(msg) => write!(f, "Internal error: {msg}"),
            GatewayError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Io(err) => Some(err),
            _ => None,
        }
    }
}

// Error conversions
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

impl From<quick_xml::DeError> for GatewayError {
    fn from(err: quick_xml::DeError) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<quick_xml::SeError> for GatewayError {
    fn from(err: quick_xml::SeError) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for GatewayError {
    fn from(err: base64::DecodeError) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

impl From<etcd_client::Error> for GatewayError {
    fn from(err: etcd_client::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        let backend = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("unknown")
            .to_string();
        GatewayError::Transport {
            backend,
            message: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        GatewayError::Unauthorized(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> GatewayResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> GatewayResult<T> {
        self.map_err(|e| GatewayError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::GatewayError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::GatewayError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::GatewayError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::GatewayError::Internal(format!($fmt, $($arg)*))
    };
}
