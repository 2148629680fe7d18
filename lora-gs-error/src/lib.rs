pub mod scheduling;

use config::ConfigError;
pub use scheduling::SchedulingError;
use serde_json::Error as SerdeJsonError;
use std::{fmt, io::Error as IoError};
use thiserror::Error;
use tokio::task::JoinError;

/// Result type used throughout the gateway server.
pub type GSResult<T, E = GSError> = anyhow::Result<T, E>;

/// Coarse error classification shared by every component of the gateway server.
///
/// The kind decides how an error is treated by callers: upstream handlers
/// returning a transient kind are accounted as drops, registry lookups
/// returning `NotFound` fall back to synthesised gateways, and the drift task
/// disconnects on `Unauthenticated` or `PermissionDenied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Aborted,
    AlreadyExists,
    ResourceExhausted,
    Unauthenticated,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Canceled,
    Internal,
    Unimplemented,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::Aborted => "aborted",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors of the gateway server.
///
/// Cloneable so a disconnect cause can be kept on the connection and handed to
/// every party asking for it. Use [`GSError::kind`] to branch on the class of an
/// error rather than on variants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GSError {
    #[error("gateway `{gateway_uid}` is not registered")]
    GatewayNotRegistered { gateway_uid: String },
    #[error("no fallback frequency plan for unregistered gateway `{gateway_uid}`")]
    NoFallbackFrequencyPlan { gateway_uid: String },
    #[error("gateway `{gateway_uid}` requires an authenticated connection")]
    UnauthenticatedGatewayConnection { gateway_uid: String },
    #[error("gateway `{gateway_uid}` is not connected")]
    NotConnected { gateway_uid: String },
    #[error("EUI `{eui}` is not registered")]
    EuiNotRegistered { eui: String },
    #[error("new connection from the same gateway")]
    NewConnection,
    #[error("gateway changed in the entity registry")]
    GatewayChanged,
    #[error("unknown upstream host `{0}`")]
    UnknownUpstreamHost(String),
    #[error("failed to set up upstream host `{name}`: {reason}")]
    UpstreamSetup { name: String, reason: String },
    #[error("{channel} buffer full")]
    BufferFull { channel: String },
    #[error("frequency plan `{0}` not found")]
    FrequencyPlanNotFound(String),
    #[error("airtime: {0}")]
    Airtime(String),
    #[error("payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("caller is not authenticated")]
    Unauthenticated,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Canceled,
    #[error("not implemented: {0}")]
    Unimplemented(String),
    #[error("recovered panic: {0}")]
    Panic(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("{0}")]
    IoError(String),
    #[error("{0}")]
    Msg(String),
}

impl GSError {
    /// Classification of the error; see [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            GSError::GatewayNotRegistered { .. }
            | GSError::NoFallbackFrequencyPlan { .. }
            | GSError::NotConnected { .. }
            | GSError::EuiNotRegistered { .. }
            | GSError::FrequencyPlanNotFound(_)
            | GSError::NotFound(_) => ErrorKind::NotFound,
            GSError::UnauthenticatedGatewayConnection { .. } | GSError::Unauthenticated => {
                ErrorKind::Unauthenticated
            }
            GSError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            GSError::NewConnection | GSError::GatewayChanged => ErrorKind::Aborted,
            GSError::UnknownUpstreamHost(_)
            | GSError::Airtime(_)
            | GSError::Payload(_)
            | GSError::InvalidArgument(_)
            | GSError::ConfigurationError(_)
            | GSError::SerializationError(_) => ErrorKind::InvalidArgument,
            GSError::UpstreamSetup { .. } | GSError::FailedPrecondition(_) => {
                ErrorKind::FailedPrecondition
            }
            GSError::BufferFull { .. } => ErrorKind::ResourceExhausted,
            GSError::Scheduling(e) => e.kind(),
            GSError::Unavailable(_) => ErrorKind::Unavailable,
            GSError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            GSError::Canceled => ErrorKind::Canceled,
            GSError::Unimplemented(_) => ErrorKind::Unimplemented,
            GSError::Panic(_) | GSError::Internal(_) => ErrorKind::Internal,
            GSError::IoError(_) => ErrorKind::Unavailable,
            GSError::Msg(_) => ErrorKind::Unknown,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    /// Errors signalling that the caller lost access to the gateway,
    /// e.g. because it was deleted or its key was revoked.
    #[inline]
    pub fn is_access_revoked(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Unauthenticated | ErrorKind::PermissionDenied
        )
    }
}

impl From<String> for GSError {
    #[inline]
    fn from(e: String) -> Self {
        GSError::Msg(e)
    }
}

impl From<&str> for GSError {
    #[inline]
    fn from(e: &str) -> Self {
        GSError::Msg(e.to_string())
    }
}

impl From<ConfigError> for GSError {
    #[inline]
    fn from(e: ConfigError) -> Self {
        GSError::ConfigurationError(e.to_string())
    }
}

impl From<IoError> for GSError {
    #[inline]
    fn from(e: IoError) -> Self {
        GSError::IoError(e.to_string())
    }
}

impl From<SerdeJsonError> for GSError {
    #[inline]
    fn from(e: SerdeJsonError) -> Self {
        GSError::SerializationError(e.to_string())
    }
}

impl From<JoinError> for GSError {
    #[inline]
    fn from(e: JoinError) -> Self {
        if e.is_cancelled() {
            GSError::Canceled
        } else {
            GSError::Panic(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_errors_map_to_taxonomy() {
        let uid = "gtw".to_string();
        assert_eq!(
            GSError::GatewayNotRegistered {
                gateway_uid: uid.clone()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GSError::UnauthenticatedGatewayConnection { gateway_uid: uid }.kind(),
            ErrorKind::Unauthenticated
        );
        assert_eq!(GSError::NewConnection.kind(), ErrorKind::Aborted);
        assert_eq!(GSError::GatewayChanged.kind(), ErrorKind::Aborted);
        assert_eq!(
            GSError::UnknownUpstreamHost("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(GSError::Panic("boom".into()).kind(), ErrorKind::Internal);
        assert_eq!(GSError::from("opaque").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn access_revocation_covers_both_auth_kinds() {
        assert!(GSError::Unauthenticated.is_access_revoked());
        assert!(GSError::PermissionDenied("gateway:link".into()).is_access_revoked());
        assert!(!GSError::NotFound("gtw".into()).is_access_revoked());
    }

    #[test]
    fn scheduling_errors_keep_their_kind() {
        let err: GSError = SchedulingError::DutyCycle {
            frequency: 868_100_000,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("duty cycle"));
    }
}
