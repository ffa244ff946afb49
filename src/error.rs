//! Errors surfaced by the runtime, and the CA status codes a transport reports.

use std::time::Duration;

use thiserror::Error;

use crate::dbr::DecodeError;

/// Errors returned from the lower level (non-convenience) API
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CaError {
    #[error("Channel {name} did not connect within {timeout:?}")]
    NotConnected { name: String, timeout: Duration },
    #[error("{operation} on {name} did not complete within {timeout:?}")]
    Timeout {
        operation: &'static str,
        name: String,
        timeout: Duration,
    },
    #[error("{operation} on {name} failed: {message}")]
    Protocol {
        operation: &'static str,
        name: String,
        status: ErrorCondition,
        message: String,
    },
    #[error("Could not decode channel data: {0}")]
    Decode(#[from] DecodeError),
    #[error("The channel {0} does not exist or has been cleared")]
    ChannelClosed(String),
    #[error("No get is pending for {0}")]
    NothingPending(String),
    #[error("The context has been destroyed")]
    ContextDestroyed,
    #[error("No context is attached to this thread")]
    NoContext,
    #[error("A global registry has already been installed")]
    AlreadyInitialized,
    #[error("{}", ErrorCondition::NotThreaded)]
    NotThreaded,
    #[error("{operation}: {}", ErrorCondition::EvDisallow)]
    InsideCallback { operation: &'static str },
}

impl CaError {
    /// An operation ran out of time. Trying again later may succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CaError::Timeout { .. })
    }

    /// The caller used the API incorrectly
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            CaError::ChannelClosed(_)
                | CaError::NothingPending(_)
                | CaError::ContextDestroyed
                | CaError::NoContext
                | CaError::AlreadyInitialized
                | CaError::NotThreaded
                | CaError::InsideCallback { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CaError::NotConnected { .. } | CaError::Timeout { .. } => true,
            CaError::Protocol { status, .. } => status.severity() == ErrorSeverity::Warning,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// Status codes (`ECA_*`) a transport reports for an operation
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    #[error("Normal successful completion")]
    Normal = 0,
    #[error("Unable to allocate additional dynamic memory")]
    AllocMem = 6,
    #[error(
        "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES"
    )]
    TooLarge = 9,
    #[error("User specified timeout on IO operation expired")]
    Timeout = 10,
    #[error("The data type specified is invalid")]
    BadType = 14,
    #[error("Channel Access Internal Failure")]
    Internal = 17,
    #[error("Channel read request failed")]
    GetFail = 19,
    #[error("Channel write request failed")]
    PutFail = 20,
    #[error("Invalid element count requested")]
    BadCount = 22,
    #[error("Invalid string")]
    BadStr = 23,
    #[error("Virtual circuit disconnect")]
    Disconn = 24,
    #[error("Request inappropriate within subscription (monitor) update callback")]
    EvDisallow = 26,
    #[error("Bad event subscription (monitor) identifier")]
    BadMonId = 30,
    #[error("Invalid event selection mask")]
    BadMask = 41,
    #[error("IO operations have completed")]
    IoDone = 42,
    #[error("IO operations are in progress")]
    IoInProgress = 43,
    #[error("Invalid synchronous group identifier")]
    BadSyncGrp = 44,
    #[error("Put callback timed out")]
    PutCbInProg = 45,
    #[error("Read access denied")]
    NoRdAccess = 46,
    #[error("Write access denied")]
    NoWtAccess = 47,
    #[error("No reasonable data conversion between client and server types")]
    NoConvert = 50,
    #[error("Invalid channel identifier")]
    BadChId = 51,
    #[error("Thread is already attached to a client context")]
    IsAttached = 53,
    #[error("Not supported by attached service")]
    UnavailInServ = 54,
    #[error("User destroyed channel")]
    ChanDestroy = 55,
    #[error("Preemptive callback not enabled - additional threads may not join context")]
    NotThreaded = 57,
    #[error("Virtual circuit connection sequence aborted")]
    ConnSeqTmo = 59,
    #[error("Virtual circuit unresponsive")]
    UnrespTmo = 60,
}

impl ErrorCondition {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::IoDone | Self::IoInProgress => ErrorSeverity::Info,
            Self::Internal => ErrorSeverity::Severe,
            Self::BadType
            | Self::BadStr
            | Self::EvDisallow
            | Self::BadMonId
            | Self::BadMask
            | Self::BadSyncGrp
            | Self::PutCbInProg
            | Self::BadChId
            | Self::NotThreaded => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Whether this status reports success
    pub fn is_normal(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Success | ErrorSeverity::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let timeout = CaError::Timeout {
            operation: "get",
            name: "X".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_retryable());
        assert!(!timeout.is_programming_error());

        assert!(CaError::NothingPending("X".into()).is_programming_error());
        let denied = CaError::Protocol {
            operation: "put",
            name: "X".into(),
            status: ErrorCondition::NoWtAccess,
            message: ErrorCondition::NoWtAccess.to_string(),
        };
        assert!(denied.is_retryable());
        assert_eq!(denied.to_string(), "put on X failed: Write access denied");
        assert!(ErrorCondition::IoDone.is_normal());
        assert!(!ErrorCondition::PutFail.is_normal());
    }
}
