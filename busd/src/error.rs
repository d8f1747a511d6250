use thiserror::Error;

use crate::protocol::ErrorCode;
use crate::tracker::TrackerError;

/// Every failure a request can produce. Each variant maps onto exactly one
/// wire error code; the display string becomes the response `message`.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("unknown worker '{0}'; call register first")]
    UnknownWorker(String),
    #[error("{0}")]
    TaskMismatch(String),
    #[error("task {0} is already active")]
    DuplicateTask(String),
    #[error("broker is shutting down")]
    ShuttingDown,
    #[error("poll cancelled")]
    PollCancelled,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("{0}")]
    Internal(String),
}

impl BusError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BusError::InvalidParams(_) => ErrorCode::InvalidParams,
            BusError::UnknownWorker(_) => ErrorCode::UnknownWorker,
            BusError::TaskMismatch(_) => ErrorCode::TaskMismatch,
            BusError::DuplicateTask(_) => ErrorCode::DuplicateTask,
            BusError::ShuttingDown | BusError::PollCancelled | BusError::Internal(_) => {
                ErrorCode::Internal
            }
            BusError::Tracker(err) => match err {
                TrackerError::Rejected(_) | TrackerError::NotSubmittable { .. } => {
                    ErrorCode::InvalidParams
                }
                TrackerError::Timeout { .. } => ErrorCode::Timeout,
                TrackerError::Spawn { .. } | TrackerError::Malformed(_) => ErrorCode::Internal,
            },
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        BusError::InvalidParams(message.into())
    }

    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        BusError::TaskMismatch(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_errors_keep_their_message_and_map_codes() {
        let rejected = BusError::from(TrackerError::Rejected("no issue found: bd-7".into()));
        assert_eq!(rejected.code(), ErrorCode::InvalidParams);
        assert_eq!(rejected.to_string(), "no issue found: bd-7");

        let slow = BusError::from(TrackerError::Timeout {
            command: "bd show bd-7".into(),
            after_ms: 10,
        });
        assert_eq!(slow.code(), ErrorCode::Timeout);
    }

    #[test]
    fn shutdown_is_reported_as_internal() {
        assert_eq!(BusError::ShuttingDown.code(), ErrorCode::Internal);
    }
}
