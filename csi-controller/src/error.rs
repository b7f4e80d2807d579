use thiserror::Error;

use truenas_client::ClientError;

/// Canonical error classification at the CSI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyExists,
    NotFound,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    Unauthenticated,
    Aborted,
    Internal,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("replication aborted: {0}")]
    Aborted(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ControllerError {
    /// Map this error to its CSI status classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ControllerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ControllerError::NotFound(_) => ErrorKind::NotFound,
            ControllerError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            ControllerError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            ControllerError::Aborted(_) => ErrorKind::Aborted,
            ControllerError::Internal(_) => ErrorKind::Internal,
            ControllerError::Client(client) => classify_client(client),
        }
    }
}

fn classify_client(error: &ClientError) -> ErrorKind {
    match error {
        ClientError::AuthFailed => ErrorKind::Unauthenticated,
        ClientError::Closed
        | ClientError::ConnectionClosed
        | ClientError::WebSocket(_)
        | ClientError::Timeout(_) => ErrorKind::Unavailable,
        ClientError::Method { source, .. } => classify_client(source),
        _ if error.is_not_found() => ErrorKind::NotFound,
        _ if error.is_already_exists() => ErrorKind::AlreadyExists,
        ClientError::Rpc(_) => ErrorKind::FailedPrecondition,
        _ => ErrorKind::Internal,
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ControllerError::InvalidArgument("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            ControllerError::Client(ClientError::ConnectionClosed).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ControllerError::Client(ClientError::AuthFailed).kind(),
            ErrorKind::Unauthenticated
        );
    }

    #[test]
    fn test_method_wrapped_client_errors_classify_through() {
        let wrapped = ClientError::ConnectionClosed.for_method("pool.dataset.query");
        assert_eq!(ControllerError::Client(wrapped).kind(), ErrorKind::Unavailable);
    }
}
