use thiserror::Error;

use crate::rpc::codec::RpcError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication rejected by appliance")]
    AuthFailed,

    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("job {0} not found in appliance job registry")]
    JobNotFound(i64),

    #[error("{0}")]
    Rpc(RpcError),

    #[error("{method}: {source}")]
    Method {
        method: &'static str,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Wrap the error with the RPC method name that produced it.
    pub fn for_method(self, method: &'static str) -> Self {
        ClientError::Method {
            method,
            source: Box::new(self),
        }
    }

    /// The underlying appliance RPC error, if any, unwrapping method context.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rpc(e) => Some(e),
            ClientError::Method { source, .. } => source.rpc_error(),
            _ => None,
        }
    }

    /// True when the appliance reported the target object as absent.
    pub fn is_not_found(&self) -> bool {
        self.rpc_error().is_some_and(|e| e.is_errno("ENOENT"))
    }

    /// True when the appliance reported a create collision.
    pub fn is_already_exists(&self) -> bool {
        self.rpc_error().is_some_and(|e| e.is_errno("EEXIST"))
    }

    /// True for wire-level failures that are safe to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::ConnectionClosed | ClientError::WebSocket(_) | ClientError::Timeout(_) => {
                true
            }
            ClientError::Method { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
