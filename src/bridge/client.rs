use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::BoxError;

/// One message on the browser-facing duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client connection is closed")]
    Closed,
    #[error(transparent)]
    Other(BoxError),
}

impl ClientError {
    pub fn other<E>(err: E) -> ClientError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ClientError::Other(Box::new(err))
    }
}

/// Outbound half of the client connection. Only ever driven by one task at a time.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ClientError>;

    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Inbound half of the client connection. `None` means the client went away.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Option<Result<ClientFrame, ClientError>>;
}
