use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use super::client::{ClientError, ClientFrame, FrameSink, FrameSource};

pub struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

pub struct WebSocketSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Splits an accepted websocket into the two halves a bridge runs on.
pub fn split<S>(stream: WebSocketStream<S>) -> (WebSocketSink<S>, WebSocketSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, source) = stream.split();
    (WebSocketSink { inner: sink }, WebSocketSource { inner: source })
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ClientError> {
        let message = match frame {
            ClientFrame::Text(text) => Message::Text(text),
            ClientFrame::Binary(data) => Message::Binary(data.to_vec()),
            ClientFrame::Close => Message::Close(None),
        };
        self.inner.send(message).await.map_err(ClientError::other)
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.inner.close().await.map_err(ClientError::other)
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Result<ClientFrame, ClientError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(ClientError::other(err))),
            };
            let frame = match message {
                Message::Text(text) => ClientFrame::Text(text),
                Message::Binary(data) => ClientFrame::Binary(Bytes::from(data)),
                Message::Close(_) => ClientFrame::Close,
                // pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}
