mod channel;
pub mod connection;

use async_trait::async_trait;
use russh::{client, Disconnect};
use tracing::debug;

use crate::{
    error::TransportError,
    transport::{Channel, Transport},
};

pub use channel::RusshChannel;
pub use connection::{connect, AcceptAnyHostKey, ConnectOptions};

/// A password-authenticated SSH connection. Each channel gets its own pump task.
///
/// Channels are opened straight on the shared handle, so several may be in
/// flight at once.
pub struct RusshTransport {
    handle: client::Handle<AcceptAnyHostKey>,
    label: String,
}

impl RusshTransport {
    pub(crate) fn new(handle: client::Handle<AcceptAnyHostKey>, label: String) -> RusshTransport {
        RusshTransport { handle, label }
    }

    /// `user@host:port` this transport is logged in as.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshTransport").field("label", &self.label).finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| TransportError::ChannelOpen(Box::new(err)))?;
        debug!(transport = %self.label, channel = ?channel.id(), "opened session channel");
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        debug!(transport = %self.label, "disconnecting");
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::other)
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
