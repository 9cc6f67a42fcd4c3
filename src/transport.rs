use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::mpsc,
    task::JoinHandle,
};

use crate::error::TransportError;

/// Extended data type 1 carries stderr (RFC 4254, section 5.2).
pub const STDERR_EXT: u32 = 1;

pub type TransportHandle = Arc<dyn Transport>;

/// An authenticated remote-login connection that can host many independent channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool {
        false
    }
}

/// A freshly opened channel, before its event stream is handed out.
///
/// Every request waits for the remote reply, so a refused request surfaces as
/// [`TransportError::RequestRejected`] right at the call site.
#[async_trait]
pub trait Channel: Send {
    async fn request_pty(&mut self, options: &PtyOptions) -> Result<(), TransportError>;

    async fn request_shell(&mut self) -> Result<(), TransportError>;

    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Hands the started channel over as an event stream and a shareable writer.
    fn split(self: Box<Self>) -> (ChannelReader, Arc<dyn ChannelWriter>);
}

#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn eof(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    ExtendedData { ext: u32, data: Bytes },
    Eof,
    ExitStatus(u32),
    ExitSignal {
        signal: String,
        core_dumped: bool,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Status(u32),
    Signal(String),
}

/// Everything a channel produced once it ran to completion.
#[derive(Debug, Default, Clone)]
pub struct DrainedOutput {
    /// stdout and stderr in arrival order.
    pub combined: Vec<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: Option<ExitReason>,
}

/// The three remote byte streams of a started shell, split apart.
pub struct ChannelStreams {
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    /// Resolves once the channel has no more events.
    pub exit: JoinHandle<Option<ExitReason>>,
}

pub struct ChannelReader {
    events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelReader {
    pub fn new(events: mpsc::Receiver<ChannelEvent>) -> ChannelReader {
        ChannelReader { events }
    }

    /// `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub async fn drain(mut self) -> DrainedOutput {
        let mut output = DrainedOutput::default();

        while let Some(event) = self.next_event().await {
            match event {
                ChannelEvent::Data(data) => {
                    output.combined.extend_from_slice(&data);
                    output.stdout.extend_from_slice(&data);
                }
                ChannelEvent::ExtendedData { ext: STDERR_EXT, data } => {
                    output.combined.extend_from_slice(&data);
                    output.stderr.extend_from_slice(&data);
                }
                ChannelEvent::ExitStatus(status) => output.exit = Some(ExitReason::Status(status)),
                ChannelEvent::ExitSignal { signal, .. } => output.exit = Some(ExitReason::Signal(signal)),
                ChannelEvent::ExtendedData { .. } | ChannelEvent::Eof => {}
            }
        }

        output
    }

    /// Demultiplexes the event stream into independent stdout and stderr readers.
    ///
    /// The pipes hold at most `capacity` bytes each; a reader that stops reading
    /// stalls the pump. A dropped reader only stops delivery to that pipe.
    pub fn into_streams(mut self, capacity: usize) -> ChannelStreams {
        let (stdout_tx, stdout) = tokio::io::duplex(capacity);
        let (stderr_tx, stderr) = tokio::io::duplex(capacity);

        let exit = tokio::spawn(async move {
            let mut stdout_tx = Some(stdout_tx);
            let mut stderr_tx = Some(stderr_tx);
            let mut exit = None;

            while let Some(event) = self.next_event().await {
                match event {
                    ChannelEvent::Data(data) => pipe_into(&mut stdout_tx, &data).await,
                    ChannelEvent::ExtendedData { ext: STDERR_EXT, data } => pipe_into(&mut stderr_tx, &data).await,
                    ChannelEvent::ExtendedData { .. } => {}
                    ChannelEvent::Eof => {
                        stdout_tx = None;
                        stderr_tx = None;
                    }
                    ChannelEvent::ExitStatus(status) => exit = Some(ExitReason::Status(status)),
                    ChannelEvent::ExitSignal { signal, .. } => exit = Some(ExitReason::Signal(signal)),
                }
            }

            exit
        });

        ChannelStreams { stdout, stderr, exit }
    }
}

async fn pipe_into(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = pipe {
        if writer.write_all(data).await.is_err() {
            *pipe = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyOptions {
    pub terminal: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub echo: bool,
    pub input_speed: u32,
    pub output_speed: u32,
}

impl Default for PtyOptions {
    fn default() -> Self {
        PtyOptions {
            terminal: "xterm".into(),
            col_width: 120,
            row_height: 32,
            pix_width: 0,
            pix_height: 0,
            echo: true,
            input_speed: 14400,
            output_speed: 14400,
        }
    }
}
