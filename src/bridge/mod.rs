//! Interactive terminal bridge between a browser connection and a remote shell.
//!
//! One control loop per connection relays client input into the shell, while
//! two forwarding tasks relay the shell's stdout and stderr back. Every frame
//! toward the client goes through a single writer task, so frames from the two
//! forwarders can interleave but never tear.

pub mod client;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    registry::{Registry, SessionId},
    transport::{Channel, ChannelWriter, PtyOptions, TransportHandle},
};

pub use client::{ClientError, ClientFrame, FrameSink, FrameSource};

/// Sent to the client once the shell was left with `exit`; the page tears down on it.
pub const LOGOUT_FRAME: &str = "logout";

const PIPE_CAPACITY: usize = 64 * 1024;

/// Whether a text frame is the in-band request to end the whole session.
pub fn is_exit_sentinel(payload: &str) -> bool {
    payload == "exit\n" || payload == "exit\r\n"
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Largest chunk read from a remote stream and sent as one frame.
    pub read_chunk_size: usize,
    /// Frames that may wait for a slow client before the forwarders stall.
    pub outbound_capacity: usize,
    pub shutdown_grace_ms: u64,
}

impl BridgeOptions {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            read_chunk_size: 1024,
            outbound_capacity: 64,
            shutdown_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Created,
    PtyRequested,
    ShellStarted,
    Streaming,
    Closing,
    Closed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Created => "created",
            BridgeState::PtyRequested => "pty-requested",
            BridgeState::ShellStarted => "shell-started",
            BridgeState::Streaming => "streaming",
            BridgeState::Closing => "closing",
            BridgeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The client typed `exit`; the session's transport has been revoked.
    ExitRequested,
    ClientDisconnected,
    /// Writing to the shell failed, the remote side is gone.
    ShellClosed,
    Cancelled,
}

/// Stops a running bridge from outside, e.g. when the browser session expires.
#[derive(Debug, Clone)]
pub struct BridgeCanceller {
    notify: Arc<Notify>,
}

impl BridgeCanceller {
    pub fn cancel(&self) {
        self.notify.notify_one();
    }
}

enum Outbound {
    Frame(ClientFrame),
    Close,
}

pub struct Bridge {
    transport: TransportHandle,
    registry: Registry,
    session_id: SessionId,
    pty: PtyOptions,
    options: BridgeOptions,
    cancel: Arc<Notify>,
    state: BridgeState,
}

impl Bridge {
    pub fn new(transport: TransportHandle, registry: Registry, session_id: SessionId) -> Bridge {
        Bridge {
            transport,
            registry,
            session_id,
            pty: PtyOptions::default(),
            options: BridgeOptions::default(),
            cancel: Arc::new(Notify::new()),
            state: BridgeState::Created,
        }
    }

    pub fn with_pty(mut self, pty: PtyOptions) -> Bridge {
        self.pty = pty;
        self
    }

    pub fn with_options(mut self, options: BridgeOptions) -> Bridge {
        self.options = options;
        self
    }

    pub fn canceller(&self) -> BridgeCanceller {
        BridgeCanceller {
            notify: Arc::clone(&self.cancel),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    fn advance(&mut self, next: BridgeState) {
        debug!(session = %self.session_id, from = %self.state, to = %next, "bridge state change");
        self.state = next;
    }

    /// Runs the bridge until the client leaves, types `exit`, or it is cancelled.
    ///
    /// The shell channel is closed exactly once on every path; the transport
    /// itself is left open unless the client asked to exit.
    pub async fn run<K, S>(mut self, sink: K, mut source: S) -> Result<BridgeOutcome>
    where
        K: FrameSink,
        S: FrameSource,
    {
        let grace = self.options.shutdown_grace();
        let (outbound, outbound_rx) = mpsc::channel(self.options.outbound_capacity.max(1));
        let mut writer_task = tokio::spawn(drain_outbound(sink, outbound_rx));

        let channel = match self.start_shell().await {
            Ok(channel) => channel,
            Err((err, notice)) => {
                error!(session = %self.session_id, %err, "bridge setup failed");
                enqueue(&outbound, Outbound::Frame(ClientFrame::Text(notice.into())), grace).await;
                enqueue(&outbound, Outbound::Close, grace).await;
                drop(outbound);
                join_within(&mut writer_task, grace, "client writer").await;
                self.advance(BridgeState::Closed);
                return Err(err);
            }
        };

        let (reader, channel_writer) = channel.split();
        let shell = ShellGuard::new(channel_writer);
        let mut streams = reader.into_streams(PIPE_CAPACITY);
        let chunk = self.options.read_chunk_size.max(1);
        let mut stdout_task = tokio::spawn(forward_output("stdout", streams.stdout, outbound.clone(), chunk));
        let mut stderr_task = tokio::spawn(forward_output("stderr", streams.stderr, outbound.clone(), chunk));

        self.advance(BridgeState::Streaming);
        info!(session = %self.session_id, "terminal bridge established");

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.notified() => break BridgeOutcome::Cancelled,
                frame = source.recv() => match frame {
                    Some(Ok(ClientFrame::Text(text))) => {
                        let exit = is_exit_sentinel(&text);
                        if let Err(err) = shell.writer.write(text.as_bytes()).await {
                            warn!(session = %self.session_id, %err, "could not write to shell");
                            if !exit {
                                break BridgeOutcome::ShellClosed;
                            }
                        }
                        if exit {
                            info!(session = %self.session_id, "exit requested, ending session");
                            self.registry.revoke(self.session_id.as_str()).await;
                            break BridgeOutcome::ExitRequested;
                        }
                    }
                    Some(Ok(ClientFrame::Binary(data))) => {
                        debug!(session = %self.session_id, bytes = data.len(), "ignoring binary client frame");
                    }
                    Some(Ok(ClientFrame::Close)) | None => break BridgeOutcome::ClientDisconnected,
                    Some(Err(err)) => {
                        info!(session = %self.session_id, %err, "client connection failed");
                        break BridgeOutcome::ClientDisconnected;
                    }
                },
            }
        };

        self.advance(BridgeState::Closing);
        if outcome == BridgeOutcome::ExitRequested {
            // nothing may follow the logout frame
            stdout_task.abort();
            stderr_task.abort();
            join_within(&mut stdout_task, grace, "stdout forwarder").await;
            join_within(&mut stderr_task, grace, "stderr forwarder").await;
            enqueue(&outbound, Outbound::Frame(ClientFrame::Text(LOGOUT_FRAME.into())), grace).await;
        }
        shell.close().await;
        enqueue(&outbound, Outbound::Close, grace).await;
        drop(outbound);

        join_within(&mut writer_task, grace, "client writer").await;
        if outcome != BridgeOutcome::ExitRequested {
            join_within(&mut stdout_task, grace, "stdout forwarder").await;
            join_within(&mut stderr_task, grace, "stderr forwarder").await;
        }
        join_within(&mut streams.exit, grace, "channel pump").await;

        self.advance(BridgeState::Closed);
        info!(session = %self.session_id, ?outcome, "terminal bridge closed");
        Ok(outcome)
    }

    /// Opens the shell channel, returning the error and the notice for the client on failure.
    async fn start_shell(&mut self) -> Result<Box<dyn Channel>, (Error, &'static str)> {
        let mut channel = self
            .transport
            .open_channel()
            .await
            .map_err(|err| (Error::ShellStart(err), "Failed to create SSH session\n"))?;

        self.advance(BridgeState::PtyRequested);
        if let Err(err) = channel.request_pty(&self.pty).await {
            abandon(channel).await;
            return Err((Error::PtySetup(err), "PTY request failed\n"));
        }

        if let Err(err) = channel.request_shell().await {
            abandon(channel).await;
            return Err((Error::ShellStart(err), "Failed to start shell\n"));
        }
        self.advance(BridgeState::ShellStarted);

        Ok(channel)
    }
}

async fn abandon(channel: Box<dyn Channel>) {
    let (_, writer) = channel.split();
    if let Err(err) = writer.close().await {
        debug!(%err, "could not close abandoned channel");
    }
}

/// Closes the shell channel once, whichever path gets there first.
struct ShellGuard {
    writer: Arc<dyn ChannelWriter>,
    closed: AtomicBool,
}

impl ShellGuard {
    fn new(writer: Arc<dyn ChannelWriter>) -> ShellGuard {
        ShellGuard {
            writer,
            closed: AtomicBool::new(false),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.writer.close().await {
            debug!(%err, "could not close shell channel");
        }
    }
}

impl Drop for ShellGuard {
    fn drop(&mut self) {
        if *self.closed.get_mut() {
            return;
        }
        // the bridge future was dropped mid-stream
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let writer = Arc::clone(&self.writer);
            runtime.spawn(async move {
                let _ = writer.close().await;
            });
        }
    }
}

async fn drain_outbound<K: FrameSink>(mut sink: K, mut frames: mpsc::Receiver<Outbound>) {
    while let Some(message) = frames.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if let Err(err) = sink.send(frame).await {
                    debug!(%err, "client stopped accepting frames");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(err) = sink.close().await {
        debug!(%err, "could not close client connection");
    }
}

async fn forward_output<R>(name: &'static str, mut stream: R, outbound: mpsc::Sender<Outbound>, chunk: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                error!(stream = name, %err, "could not read remote output");
                break;
            }
        };
        let frame = ClientFrame::Binary(Bytes::copy_from_slice(&buf[..read]));
        if outbound.send(Outbound::Frame(frame)).await.is_err() {
            break;
        }
    }
    debug!(stream = name, "forwarding finished");
}

/// Queues a message for the client writer, giving up once `grace` has passed.
async fn enqueue(outbound: &mpsc::Sender<Outbound>, message: Outbound, grace: Duration) {
    match tokio::time::timeout(grace, outbound.send(message)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!("client writer already finished"),
        Err(_) => warn!("client writer stalled, dropping message"),
    }
}

async fn join_within<T>(task: &mut JoinHandle<T>, grace: Duration, name: &str) {
    if tokio::time::timeout(grace, &mut *task).await.is_err() {
        warn!(activity = name, "did not stop in time, aborting");
        task.abort();
        let _ = task.await;
    }
}
