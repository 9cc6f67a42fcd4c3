use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use russh::{client::Msg, ChannelMsg, Pty, Sig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{
    error::TransportError,
    transport::{Channel, ChannelEvent, ChannelReader, ChannelWriter, PtyOptions},
};

const EVENT_CAPACITY: usize = 32;
const COMMAND_CAPACITY: usize = 16;

/// A russh session channel that has not been split yet.
///
/// Messages that arrive while a request waits for its reply are kept and
/// replayed to the reader after [`Channel::split`].
pub struct RusshChannel {
    inner: russh::Channel<Msg>,
    pending: VecDeque<ChannelMsg>,
}

impl RusshChannel {
    pub(super) fn new(inner: russh::Channel<Msg>) -> RusshChannel {
        RusshChannel {
            inner,
            pending: VecDeque::new(),
        }
    }

    async fn await_reply(&mut self, request: &'static str) -> Result<(), TransportError> {
        loop {
            match self.inner.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(TransportError::RequestRejected(request)),
                Some(ChannelMsg::Close) | None => return Err(TransportError::ChannelClosed),
                Some(other) => self.pending.push_back(other),
            }
        }
    }
}

#[async_trait]
impl Channel for RusshChannel {
    async fn request_pty(&mut self, options: &PtyOptions) -> Result<(), TransportError> {
        let modes = [
            (Pty::ECHO, u32::from(options.echo)),
            (Pty::TTY_OP_ISPEED, options.input_speed),
            (Pty::TTY_OP_OSPEED, options.output_speed),
        ];
        self.inner
            .request_pty(
                true,
                &options.terminal,
                options.col_width,
                options.row_height,
                options.pix_width,
                options.pix_height,
                &modes,
            )
            .await
            .map_err(TransportError::other)?;
        self.await_reply("pty").await
    }

    async fn request_shell(&mut self) -> Result<(), TransportError> {
        self.inner.request_shell(true).await.map_err(TransportError::other)?;
        self.await_reply("shell").await
    }

    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.inner.exec(true, command).await.map_err(TransportError::other)?;
        self.await_reply("exec").await
    }

    fn split(self: Box<Self>) -> (ChannelReader, Arc<dyn ChannelWriter>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let RusshChannel { inner, pending } = *self;

        tokio::spawn(pump(inner, pending, event_tx, command_rx));

        (
            ChannelReader::new(event_rx),
            Arc::new(RusshChannelWriter { commands: command_tx }),
        )
    }
}

type Ack = oneshot::Sender<Result<(), TransportError>>;

enum WriterCommand {
    Data(Bytes, Ack),
    Eof(Ack),
    Close(Ack),
}

struct RusshChannelWriter {
    commands: mpsc::Sender<WriterCommand>,
}

impl RusshChannelWriter {
    async fn submit(&self, command: impl FnOnce(Ack) -> WriterCommand) -> Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(command(ack))
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        done.await.map_err(|_| TransportError::ChannelClosed)?
    }
}

#[async_trait]
impl ChannelWriter for RusshChannelWriter {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let data = Bytes::copy_from_slice(data);
        self.submit(|ack| WriterCommand::Data(data, ack)).await
    }

    async fn eof(&self) -> Result<(), TransportError> {
        self.submit(WriterCommand::Eof).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.submit(WriterCommand::Close).await
    }
}

/// Owns the russh channel: relays its messages as events and serves writer commands.
///
/// Events wait in a local backlog of at most [`EVENT_CAPACITY`] entries, so a
/// reader that stops draining never holds up writes or a close. Ends once the
/// channel is closed from either side, or once nobody holds a reader or a
/// writer for it any more.
async fn pump(
    mut channel: russh::Channel<Msg>,
    pending: VecDeque<ChannelMsg>,
    events: mpsc::Sender<ChannelEvent>,
    mut commands: mpsc::Receiver<WriterCommand>,
) {
    let id = channel.id();
    let mut backlog: VecDeque<ChannelEvent> = pending.into_iter().filter_map(translate).collect();
    let mut writers_alive = true;

    loop {
        tokio::select! {
            permit = events.reserve(), if !backlog.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(event) = backlog.pop_front() {
                        permit.send(event);
                    }
                }
                Err(_) => {
                    backlog.clear();
                    if !writers_alive {
                        let _ = channel.close().await;
                        break;
                    }
                }
            },
            msg = channel.wait(), if backlog.len() < EVENT_CAPACITY => match msg {
                Some(ChannelMsg::Close) | None => break,
                Some(msg) => {
                    if events.is_closed() {
                        if !writers_alive {
                            let _ = channel.close().await;
                            break;
                        }
                        continue;
                    }
                    backlog.extend(translate(msg));
                }
            },
            command = commands.recv(), if writers_alive => match command {
                Some(WriterCommand::Data(data, ack)) => {
                    let _ = ack.send(channel.data(&data[..]).await.map_err(TransportError::other));
                }
                Some(WriterCommand::Eof(ack)) => {
                    let _ = ack.send(channel.eof().await.map_err(TransportError::other));
                }
                Some(WriterCommand::Close(ack)) => {
                    let _ = ack.send(channel.close().await.map_err(TransportError::other));
                    break;
                }
                None => {
                    writers_alive = false;
                    if events.is_closed() {
                        let _ = channel.close().await;
                        break;
                    }
                }
            },
        }
    }

    // writers waiting on an ack get ChannelClosed instead of the flush below
    drop(commands);
    for event in backlog {
        if events.send(event).await.is_err() {
            break;
        }
    }
    debug!(channel = ?id, "channel pump finished");
}

fn translate(msg: ChannelMsg) -> Option<ChannelEvent> {
    let event = match msg {
        ChannelMsg::Data { data } => ChannelEvent::Data(Bytes::copy_from_slice(&data)),
        ChannelMsg::ExtendedData { data, ext } => ChannelEvent::ExtendedData {
            ext,
            data: Bytes::copy_from_slice(&data),
        },
        ChannelMsg::Eof => ChannelEvent::Eof,
        ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            ..
        } => ChannelEvent::ExitSignal {
            signal: signal_name_of(signal_name),
            core_dumped,
            message: error_message,
        },
        other => {
            trace!(msg = ?other, "ignoring channel message");
            return None;
        }
    };
    Some(event)
}

fn signal_name_of(sig: Sig) -> String {
    match sig {
        Sig::ABRT => "ABRT".into(),
        Sig::ALRM => "ALRM".into(),
        Sig::FPE => "FPE".into(),
        Sig::HUP => "HUP".into(),
        Sig::ILL => "ILL".into(),
        Sig::INT => "INT".into(),
        Sig::KILL => "KILL".into(),
        Sig::PIPE => "PIPE".into(),
        Sig::QUIT => "QUIT".into(),
        Sig::SEGV => "SEGV".into(),
        Sig::TERM => "TERM".into(),
        Sig::USR1 => "USR1".into(),
        Sig::Custom(value) => value,
    }
}
