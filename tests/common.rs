#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tokio::sync::mpsc;
use tune_bridge::{
    bridge::{ClientError, ClientFrame, FrameSink, FrameSource},
    error::TransportError,
    ssh_russh::{connect, ConnectOptions, RusshTransport},
    transport::{Channel, ChannelEvent, ChannelReader, ChannelWriter, PtyOptions, Transport, TransportHandle, STDERR_EXT},
};

pub const HOME: &str = "/home/alice";

const EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct Script {
    pattern: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: Option<u32>,
    hang: bool,
}

impl Script {
    fn exiting(stderr: &[u8], exit: u32) -> Script {
        Script {
            pattern: String::new(),
            stdout: Vec::new(),
            stderr: stderr.to_vec(),
            exit: Some(exit),
            hang: false,
        }
    }
}

/// What one channel opened on a [`MockTransport`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct ChannelLog {
    pub command: Option<String>,
    pub pty: Option<PtyOptions>,
    pub shell: bool,
    pub written: Vec<u8>,
    pub eof: bool,
    pub closes: usize,
}

type EventSlot = Arc<Mutex<Option<mpsc::Sender<ChannelEvent>>>>;
type ShellSlot = Arc<Mutex<Option<ShellRemote>>>;

/// In-memory transport: exec channels answer from scripts, shell channels are driven by the test.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<Vec<Script>>,
    channels: Mutex<Vec<Arc<Mutex<ChannelLog>>>>,
    shell: ShellSlot,
    reject_pty: AtomicBool,
    reject_shell: AtomicBool,
    refuse_channels: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<MockTransport> {
        Arc::new(MockTransport::default())
    }

    /// Any exec whose command line contains `pattern` prints `stdout` and exits with `exit`.
    ///
    /// Later scripts win over earlier ones.
    pub fn script(&self, pattern: &str, stdout: &str, exit: u32) {
        self.script_full(pattern, stdout.as_bytes(), b"", Some(exit), false);
    }

    pub fn script_full(&self, pattern: &str, stdout: &[u8], stderr: &[u8], exit: Option<u32>, hang: bool) {
        self.scripts.lock().unwrap().insert(
            0,
            Script {
                pattern: pattern.to_string(),
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
                exit,
                hang,
            },
        );
    }

    /// Scripts `printenv HOME` to answer with [`HOME`].
    pub fn with_home(self: Arc<Self>) -> Arc<Self> {
        self.script("printenv", &format!("{HOME}\n"), 0);
        self
    }

    pub fn reject_pty(&self) {
        self.reject_pty.store(true, Ordering::SeqCst);
    }

    pub fn reject_shell(&self) {
        self.reject_shell.store(true, Ordering::SeqCst);
    }

    pub fn refuse_channels(&self) {
        self.refuse_channels.store(true, Ordering::SeqCst);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<ChannelLog> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .map(|log| log.lock().unwrap().clone())
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.channels().into_iter().filter_map(|log| log.command).collect()
    }

    /// Waits until a shell was started on this transport.
    pub async fn shell_remote(&self) -> ShellRemote {
        loop {
            if let Some(remote) = self.shell.lock().unwrap().clone() {
                return remote;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn handle(self: &Arc<Self>) -> TransportHandle {
        Arc::clone(self) as TransportHandle
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if self.refuse_channels.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelOpen("refused".into()));
        }
        let log = Arc::new(Mutex::new(ChannelLog::default()));
        self.channels.lock().unwrap().push(Arc::clone(&log));
        Ok(Box::new(MockChannel {
            log,
            scripts: self.scripts.lock().unwrap().clone(),
            script: None,
            reject_pty: self.reject_pty.load(Ordering::SeqCst),
            reject_shell: self.reject_shell.load(Ordering::SeqCst),
            shell_slot: Arc::clone(&self.shell),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    log: Arc<Mutex<ChannelLog>>,
    scripts: Vec<Script>,
    script: Option<Script>,
    reject_pty: bool,
    reject_shell: bool,
    shell_slot: ShellSlot,
}

#[async_trait]
impl Channel for MockChannel {
    async fn request_pty(&mut self, options: &PtyOptions) -> Result<(), TransportError> {
        if self.reject_pty {
            return Err(TransportError::RequestRejected("pty"));
        }
        self.log.lock().unwrap().pty = Some(options.clone());
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<(), TransportError> {
        if self.reject_shell {
            return Err(TransportError::RequestRejected("shell"));
        }
        self.log.lock().unwrap().shell = true;
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.log.lock().unwrap().command = Some(command.to_string());
        let script = self.scripts.iter().find(|script| command.contains(&script.pattern)).cloned();
        self.script = Some(match script {
            Some(script) => script,
            None if command.starts_with("scp ") => Script::exiting(b"", 0),
            None => Script::exiting(b"command not found", 127),
        });
        Ok(())
    }

    fn split(self: Box<Self>) -> (ChannelReader, Arc<dyn ChannelWriter>) {
        let MockChannel {
            log, script, shell_slot, ..
        } = *self;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let events: EventSlot = Arc::new(Mutex::new(Some(tx)));

        let is_shell = log.lock().unwrap().shell;
        if is_shell {
            *shell_slot.lock().unwrap() = Some(ShellRemote {
                events: Arc::clone(&events),
                log: Arc::clone(&log),
            });
        } else if let Some(script) = script {
            let mut slot = events.lock().unwrap();
            if let Some(tx) = slot.as_ref() {
                if !script.stdout.is_empty() {
                    let _ = tx.try_send(ChannelEvent::Data(Bytes::from(script.stdout)));
                }
                if !script.stderr.is_empty() {
                    let _ = tx.try_send(ChannelEvent::ExtendedData {
                        ext: STDERR_EXT,
                        data: Bytes::from(script.stderr),
                    });
                }
                if let Some(status) = script.exit {
                    let _ = tx.try_send(ChannelEvent::ExitStatus(status));
                }
            }
            if !script.hang {
                if let Some(tx) = slot.take() {
                    let _ = tx.try_send(ChannelEvent::Eof);
                }
            }
        } else {
            // split without a request, e.g. a channel abandoned during setup
            events.lock().unwrap().take();
        }

        (ChannelReader::new(rx), Arc::new(MockWriter { log, events }))
    }
}

struct MockWriter {
    log: Arc<Mutex<ChannelLog>>,
    events: EventSlot,
}

#[async_trait]
impl ChannelWriter for MockWriter {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        if log.closes > 0 {
            return Err(TransportError::ChannelClosed);
        }
        log.written.extend_from_slice(data);
        Ok(())
    }

    async fn eof(&self) -> Result<(), TransportError> {
        self.log.lock().unwrap().eof = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.log.lock().unwrap().closes += 1;
        self.events.lock().unwrap().take();
        Ok(())
    }
}

/// The remote end of a started shell.
#[derive(Clone)]
pub struct ShellRemote {
    events: EventSlot,
    log: Arc<Mutex<ChannelLog>>,
}

impl ShellRemote {
    pub async fn stdout(&self, data: &[u8]) {
        self.emit(ChannelEvent::Data(Bytes::copy_from_slice(data))).await;
    }

    pub async fn stderr(&self, data: &[u8]) {
        self.emit(ChannelEvent::ExtendedData {
            ext: STDERR_EXT,
            data: Bytes::copy_from_slice(data),
        })
        .await;
    }

    /// The shell exits on its own and closes the channel.
    pub fn hang_up(&self) {
        self.events.lock().unwrap().take();
    }

    async fn emit(&self, event: ChannelEvent) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.log.lock().unwrap().written.clone()
    }

    pub fn closes(&self) -> usize {
        self.log.lock().unwrap().closes
    }

    pub fn pty(&self) -> Option<PtyOptions> {
        self.log.lock().unwrap().pty.clone()
    }
}

/// Test side of a client connection: feeds frames in, records frames sent out.
pub struct ClientHandle {
    input: mpsc::UnboundedSender<ClientFrame>,
    frames: Arc<Mutex<Vec<ClientFrame>>>,
    sink_closes: Arc<AtomicUsize>,
}

impl ClientHandle {
    pub fn type_text(&self, text: &str) {
        let _ = self.input.send(ClientFrame::Text(text.to_string()));
    }

    pub fn send(&self, frame: ClientFrame) {
        let _ = self.input.send(frame);
    }

    pub fn frames(&self) -> Vec<ClientFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn sink_closes(&self) -> usize {
        self.sink_closes.load(Ordering::SeqCst)
    }

    /// All binary payloads received so far, concatenated.
    pub fn output(&self) -> Vec<u8> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::Binary(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub async fn wait_for_output(&self, expected: &[u8]) {
        for _ in 0..1000 {
            if self.output().windows(expected.len()).any(|window| window == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("client never received {:?}", String::from_utf8_lossy(expected));
    }
}

pub struct RecordingSink {
    frames: Arc<Mutex<Vec<ClientFrame>>>,
    closes: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ClientError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.closes.load(Ordering::SeqCst) > 0 {
            return Err(ClientError::Closed);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedSource {
    input: mpsc::UnboundedReceiver<ClientFrame>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn recv(&mut self) -> Option<Result<ClientFrame, ClientError>> {
        self.input.recv().await.map(Ok)
    }
}

pub fn client() -> (ClientHandle, RecordingSink, ScriptedSource) {
    client_with_delay(None)
}

/// A client whose every outbound frame takes `delay` to deliver.
pub fn client_with_delay(delay: Option<Duration>) -> (ClientHandle, RecordingSink, ScriptedSource) {
    let (input, rx) = mpsc::unbounded_channel();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));
    (
        ClientHandle {
            input,
            frames: Arc::clone(&frames),
            sink_closes: Arc::clone(&closes),
        },
        RecordingSink { frames, closes, delay },
        ScriptedSource { input: rx },
    )
}

pub const SSH_USER: &str = "alice";
pub const SSH_PASSWORD: &str = "alice123";
const SSH_PORT: u16 = 2222;

/// A throwaway sshd in a container, with password login for [`SSH_USER`].
pub struct SshServer {
    pub port: u16,
    _container: ContainerAsync<GenericImage>,
}

impl SshServer {
    pub async fn start() -> SshServer {
        let container = GenericImage::new("lscr.io/linuxserver/openssh-server", "latest")
            .with_exposed_port(ContainerPort::Tcp(SSH_PORT))
            .with_wait_for(WaitFor::message_on_stdout("[ls.io-init] done."))
            .with_env_var("USER_NAME", SSH_USER)
            .with_env_var("USER_PASSWORD", SSH_PASSWORD)
            .with_env_var("PASSWORD_ACCESS", "true")
            .start()
            .await
            .expect("Could not start SSH container");
        let ports = container.ports().await.expect("Could not get SSH container ports");
        let port = ports
            .map_to_host_port_ipv4(ContainerPort::Tcp(SSH_PORT))
            .expect("Could not get SSH container port");
        tokio::time::sleep(Duration::from_millis(100)).await;

        SshServer {
            port,
            _container: container,
        }
    }

    pub fn options(&self, password: &str) -> ConnectOptions {
        ConnectOptions::new("localhost", SSH_USER, password).port(self.port)
    }

    pub async fn login(&self) -> Arc<RusshTransport> {
        Arc::new(connect(self.options(SSH_PASSWORD)).await.expect("Could not log in"))
    }
}
