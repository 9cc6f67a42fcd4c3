use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tune_bridge::{
    bridge::{Bridge, ClientError, ClientFrame, FrameSink, FrameSource},
    command::CommandRunner,
    config::TuneConfig,
    drive::{Drive, UploadFile},
    registry::{Registry, SessionId},
    ssh_russh::{connect, ConnectOptions},
    transport::TransportHandle,
};

#[derive(Parser, Debug)]
#[command(name = "tune", version, about = "Browse and drive a remote machine over SSH")]
struct Cli {
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 22)]
    port: u16,

    #[arg(long, short)]
    user: String,

    #[arg(long, env = "TUNE_PASSWORD", hide_env_values = true)]
    password: String,

    /// TOML config file
    #[arg(long, env = "TUNE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the remote home directory
    Home,
    /// List one directory below home as JSON
    Ls { path: Option<String> },
    /// Print every folder below home as a JSON tree
    Tree,
    /// Print the MIME type of a file
    Mime { file: String },
    /// Download a file
    Get {
        file: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload local files into a remote directory
    Push {
        destination: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Attach the local terminal to a remote shell
    Shell,
}

fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("tune=warn,tune_bridge=warn"),
            1 => EnvFilter::new("tune=info,tune_bridge=info"),
            2 => EnvFilter::new("tune=debug,tune_bridge=debug,russh=debug"),
            _ => EnvFilter::new("tune=trace,tune_bridge=trace,russh=trace"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(create_env_filter(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => TuneConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => TuneConfig::default(),
    };

    let options = ConnectOptions::new(&cli.host, &cli.user, &cli.password)
        .port(cli.port)
        .connect_timeout(config.connect_timeout());
    let transport = connect(options).await?;

    let registry = Registry::new();
    let session = SessionId::generate();
    let handle: TransportHandle = Arc::new(transport);
    registry.register(session.clone(), handle).await;
    info!(%session, "session registered");

    let result = run(&cli.command, &config, &registry, &session).await;
    registry.revoke(session.as_str()).await;
    result
}

async fn run(command: &Command, config: &TuneConfig, registry: &Registry, session: &SessionId) -> anyhow::Result<()> {
    let transport = registry.resolve(Some(session.as_str()))?;
    let drive = Drive::new(Arc::clone(&transport), CommandRunner::new(config.command_timeout()))
        .with_tree_max_depth(config.tree_max_depth);

    match command {
        Command::Shell => {
            let bridge = Bridge::new(transport, registry.clone(), session.clone())
                .with_pty(config.pty.clone())
                .with_options(config.bridge.clone());
            let outcome = bridge
                .run(StdoutSink::new(tokio::io::stdout()), StdinSource::new(tokio::io::stdin()))
                .await?;
            info!(?outcome, "shell finished");
        }
        Command::Home => println!("{}", drive.home().await?),
        Command::Ls { path } => {
            let listing = drive.list(path.as_deref().unwrap_or("")).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Tree => {
            let tree = drive.folder_tree().await?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Command::Mime { file } => println!("{}", drive.mime_type(file).await?),
        Command::Get { file, output } => {
            let copied = match output {
                Some(path) => {
                    let mut out = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    let copied = drive.download(file, &mut out).await?;
                    out.flush().await?;
                    copied
                }
                None => drive.download(file, &mut tokio::io::stdout()).await?,
            };
            info!(file = %file, bytes = copied, "download finished");
        }
        Command::Push { destination, files } => {
            let mut uploads = Vec::with_capacity(files.len());
            for path in files {
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .with_context(|| format!("{} has no usable file name", path.display()))?;
                let content = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                uploads.push(UploadFile {
                    name: name.to_string(),
                    content: Bytes::from(content),
                });
            }

            let report = drive.upload(destination, uploads).await?;
            for result in &report.results {
                match &result.outcome {
                    Ok(remote) => println!("{} -> {}", result.name, remote),
                    Err(err) => eprintln!("{}: {}", result.name, err),
                }
            }
            if !report.all_succeeded() {
                bail!("{} file(s) failed to upload", report.failures().count());
            }
        }
    }

    Ok(())
}

/// Shell output goes to stdout, notices from the bridge to stderr.
struct StdoutSink {
    stdout: Stdout,
}

impl StdoutSink {
    fn new(stdout: Stdout) -> StdoutSink {
        StdoutSink { stdout }
    }
}

#[async_trait]
impl FrameSink for StdoutSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ClientError> {
        match frame {
            ClientFrame::Binary(data) => {
                self.stdout.write_all(&data).await.map_err(ClientError::other)?;
                self.stdout.flush().await.map_err(ClientError::other)
            }
            ClientFrame::Text(text) => {
                eprintln!("{}", text.trim_end());
                Ok(())
            }
            ClientFrame::Close => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.stdout.flush().await.map_err(ClientError::other)
    }
}

/// Feeds the shell one line of local input per frame.
struct StdinSource {
    lines: BufReader<Stdin>,
}

impl StdinSource {
    fn new(stdin: Stdin) -> StdinSource {
        StdinSource {
            lines: BufReader::new(stdin),
        }
    }
}

#[async_trait]
impl FrameSource for StdinSource {
    async fn recv(&mut self) -> Option<Result<ClientFrame, ClientError>> {
        let mut line = String::new();
        match self.lines.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(Ok(ClientFrame::Text(line))),
            Err(err) => Some(Err(ClientError::other(err))),
        }
    }
}
