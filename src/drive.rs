use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::OnceCell,
};
use tracing::{debug, info, warn};

use crate::{
    command::{CommandLine, CommandRunner},
    error::{Error, ExecutionFailure, Result, TransportError},
    paths::{strip_home, RemotePath},
    push,
    transport::{ChannelEvent, ExitReason, TransportHandle, STDERR_EXT},
    tree::{build_tree, FolderNode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// One directory level: immediate subfolders and files, each sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub folders: Vec<DriveEntry>,
    pub files: Vec<DriveEntry>,
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content: Bytes,
}

#[derive(Debug)]
pub struct UploadResult {
    pub name: String,
    pub outcome: Result<String>,
}

/// Per-file outcome of an upload batch. Files pushed before a failure stay pushed.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub results: Vec<UploadResult>,
}

impl UploadReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|result| result.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &UploadResult> {
        self.results.iter().filter(|result| result.outcome.is_err())
    }
}

/// File-drive operations for one session's transport.
///
/// Holds no state beyond the home directory, which is looked up once per instance.
pub struct Drive {
    transport: TransportHandle,
    runner: CommandRunner,
    tree_max_depth: Option<u32>,
    home: OnceCell<String>,
}

impl Drive {
    pub fn new(transport: TransportHandle, runner: CommandRunner) -> Drive {
        Drive {
            transport,
            runner,
            tree_max_depth: None,
            home: OnceCell::new(),
        }
    }

    pub fn with_tree_max_depth(mut self, depth: Option<u32>) -> Drive {
        self.tree_max_depth = depth;
        self
    }

    pub async fn home(&self) -> Result<&str> {
        let home = self
            .home
            .get_or_try_init(|| async {
                let mut command = CommandLine::new("printenv");
                command.arg("HOME");
                let home = self.runner.run(self.transport.as_ref(), &command).await?;
                debug!(%home, "resolved remote home directory");
                Ok::<_, Error>(home)
            })
            .await?;
        Ok(home.as_str())
    }

    pub async fn resolve(&self, path: &str) -> Result<RemotePath> {
        RemotePath::resolve(self.home().await?, path)
    }

    pub async fn list(&self, path: &str) -> Result<Listing> {
        let directory = self.resolve(path).await?;
        let folders = self.list_kind(&directory, EntryKind::Folder).await?;
        let files = self.list_kind(&directory, EntryKind::File).await?;
        Ok(Listing { folders, files })
    }

    async fn list_kind(&self, directory: &RemotePath, kind: EntryKind) -> Result<Vec<DriveEntry>> {
        let type_flag = match kind {
            EntryKind::Folder => "d",
            EntryKind::File => "f",
        };
        let mut command = CommandLine::new("find");
        command
            .arg(directory.absolute())
            .args(["-maxdepth", "1", "-mindepth", "1", "-type", type_flag, "-printf", r"%f\n"]);

        let output = self.runner.run(self.transport.as_ref(), &command).await?;
        let mut entries: Vec<DriveEntry> = output
            .lines()
            .filter(|line| !line.is_empty())
            .map(|name| DriveEntry {
                name: name.to_string(),
                path: directory.relative_child(name),
                kind,
            })
            .collect();
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Ok(entries)
    }

    /// Every folder below the home directory, as a tree.
    pub async fn folder_tree(&self) -> Result<Vec<FolderNode>> {
        let home = self.home().await?.to_string();
        let mut command = CommandLine::new("find");
        command.arg(home.as_str());
        if let Some(depth) = self.tree_max_depth {
            command.arg("-maxdepth").arg(depth.to_string());
        }
        command.args(["-type", "d", "-print"]).discard_stderr();

        let output = match self.runner.run(self.transport.as_ref(), &command).await {
            Ok(output) => output,
            // find exits 1 when some directories were unreadable but still prints the rest
            Err(Error::Execution {
                output,
                reason: ExecutionFailure::ExitStatus(1),
                ..
            }) => {
                warn!("folder walk was incomplete, using partial output");
                output.trim().to_string()
            }
            Err(err) => return Err(err),
        };

        let relative = output
            .lines()
            .filter_map(|line| strip_home(&home, line))
            .map(|line| line.trim_start_matches('/'));
        Ok(build_tree(relative))
    }

    pub async fn mime_type(&self, file: &str) -> Result<String> {
        let target = self.resolve(file).await?;
        let mut command = CommandLine::new("file");
        command.args(["-b", "--mime-type"]).arg(target.absolute());
        self.runner.run(self.transport.as_ref(), &command).await
    }

    /// Streams a remote file into `writer`, returning the number of bytes copied.
    pub async fn download<W>(&self, file: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let target = self.resolve(file).await?;
        if target.is_home() {
            return Err(Error::Protocol("cannot download the home directory".into()));
        }
        let mut command = CommandLine::new("cat");
        command.arg(target.absolute());
        let rendered = command.render();

        let mut channel = self
            .transport
            .open_channel()
            .await
            .map_err(|err| Error::execution(&rendered, "", err.into()))?;
        channel
            .exec(&rendered)
            .await
            .map_err(|err| Error::execution(&rendered, "", err.into()))?;
        let (mut reader, channel_writer) = channel.split();

        let mut copied = 0u64;
        let mut stderr = Vec::new();
        let mut exit = None;
        let mut sink_error = None;
        while let Some(event) = reader.next_event().await {
            match event {
                ChannelEvent::Data(data) if sink_error.is_none() => {
                    match writer.write_all(&data).await {
                        Ok(()) => copied += data.len() as u64,
                        Err(err) => {
                            sink_error = Some(err);
                            let _ = channel_writer.close().await;
                        }
                    }
                }
                ChannelEvent::ExtendedData { ext: STDERR_EXT, data } => stderr.extend_from_slice(&data),
                ChannelEvent::ExitStatus(status) => exit = Some(ExitReason::Status(status)),
                ChannelEvent::ExitSignal { signal, .. } => exit = Some(ExitReason::Signal(signal)),
                _ => {}
            }
        }
        let _ = channel_writer.close().await;

        if let Some(err) = sink_error {
            return Err(Error::execution(rendered, "", TransportError::IO(err).into()));
        }
        writer
            .flush()
            .await
            .map_err(|err| Error::execution(&rendered, "", TransportError::IO(err).into()))?;

        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        match exit {
            Some(ExitReason::Status(0)) => {
                info!(path = %target, bytes = copied, "file downloaded");
                Ok(copied)
            }
            Some(ExitReason::Status(status)) => Err(Error::execution(rendered, stderr, ExecutionFailure::ExitStatus(status))),
            Some(ExitReason::Signal(signal)) => Err(Error::execution(rendered, stderr, ExecutionFailure::Signal(signal))),
            None => Err(Error::execution(rendered, stderr, ExecutionFailure::ExitMissing)),
        }
    }

    /// Pushes `files` into `destination`, one channel per file, in order.
    ///
    /// A failing file does not stop the ones after it.
    pub async fn upload(&self, destination: &str, files: Vec<UploadFile>) -> Result<UploadReport> {
        if files.is_empty() {
            return Err(Error::Protocol("no files to upload".into()));
        }
        let directory = self.resolve(destination).await?;

        let mut report = UploadReport::default();
        for file in files {
            let outcome = match directory.join(&file.name) {
                Ok(target) if target.file_name() == Some(file.name.as_str()) => {
                    let absolute = target.absolute();
                    debug!(path = %absolute, "uploading file");
                    push::push(self.transport.as_ref(), &absolute, &file.content)
                        .await
                        .map(|()| absolute)
                }
                Ok(_) => Err(Error::Protocol(format!("upload name {:?} is not a plain file name", file.name))),
                Err(err) => Err(err),
            };
            if let Err(err) = &outcome {
                warn!(name = %file.name, %err, "upload failed");
            }
            report.results.push(UploadResult {
                name: file.name,
                outcome,
            });
        }

        Ok(report)
    }
}
