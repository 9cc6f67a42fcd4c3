//! Single-file push over a channel running `scp -t`.
//!
//! The sink side of scp expects a `C<mode> <length> <name>\n` header, the raw
//! bytes, and one NUL byte marking the end of the file.

use tracing::{debug, info};

use crate::{
    command::CommandLine,
    error::{Error, Result, TransferFailure, TransportError},
    transport::{ExitReason, Transport},
};

pub const DEFAULT_MODE: u32 = 0o644;

pub async fn push(transport: &dyn Transport, destination: &str, content: &[u8]) -> Result<()> {
    push_with_mode(transport, destination, content, DEFAULT_MODE).await
}

pub async fn push_with_mode(transport: &dyn Transport, destination: &str, content: &[u8], mode: u32) -> Result<()> {
    let header = file_header(destination, content.len(), mode).map_err(|reason| Error::transfer(destination, reason))?;
    push_framed(transport, destination, &header, content)
        .await
        .map_err(|reason| Error::transfer(destination, reason))?;
    info!(path = destination, bytes = content.len(), "file pushed");
    Ok(())
}

async fn push_framed(
    transport: &dyn Transport,
    destination: &str,
    header: &str,
    content: &[u8],
) -> Result<(), TransferFailure> {
    let mut command = CommandLine::new("scp");
    command.arg("-t").arg(destination);

    let mut channel = transport.open_channel().await.map_err(TransferFailure::ChannelOpen)?;
    channel
        .exec(&command.render())
        .await
        .map_err(TransferFailure::CommandStart)?;
    let (reader, writer) = channel.split();

    debug!(header = header.trim_end(), "sending file header");
    let streamed: Result<(), TransportError> = async {
        writer.write(header.as_bytes()).await?;
        writer.write(content).await?;
        writer.write(b"\0").await?;
        writer.eof().await
    }
    .await;
    if let Err(err) = streamed {
        let _ = writer.close().await;
        return Err(TransferFailure::Write(err));
    }

    let drained = reader.drain().await;
    let _ = writer.close().await;

    match drained.exit {
        Some(ExitReason::Status(0)) => Ok(()),
        Some(ExitReason::Status(status)) => Err(TransferFailure::ExitStatus {
            status,
            message: receiver_message(&drained.combined),
        }),
        Some(ExitReason::Signal(signal)) => Err(TransferFailure::ExitStatus {
            status: 128,
            message: format!("killed by signal {signal}"),
        }),
        None => Err(TransferFailure::ExitMissing),
    }
}

/// Builds the `C` header line for one file.
pub fn file_header(destination: &str, length: usize, mode: u32) -> Result<String, TransferFailure> {
    let name = destination.rsplit('/').next().unwrap_or(destination);
    if name.is_empty() || name.contains('\n') {
        return Err(TransferFailure::InvalidFileName(name.to_string()));
    }
    Ok(format!("C{:04o} {} {}\n", mode & 0o7777, length, name))
}

/// Extracts the human readable part of scp status replies (`\x01`/`\x02` + text).
fn receiver_message(replies: &[u8]) -> String {
    String::from_utf8_lossy(replies)
        .split(&['\0', '\x01', '\x02'][..])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}
