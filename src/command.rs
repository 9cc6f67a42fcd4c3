use std::{borrow::Cow, fmt, time::Duration};

use shell_escape::unix::escape;
use tracing::{debug, error};

use crate::{
    error::{Error, ExecutionFailure, Result},
    transport::{ExitReason, Transport},
};

/// A remote command kept as an argument vector until it is rendered.
///
/// Every word is shell-quoted when rendered, so paths and file names coming from
/// the browser can never be interpreted by the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) discard_stderr: bool,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> CommandLine {
        CommandLine {
            program: program.into(),
            args: Vec::new(),
            discard_stderr: false,
        }
    }

    pub fn arg(&mut self, argument: impl Into<String>) -> &mut Self {
        self.args.push(argument.into());
        self
    }

    pub fn args<I, S>(&mut self, arguments: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(arguments.into_iter().map(Into::into));
        self
    }

    /// Sends the command's stderr to `/dev/null` on the remote side.
    pub fn discard_stderr(&mut self) -> &mut Self {
        self.discard_stderr = true;
        self
    }

    pub fn render(&self) -> String {
        // example of rendered command:
        // program 'arg with space' plain-arg 2>/dev/null
        let mut output = escape(Cow::from(self.program.as_str())).into_owned();
        for arg in &self.args {
            output.push(' ');
            output.push_str(&escape(Cow::from(arg.as_str())));
        }
        if self.discard_stderr {
            output.push_str(" 2>/dev/null");
        }
        output
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Runs one command per fresh channel and returns its combined, trimmed output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(timeout: Option<Duration>) -> CommandRunner {
        CommandRunner { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn run(&self, transport: &dyn Transport, command: &CommandLine) -> Result<String> {
        let rendered = command.render();
        debug!(command = %rendered, "running remote command");

        let outcome = match self.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, run_to_exit(transport, &rendered)).await {
                Ok(outcome) => outcome,
                Err(_) => Err((String::new(), ExecutionFailure::TimedOut(deadline))),
            },
            None => run_to_exit(transport, &rendered).await,
        };

        match outcome {
            Ok(output) => Ok(output.trim().to_string()),
            Err((output, reason)) => {
                error!(command = %rendered, output = %output, %reason, "remote command failed");
                Err(Error::execution(rendered, output, reason))
            }
        }
    }
}

async fn run_to_exit(transport: &dyn Transport, command: &str) -> Result<String, (String, ExecutionFailure)> {
    let mut channel = transport
        .open_channel()
        .await
        .map_err(|err| (String::new(), err.into()))?;
    channel.exec(command).await.map_err(|err| (String::new(), err.into()))?;

    let (reader, writer) = channel.split();
    let drained = reader.drain().await;
    // the remote side normally closes first, so a failing close is not an error
    let _ = writer.close().await;

    let output = String::from_utf8_lossy(&drained.combined).into_owned();
    match drained.exit {
        Some(ExitReason::Status(0)) => Ok(output),
        Some(ExitReason::Status(status)) => Err((output, ExecutionFailure::ExitStatus(status))),
        Some(ExitReason::Signal(signal)) => Err((output, ExecutionFailure::Signal(signal))),
        None => Err((output, ExecutionFailure::ExitMissing)),
    }
}
