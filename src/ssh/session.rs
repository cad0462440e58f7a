//! Long-lived interactive session used to drive the installer wizard.
//!
//! Remote stdout is teed: every chunk is echoed locally and copied into an
//! in-memory pipe that the wizard scanner reads. Once the scanner is done,
//! [`WizardSession::drain_output`] keeps the pipe flowing so the remote
//! process never stalls on a full buffer.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RemoteCommand, SshError};

const SCAN_PIPE_CAPACITY: usize = 64 * 1024;
const COPY_BUFFER: usize = 8 * 1024;

/// Interactive SSH session with a scannable output stream.
#[derive(Debug)]
pub struct WizardSession {
    node: String,
    program: String,
    base_args: Vec<OsString>,
    echo: bool,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output: Option<DuplexStream>,
    tasks: Vec<JoinHandle<()>>,
}

impl WizardSession {
    /// Prepares a session that will run `program` with `base_args` followed
    /// by the remote command.
    #[must_use]
    pub const fn new(node: String, program: String, base_args: Vec<OsString>) -> Self {
        Self {
            node,
            program,
            base_args,
            echo: true,
            child: None,
            stdin: None,
            output: None,
            tasks: Vec::new(),
        }
    }

    /// Controls whether remote output is echoed to the local stdout and
    /// stderr.
    #[must_use]
    pub const fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Returns the name of the node the session targets.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Returns `true` once a remote command has been launched and the
    /// session has not been closed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.child.is_some()
    }

    /// Starts `command` on the remote node.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Session`] when a command is already running or the
    /// local client cannot be spawned.
    pub fn launch(&mut self, command: &RemoteCommand) -> Result<(), SshError> {
        if self.child.is_some() {
            return Err(self.session_error("a remote command is already running"));
        }

        let rendered = command.render();
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .arg(&rendered)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                self.session_error(&format!("failed to spawn {}: {err}", self.program))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.session_error("remote stdout is not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.session_error("remote stderr is not captured"))?;

        let (scan_reader, scan_writer) = tokio::io::duplex(SCAN_PIPE_CAPACITY);
        self.tasks
            .push(tokio::spawn(tee_output(stdout, scan_writer, self.echo)));
        self.tasks.push(tokio::spawn(echo_errors(stderr, self.echo)));
        self.stdin = child.stdin.take();
        self.output = Some(scan_reader);
        self.child = Some(child);

        info!(node = %self.node, command = %rendered, "launched remote command");
        Ok(())
    }

    /// Borrows the scannable output stream and the remote stdin.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotLaunched`] before [`WizardSession::launch`] or
    /// after the output has been handed to [`WizardSession::drain_output`].
    pub fn io(&mut self) -> Result<(&mut DuplexStream, &mut ChildStdin), SshError> {
        match (self.output.as_mut(), self.stdin.as_mut()) {
            (Some(output), Some(stdin)) => Ok((output, stdin)),
            _ => Err(SshError::NotLaunched {
                node: self.node.clone(),
            }),
        }
    }

    /// Discards further remote output in the background so the remote
    /// process keeps running unattended.
    pub fn drain_output(&mut self) {
        if let Some(mut output) = self.output.take() {
            self.tasks.push(tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut output, &mut tokio::io::sink()).await {
                    debug!(error = %err, "stopped draining remote output");
                }
            }));
        }
    }

    /// Waits for the remote command to exit on its own. Returns `None` when
    /// nothing was launched. Cancel-safe, so it can race an interrupt.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Session`] when the local client cannot be waited on.
    pub async fn wait(&mut self) -> Result<Option<ExitStatus>, SshError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.wait().await {
            Ok(status) => Ok(Some(status)),
            Err(err) => {
                Err(self.session_error(&format!("failed to wait for ssh client: {err}")))
            }
        }
    }

    /// Terminates the remote command and waits for the background copy
    /// tasks to finish. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Session`] when the local client cannot be reaped.
    pub async fn close(&mut self) -> Result<(), SshError> {
        self.stdin.take();
        self.output.take();

        let mut outcome = Ok(());
        if let Some(mut child) = self.child.take() {
            let exited = matches!(child.try_wait(), Ok(Some(_)));
            if !exited && let Err(err) = child.start_kill() {
                debug!(node = %self.node, error = %err, "remote command already stopped");
            }
            match child.wait().await {
                Ok(status) => debug!(node = %self.node, %status, "remote command finished"),
                Err(err) => {
                    outcome = Err(self.session_error(&format!("failed to reap ssh client: {err}")));
                }
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "session copy task failed");
            }
        }
        outcome
    }

    fn session_error(&self, message: &str) -> SshError {
        SshError::Session {
            node: self.node.clone(),
            message: message.to_owned(),
        }
    }
}

async fn tee_output<S, P>(mut source: S, mut pipe: P, echo: bool)
where
    S: AsyncRead + Unpin,
    P: AsyncWrite + Unpin,
{
    let mut local = tokio::io::stdout();
    let mut buffer = vec![0_u8; COPY_BUFFER];
    let mut pipe_open = true;

    loop {
        let read = match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) => {
                debug!(error = %err, "remote stdout closed");
                break;
            }
        };
        let Some(chunk) = buffer.get(..read) else {
            break;
        };
        if echo && local.write_all(chunk).await.is_err() {
            debug!("local stdout unavailable; continuing without echo");
        }
        if pipe_open && pipe.write_all(chunk).await.is_err() {
            pipe_open = false;
        }
    }

    if echo {
        local.flush().await.ok();
    }
    pipe.shutdown().await.ok();
}

async fn echo_errors<S>(mut source: S, echo: bool)
where
    S: AsyncRead + Unpin,
{
    let result = if echo {
        tokio::io::copy(&mut source, &mut tokio::io::stderr()).await
    } else {
        tokio::io::copy(&mut source, &mut tokio::io::sink()).await
    };
    if let Err(err) = result {
        debug!(error = %err, "remote stderr closed");
    }
}
