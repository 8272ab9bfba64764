//! Starting helper tools.
//!
//! Clients never spawn processes themselves: they are handed a [`Launcher`]
//! and get back a [`ToolIo`]. The real launcher spawns subprocesses,
//! tests hand in launchers backed by in-memory pipes (see [`crate::mock`]).

use std::{fmt::Debug, io, process::Stdio};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
};
use tracing::debug;

use crate::error::Error;

/// Something which can be terminated: kill it, then wait for it to exit.
pub trait ToolProcess: Send + Debug {
    /// Kill the tool and reap it.
    /// Terminating a tool which has already exited is not an error.
    fn terminate(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// The streams of a started tool.
pub struct ToolIo {
    /// Commands are written here.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,

    /// Replies and events are read from here.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,

    /// The tool itself.
    pub process: Box<dyn ToolProcess>,
}

impl Debug for ToolIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolIo")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Starts tools.
pub trait Launcher: Send + Sync + Debug {
    /// Start the tool described by the command line `args`.
    /// The first argument is the program.
    fn launch(&self, args: &[String]) -> Result<ToolIo, Error>;
}

/// Launches tools as subprocesses.
///
/// Standard error of the tool is inherited.
/// Tools are killed if their handle is dropped.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, args: &[String]) -> Result<ToolIo, Error> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::BadUsage("Empty command line".into()))?;

        let spawn_error = |source| Error::Spawn {
            command: args.join(" "),
            source,
        };

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            spawn_error(io::Error::new(io::ErrorKind::Other, "stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            spawn_error(io::Error::new(io::ErrorKind::Other, "stdout not captured"))
        })?;

        debug!(pid = ?child.id(), %program, "Spawned tool");

        Ok(ToolIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(ChildProcess(child)),
        })
    }
}

#[derive(Debug)]
struct ChildProcess(Child);

impl ToolProcess for ChildProcess {
    fn terminate(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.0.try_wait()?.is_none() {
                self.0.start_kill()?;
            }
            let status = self.0.wait().await?;
            debug!(%status, "Tool exited");

            Ok(())
        })
    }
}
