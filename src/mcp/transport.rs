//! Subprocess transport: how a remote toolset is started.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::TurnloopError;

/// Command line and environment for a stdio tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioServerParams {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Directory the server may access; passed as the final argument.
    pub sandbox_root: Option<PathBuf>,
}

impl StdioServerParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            sandbox_root: None,
        }
    }

    /// A package fetched and run by `npx`, e.g.
    /// `npx -y @modelcontextprotocol/server-filesystem /abs/root`.
    pub fn npx(package: impl Into<String>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self::new("npx")
            .arg("-y")
            .arg(package)
            .sandbox_root(sandbox_root)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = Some(root.into());
        self
    }

    /// Full argument list, with the sandbox root last.
    pub fn command_args(&self) -> Result<Vec<String>, TurnloopError> {
        let mut args = self.args.clone();
        if let Some(root) = &self.sandbox_root {
            if !root.is_absolute() {
                return Err(TurnloopError::Configuration(format!(
                    "sandbox root must be an absolute path, got '{}'",
                    root.display()
                )));
            }
            args.push(root.to_string_lossy().into_owned());
        }
        Ok(args)
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Start the server with piped stdio. The child is killed if dropped.
    pub fn spawn(&self, label: &str) -> Result<SpawnedServer, TurnloopError> {
        let args = self.command_args()?;
        let mut command = Command::new(&self.command);
        command
            .args(&args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| TurnloopError::Spawn {
            command: self.display(),
            source,
        })?;
        let missing = |stream: &str| TurnloopError::Transport(format!("{label}: child {stream} not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = LinesStream::new(tokio::io::BufReader::new(stderr).lines());
                while let Some(Ok(line)) = lines.next().await {
                    debug!(toolset = %label, "stderr: {line}");
                }
            });
        }

        debug!(toolset = %label, pid = ?child.id(), command = %self.display(), "spawned tool server");
        Ok(SpawnedServer {
            child,
            stdin,
            stdout,
        })
    }
}

/// A running server process with its stdio handles split out.
#[derive(Debug)]
pub struct SpawnedServer {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}
