//! Exec session types

use std::fmt;

use super::demux::FrameStream;
use super::error::{ExecError, Result};

/// A running container addressed by name.
///
/// The name is resolved by the runtime on every call; nothing about the
/// container is cached between operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    name: String,
}

impl ContainerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A command to run inside a container, plus which channels to attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    cmd: Vec<String>,
    attach_stdout: bool,
    attach_stderr: bool,
}

impl ExecRequest {
    /// Build a request with both channels attached
    pub fn new<I, S>(cmd: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        if cmd.is_empty() {
            return Err(ExecError::InvalidRequest("command is empty".to_string()));
        }
        Ok(Self {
            cmd,
            attach_stdout: true,
            attach_stderr: true,
        })
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn program(&self) -> &str {
        &self.cmd[0]
    }

    pub fn attach_stdout(&self) -> bool {
        self.attach_stdout
    }

    pub fn attach_stderr(&self) -> bool {
        self.attach_stderr
    }
}

/// One live, attached execution.
///
/// Owns the multiplexed output of the remote command until it is drained.
/// Draining consumes the session, so it cannot be reused.
pub struct ExecSession {
    /// Runtime-assigned exec ID
    pub exec_id: String,

    /// Container the command runs in
    pub container: ContainerHandle,

    output: FrameStream,
}

impl ExecSession {
    pub fn new(exec_id: impl Into<String>, container: ContainerHandle, output: FrameStream) -> Self {
        Self {
            exec_id: exec_id.into(),
            container,
            output,
        }
    }

    /// Take ownership of the multiplexed output
    pub fn into_output(self) -> FrameStream {
        self.output
    }
}

impl fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSession")
            .field("exec_id", &self.exec_id)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}
