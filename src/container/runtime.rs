//! Container runtime client
//!
//! [`ContainerRuntime`] is everything the executor needs from the runtime:
//! resolve a container, create an attached exec, start it and hand back the
//! multiplexed output. [`DockerRuntime`] implements it against the
//! Docker/Podman API.

use std::io;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, LogOutput};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::future;
use futures::stream::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::config::RuntimeConfig;

use super::demux::Frame;
use super::error::{ExecError, Result};
use super::session::{ContainerHandle, ExecRequest, ExecSession};

/// Operations consumed from the container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve `container`, create an exec for `request`, start it attached
    async fn open_exec(&self, container: &ContainerHandle, request: &ExecRequest) -> Result<ExecSession>;

    /// Exit code of a finished exec, if the runtime still knows it
    async fn exec_exit_code(&self, exec_id: &str) -> Option<i64>;
}

/// Docker Engine API client
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the configured socket, or the local defaults
    pub fn connect(config: &RuntimeConfig) -> Result<Self> {
        let docker = match config.docker_socket.as_deref() {
            #[cfg(unix)]
            Some(socket) => Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION),
            #[cfg(not(unix))]
            Some(_) => Docker::connect_with_local_defaults(),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ExecError::session_start("<runtime>", e))?;

        info!(socket = ?config.docker_socket, "Container runtime client initialized");

        Ok(Self { docker })
    }

    async fn ensure_running(&self, container: &ContainerHandle) -> Result<()> {
        let inspect = self
            .docker
            .inspect_container(container.name(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| ExecError::session_start(container.name(), e))?;

        let running = inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);

        if !running {
            return Err(ExecError::session_start(container.name(), "container is not running"));
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn open_exec(&self, container: &ContainerHandle, request: &ExecRequest) -> Result<ExecSession> {
        self.ensure_running(container).await?;

        let exec = self
            .docker
            .create_exec(
                container.name(),
                CreateExecOptions {
                    cmd: Some(request.cmd().to_vec()),
                    attach_stdout: Some(request.attach_stdout()),
                    attach_stderr: Some(request.attach_stderr()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ExecError::session_start(container.name(), e))?;

        debug!(container = %container, exec_id = %exec.id, program = %request.program(), "Exec created");

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ExecError::session_start(container.name(), e))?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let exec_id = exec.id.clone();
                let frames = output
                    // A connection closed mid-frame ends both channels; the partial frame is dropped
                    .take_while(move |item| {
                        let truncated = matches!(item, Err(e) if is_truncated_frame(e));
                        if truncated {
                            debug!(exec_id = %exec_id, "Discarding partial frame at end of stream");
                        }
                        future::ready(!truncated)
                    })
                    .map_err(|e| ExecError::Stream(e.to_string()))
                    .map(|item| item.map(frame_from_log))
                    .boxed();
                Ok(ExecSession::new(exec.id, container.clone(), frames))
            }
            StartExecResults::Detached => Err(ExecError::session_start(
                container.name(),
                "runtime started the exec detached",
            )),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Option<i64> {
        match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.exit_code,
            Err(e) => {
                debug!(exec_id = %exec_id, error = %e, "Failed to inspect exec");
                None
            }
        }
    }
}

/// The API client's frame decoder reports leftover bytes at end-of-stream
/// as this I/O error
fn is_truncated_frame(err: &DockerError) -> bool {
    match err {
        DockerError::IOError { err } => {
            err.kind() == io::ErrorKind::Other && err.to_string() == "bytes remaining on stream"
        }
        _ => false,
    }
}

/// Map a frame decoded by the API client onto our channel tags
pub(crate) fn frame_from_log(output: LogOutput) -> Frame {
    match output {
        LogOutput::StdErr { message } => Frame::diagnostic(message),
        LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => Frame::primary(message),
    }
}
