//! Captured command execution within containers

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::logging::STDERR_TARGET;
use crate::metrics;

use super::demux::{Demultiplexer, Demuxed};
use super::error::Result;
use super::runtime::ContainerRuntime;
use super::session::{ContainerHandle, ExecRequest};

/// Normalized stdout of a one-shot command.
///
/// Holds only primary-channel bytes: decoded as UTF-8 (lossy), with the
/// leading run of control characters and whitespace removed and trailing
/// whitespace trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct CapturedResult(String);

impl CapturedResult {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(normalize_output(&String::from_utf8_lossy(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CapturedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the leading control/whitespace run and trailing whitespace.
///
/// Stripping controls and whitespace in one pass keeps this idempotent: a
/// space followed by a control byte must not survive the first application.
pub fn normalize_output(text: &str) -> String {
    text.trim_start_matches(|c: char| c < ' ' || c.is_whitespace())
        .trim_end()
        .to_string()
}

/// Runs one-shot commands and captures their stdout
#[derive(Clone)]
pub struct CommandExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl CommandExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Build a request for `cmd` and run it
    pub async fn run_command<I, S>(&self, container: &ContainerHandle, cmd: I) -> Result<CapturedResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = ExecRequest::new(cmd)?;
        self.run_captured(container, &request).await
    }

    /// Execute `request` in `container` and return its normalized stdout.
    ///
    /// stderr is forwarded to the log as it arrives and never returned. A
    /// non-zero exit code is not an error; callers judge success from the
    /// captured text.
    pub async fn run_captured(&self, container: &ContainerHandle, request: &ExecRequest) -> Result<CapturedResult> {
        let start_time = Instant::now();

        let result = self.drain(container, request).await;
        let duration = start_time.elapsed().as_secs_f64();

        match &result {
            Ok(captured) => {
                metrics::record_exec(container.name(), duration, "ok");
                info!(
                    container = %container,
                    program = %request.program(),
                    output_bytes = captured.as_str().len(),
                    duration_ms = (duration * 1000.0) as u64,
                    "Execution completed"
                );
            }
            Err(e) => {
                metrics::record_exec(container.name(), duration, e.kind());
                warn!(container = %container, program = %request.program(), error = %e, "Execution failed");
            }
        }

        result
    }

    async fn drain(&self, container: &ContainerHandle, request: &ExecRequest) -> Result<CapturedResult> {
        let session = self.runtime.open_exec(container, request).await?;
        let exec_id = session.exec_id.clone();

        debug!(container = %container, exec_id = %exec_id, "Exec session attached");

        let Demuxed {
            mut primary,
            mut diagnostic,
        } = Demultiplexer::split(session.into_output());

        let mut buffer = Vec::new();
        let mut primary_open = true;
        let mut diagnostic_open = true;

        // Read both channels until each has reached end-of-stream
        while primary_open || diagnostic_open {
            tokio::select! {
                item = primary.recv(), if primary_open => match item {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(e),
                    None => primary_open = false,
                },
                item = diagnostic.recv(), if diagnostic_open => match item {
                    Some(Ok(bytes)) => {
                        warn!(
                            target: STDERR_TARGET,
                            container = %container,
                            exec_id = %exec_id,
                            "{}",
                            String::from_utf8_lossy(&bytes).trim_end()
                        );
                    }
                    Some(Err(e)) => return Err(e),
                    None => diagnostic_open = false,
                },
            }
        }

        match self.runtime.exec_exit_code(&exec_id).await {
            Some(0) | None => {}
            Some(code) => {
                warn!(container = %container, exec_id = %exec_id, exit_code = code, "Command exited non-zero");
            }
        }

        Ok(CapturedResult::from_bytes(&buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::demux::{decode_frames, raw_frame, Frame, FrameStream};
    use crate::container::error::ExecError;
    use crate::container::runtime::MockContainerRuntime;
    use crate::container::session::ExecSession;
    use futures::stream::{self, StreamExt};
    use pretty_assertions::assert_eq;

    fn runtime_with(frames: FrameStream, exit_code: Option<i64>) -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_open_exec()
            .withf(|container, request| {
                container.name() == "kopia-server"
                    && request.cmd().join(" ") == "kopia server user list --json"
                    && request.attach_stdout()
                    && request.attach_stderr()
            })
            .times(1)
            .return_once(move |container, _| Ok(ExecSession::new("exec-1", container.clone(), frames)));
        runtime
            .expect_exec_exit_code()
            .returning(move |_| exit_code);
        runtime
    }

    async fn list_users(runtime: MockContainerRuntime) -> Result<CapturedResult> {
        let executor = CommandExecutor::new(Arc::new(runtime));
        executor
            .run_command(
                &ContainerHandle::new("kopia-server"),
                ["kopia", "server", "user", "list", "--json"],
            )
            .await
    }

    #[tokio::test]
    async fn test_captures_normalized_stdout() {
        let bytes = raw_frame(1, b"\x01\x02[{\"username\":\"alice\",\"passwordHashVersion\":2}]\n");
        let reader = tokio_test::io::Builder::new().read(&bytes).build();

        let result = list_users(runtime_with(decode_frames(reader), Some(0))).await.unwrap();

        assert_eq!(result.as_str(), r#"[{"username":"alice","passwordHashVersion":2}]"#);
        let parsed: serde_json::Value = serde_json::from_str(result.as_str()).unwrap();
        assert_eq!(parsed[0]["username"], "alice");
    }

    #[tokio::test]
    async fn test_stream_error_discards_partial_output() {
        let bytes = raw_frame(1, b"[{\"username\":\"alice\"}]");
        let reader = tokio_test::io::Builder::new()
            .read(&bytes[..10])
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection lost"))
            .build();
        let frames = decode_frames(reader);

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_open_exec()
            .times(1)
            .return_once(move |container, _| Ok(ExecSession::new("exec-2", container.clone(), frames)));
        runtime.expect_exec_exit_code().never();

        let err = list_users(runtime).await.unwrap_err();
        match err {
            ExecError::Stream(reason) => assert!(reason.contains("connection lost")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stderr_never_reaches_result() {
        let frames: Vec<Result<Frame>> = vec![
            Ok(Frame::diagnostic("WARN: cache miss\n")),
            Ok(Frame::primary("[")),
            Ok(Frame::diagnostic("DIAGNOSTIC-ONLY")),
            Ok(Frame::primary("]\n")),
        ];
        let result = list_users(runtime_with(stream::iter(frames).boxed(), Some(0)))
            .await
            .unwrap();

        assert_eq!(result.as_str(), "[]");
        assert!(!result.as_str().contains("DIAGNOSTIC"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_still_returns_output() {
        let frames: Vec<Result<Frame>> = vec![
            Ok(Frame::primary("not found\n")),
            Ok(Frame::diagnostic("ERROR user does not exist\n")),
        ];
        let result = list_users(runtime_with(stream::iter(frames).boxed(), Some(1)))
            .await
            .unwrap();
        assert_eq!(result.as_str(), "not found");
    }

    #[tokio::test]
    async fn test_session_start_error_propagates() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_open_exec().times(1).returning(|container, _| {
            Err(ExecError::session_start(container.name(), "No such container"))
        });
        runtime.expect_exec_exit_code().never();

        let err = list_users(runtime).await.unwrap_err();
        match err {
            ExecError::SessionStart { container, reason } => {
                assert_eq!(container, "kopia-server");
                assert!(reason.contains("No such container"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_command_never_reaches_runtime() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_open_exec().never();
        let executor = CommandExecutor::new(Arc::new(runtime));
        let err = executor
            .run_command(&ContainerHandle::new("kopia-server"), Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidRequest(_)));
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("\x01\x02[]\n"), "[]");
        assert_eq!(normalize_output("  \t\r\n"), "");
        assert_eq!(normalize_output(" \x01abc \x02"), "abc \x02");
        assert_eq!(normalize_output("\x00\x1fhello world\n\n"), "hello world");
        assert_eq!(CapturedResult::from_bytes(b"\xff\x01ok").as_str(), "\u{fffd}\u{1}ok");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            "",
            "\x01\x02[]\n",
            " \x01abc",
            "\n\x03 \x04  value\t\n",
            "\u{a0}\x05text\u{3000}",
            "plain",
            "\x1b[0mcolored\x1b[0m \n",
        ];
        for input in inputs {
            let once = normalize_output(input);
            assert_eq!(normalize_output(&once), once, "input {:?}", input);
        }
    }
}
