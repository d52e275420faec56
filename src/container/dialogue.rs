//! Scripted interactive dialogues
//!
//! Some container commands only take input from a terminal prompt. For those
//! we launch `expect` inside the container through a nested
//! `docker exec -i`, and let it answer each prompt from a script. The only
//! completion signal is the exit code of that driver process.
//!
//! Secrets never appear in the script or on a command line. The driver
//! process receives the secret in its environment, `docker exec -e NAME`
//! forwards it into the container, and the script reads it back as
//! `$env(NAME)`.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DialogueConfig;
use crate::metrics;

use super::error::{ExecError, Result};
use super::session::ContainerHandle;

static IDENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@-]{0,127}$").expect("valid identity regex"));

/// Check that `identity` is safe to pass to kopia and to embed in a script
pub fn validate_identity(identity: &str) -> Result<()> {
    if IDENTITY_PATTERN.is_match(identity) {
        Ok(())
    } else {
        Err(ExecError::InvalidIdentity(format!(
            "{:?} must be 1-128 characters of [A-Za-z0-9._@-] starting with a letter or digit",
            identity
        )))
    }
}

/// What to send once a prompt has been seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The dialogue's secret, read from the driver's environment
    Secret,
    /// A fixed line
    Line(String),
}

/// One expected prompt and its scripted reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueStep {
    pub prompt: String,
    pub reply: Reply,
}

/// An expect script: spawn a command, answer prompts in order, then require
/// end-of-session.
///
/// Built fresh for each invocation and consumed by
/// [`InteractiveRunner::run_interactive`].
#[derive(Debug)]
pub struct ScriptedDialogue {
    label: &'static str,
    command: Vec<String>,
    steps: Vec<DialogueStep>,
    secret: SecretString,
    timeout_secs: u64,
}

/// Exit codes the generated script uses for its own failures
pub mod exit_codes {
    pub const PROMPT_TIMEOUT: i32 = 70;
    pub const PROMPT_EOF: i32 = 71;
    pub const TRAILING_OUTPUT: i32 = 72;
}

impl ScriptedDialogue {
    pub fn new(
        label: &'static str,
        command: Vec<String>,
        steps: Vec<DialogueStep>,
        secret: SecretString,
        timeout_secs: u64,
    ) -> Self {
        Self {
            label,
            command,
            steps,
            secret,
            timeout_secs,
        }
    }

    /// `kopia server user add <identity>` answering the password and
    /// verification prompts with `secret`
    pub fn add_user(kopia_path: &str, identity: &str, secret: SecretString, config: &DialogueConfig) -> Result<Self> {
        validate_identity(identity)?;

        let command = vec![
            kopia_path.to_string(),
            "server".to_string(),
            "user".to_string(),
            "add".to_string(),
            identity.to_string(),
        ];
        let steps = vec![
            DialogueStep {
                prompt: config.new_password_prompt.clone(),
                reply: Reply::Secret,
            },
            DialogueStep {
                prompt: config.verify_prompt.clone(),
                reply: Reply::Secret,
            },
        ];

        Ok(Self::new("user_add", command, steps, secret, config.timeout_secs))
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn steps(&self) -> &[DialogueStep] {
        &self.steps
    }

    /// Render the expect script. The secret is referenced through
    /// `$env(secret_env)` and never inlined.
    pub fn render_script(&self, secret_env: &str) -> String {
        let mut script = String::new();
        script.push_str(&format!("set timeout {}\n", self.timeout_secs));

        let spawn: Vec<String> = self.command.iter().map(|token| tcl_quote(token)).collect();
        script.push_str(&format!("spawn {}\n", spawn.join(" ")));

        for step in &self.steps {
            script.push_str(&format!(
                "expect {{\n  -exact {} {{}}\n  timeout {{ exit {} }}\n  eof {{ exit {} }}\n}}\n",
                tcl_quote(&step.prompt),
                exit_codes::PROMPT_TIMEOUT,
                exit_codes::PROMPT_EOF
            ));
            match &step.reply {
                Reply::Secret => script.push_str(&format!("send -- \"$env({})\\r\"\n", secret_env)),
                Reply::Line(line) => script.push_str(&format!("send -- {}\n", tcl_quote(&format!("{}\r", line)))),
            }
        }

        // Anything other than end-of-session (another prompt, a hang) fails
        script.push_str(&format!(
            "expect {{\n  eof {{}}\n  timeout {{ exit {} }}\n}}\n",
            exit_codes::TRAILING_OUTPUT
        ));
        script.push_str("set result [wait]\nexit [lindex $result 3]\n");
        script
    }
}

/// Quote a string as a Tcl double-quoted word
fn tcl_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' | '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A subprocess to launch
#[derive(Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables added to the child's environment only
    pub env: Vec<(String, SecretString)>,
}

/// Resolves with the child's exit code (`None` if killed by a signal)
pub type ExitFuture = BoxFuture<'static, std::io::Result<Option<i32>>>;

/// Launches subprocesses and reports their exit asynchronously
#[cfg_attr(test, mockall::automock)]
pub trait ProcessSpawner: Send + Sync {
    /// Start `command`. Errors here mean the process never started.
    fn spawn(&self, command: CommandSpec) -> std::io::Result<ExitFuture>;
}

/// [`ProcessSpawner`] backed by `tokio::process`.
///
/// stdout and stderr are inherited so the driver's transcript lands next to
/// our own output; stdin is closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, command: CommandSpec) -> std::io::Result<ExitFuture> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (key, value) in &command.env {
            cmd.env(key, value.expose_secret());
        }

        let mut child = cmd.spawn()?;

        Ok(Box::pin(async move {
            let status = child.wait().await?;
            Ok(status.code())
        }))
    }
}

/// How a dialogue driver finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueOutcome {
    /// The driver reached end-of-session and the command exited 0
    Completed,
    /// Anything else
    Mismatch { exit_code: Option<i32> },
}

impl DialogueOutcome {
    fn from_exit(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => DialogueOutcome::Completed,
            other => DialogueOutcome::Mismatch { exit_code: other },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DialogueOutcome::Completed => "completed",
            DialogueOutcome::Mismatch { .. } => "mismatch",
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            DialogueOutcome::Completed => Ok(()),
            DialogueOutcome::Mismatch { exit_code } => Err(ExecError::DialogueMismatch { exit_code }),
        }
    }
}

/// Notified exactly once when each dialogue driver exits
pub trait DialogueObserver: Send + Sync {
    fn on_exit(&self, dialogue_id: Uuid, label: &'static str, outcome: &DialogueOutcome);
}

/// Default observer: writes the outcome to the operational log
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl DialogueObserver for LoggingObserver {
    fn on_exit(&self, dialogue_id: Uuid, label: &'static str, outcome: &DialogueOutcome) {
        match outcome {
            DialogueOutcome::Completed => {
                info!(dialogue_id = %dialogue_id, dialogue = label, "Dialogue completed");
            }
            DialogueOutcome::Mismatch { exit_code } => {
                let err = ExecError::DialogueMismatch { exit_code: *exit_code };
                error!(dialogue_id = %dialogue_id, dialogue = label, error = %err, "Dialogue failed");
            }
        }
    }
}

/// Completion handle for a running dialogue.
///
/// Dropping it detaches: the driver keeps running and the observer still
/// fires.
#[derive(Debug)]
pub struct DialogueHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<DialogueOutcome>,
}

impl DialogueHandle {
    /// Wait for the driver to exit
    pub async fn wait(self) -> DialogueOutcome {
        self.rx
            .await
            .unwrap_or(DialogueOutcome::Mismatch { exit_code: None })
    }
}

impl fmt::Display for DialogueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dialogue {}", self.id)
    }
}

/// Drives [`ScriptedDialogue`]s through `docker exec -i <container> expect -c`
pub struct InteractiveRunner {
    spawner: Arc<dyn ProcessSpawner>,
    docker_path: String,
    secret_env: String,
    observer: Arc<dyn DialogueObserver>,
}

impl InteractiveRunner {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, docker_path: impl Into<String>, secret_env: impl Into<String>) -> Self {
        Self {
            spawner,
            docker_path: docker_path.into(),
            secret_env: secret_env.into(),
            observer: Arc::new(LoggingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DialogueObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Build the nested exec command for `dialogue`
    fn driver_command(&self, container: &ContainerHandle, dialogue: ScriptedDialogue) -> CommandSpec {
        let script = dialogue.render_script(&self.secret_env);
        CommandSpec {
            program: self.docker_path.clone(),
            args: vec![
                "exec".to_string(),
                "-i".to_string(),
                "-e".to_string(),
                self.secret_env.clone(),
                container.name().to_string(),
                "expect".to_string(),
                "-c".to_string(),
                script,
            ],
            env: vec![(self.secret_env.clone(), dialogue.secret)],
        }
    }

    /// Launch `dialogue` in `container` without waiting for it.
    ///
    /// Fails synchronously only when the driver cannot be spawned. Every
    /// other failure arrives later, through the returned handle and the
    /// observer.
    pub fn run_interactive(&self, container: &ContainerHandle, dialogue: ScriptedDialogue) -> Result<DialogueHandle> {
        let dialogue_id = Uuid::new_v4();
        let label = dialogue.label();

        let command = self.driver_command(container, dialogue);
        let exit = self.spawner.spawn(command).map_err(|e| {
            metrics::record_dialogue("spawn_error");
            ExecError::Spawn(e)
        })?;

        info!(dialogue_id = %dialogue_id, container = %container, dialogue = label, "Dialogue driver started");

        let (tx, rx) = oneshot::channel();
        let observer = self.observer.clone();

        tokio::spawn(async move {
            let outcome = match exit.await {
                Ok(code) => DialogueOutcome::from_exit(code),
                Err(e) => {
                    warn!(dialogue_id = %dialogue_id, error = %e, "Failed to wait for dialogue driver");
                    DialogueOutcome::Mismatch { exit_code: None }
                }
            };

            metrics::record_dialogue(outcome.label());
            observer.on_exit(dialogue_id, label, &outcome);
            // Nobody listening is fine; the handle may have been dropped
            let _ = tx.send(outcome);
        });

        Ok(DialogueHandle { id: dialogue_id, rx })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Observer that records every notification
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) calls: Mutex<Vec<(Uuid, DialogueOutcome)>>,
    }

    impl DialogueObserver for RecordingObserver {
        fn on_exit(&self, dialogue_id: Uuid, _label: &'static str, outcome: &DialogueOutcome) {
            self.calls.lock().unwrap().push((dialogue_id, *outcome));
        }
    }

    pub(crate) fn exits_with(code: Option<i32>) -> std::io::Result<ExitFuture> {
        Ok(Box::pin(async move { Ok(code) }))
    }

    fn add_bob() -> ScriptedDialogue {
        ScriptedDialogue::add_user(
            "kopia",
            "bob@backup-host",
            SecretString::from("s3cret".to_string()),
            &DialogueConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("bob@backup-host").is_ok());
        assert!(validate_identity("a.b_c-d@h.example").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("-flag").is_err());
        assert!(validate_identity("bob\"; exec rm").is_err());
        assert!(validate_identity("bob$env(HOME)").is_err());
        assert!(validate_identity("bob[exit]").is_err());
        assert!(validate_identity(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_tcl_quote() {
        assert_eq!(tcl_quote("plain"), "\"plain\"");
        assert_eq!(tcl_quote("a\"b$c[d]"), "\"a\\\"b\\$c\\[d\\]\"");
        assert_eq!(tcl_quote("x\r"), "\"x\\r\"");
    }

    #[test]
    fn test_script_uses_env_not_secret() {
        let dialogue = add_bob();
        assert_eq!(dialogue.steps().len(), 2);

        let script = dialogue.render_script("KOPIA_ADMIN_DIALOGUE_SECRET");
        assert!(!script.contains("s3cret"));
        assert!(!format!("{:?}", dialogue).contains("s3cret"));
        assert!(script.starts_with("set timeout 10\n"));
        assert!(script.contains("spawn \"kopia\" \"server\" \"user\" \"add\" \"bob@backup-host\"\n"));
        assert!(script.contains("-exact \"Enter new password:\" {}"));
        assert!(script.contains("-exact \"Re-enter password for verification:\" {}"));
        assert_eq!(script.matches("send -- \"$env(KOPIA_ADMIN_DIALOGUE_SECRET)\\r\"").count(), 2);
        assert!(script.ends_with("exit [lindex $result 3]\n"));

        let new_password = script.find("Enter new password:").unwrap();
        let verify = script.find("Re-enter password").unwrap();
        let eof = script.rfind("eof {}").unwrap();
        assert!(new_password < verify && verify < eof);
    }

    #[test]
    fn test_fixed_line_reply_is_quoted() {
        let dialogue = ScriptedDialogue::new(
            "user_remove",
            vec!["kopia".to_string(), "server".to_string(), "user".to_string(), "remove".to_string()],
            vec![DialogueStep {
                prompt: "Really remove \"bob\"? [y/N]".to_string(),
                reply: Reply::Line("y".to_string()),
            }],
            SecretString::from(String::new()),
            5,
        );

        let script = dialogue.render_script("KOPIA_ADMIN_DIALOGUE_SECRET");
        assert!(script.starts_with("set timeout 5\n"));
        assert!(script.contains("-exact \"Really remove \\\"bob\\\"? \\[y/N\\]\" {}"));
        assert!(script.contains("send -- \"y\\r\"\n"));
        assert!(!script.contains("$env("));
    }

    #[test]
    fn test_add_user_rejects_bad_identity() {
        let err = ScriptedDialogue::add_user(
            "kopia",
            "bob\" ; exec sh",
            SecretString::from("x".to_string()),
            &DialogueConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::InvalidIdentity(_)));
    }

    #[tokio::test]
    async fn test_driver_command_shape() {
        let mut spawner = MockProcessSpawner::new();
        spawner
            .expect_spawn()
            .withf(|command| {
                command.program == "/usr/bin/docker"
                    && command.args[..7] == ["exec", "-i", "-e", "KOPIA_ADMIN_DIALOGUE_SECRET", "kopia-server", "expect", "-c"]
                    && command.args.iter().all(|arg| !arg.contains("s3cret"))
                    && command.env.len() == 1
                    && command.env[0].0 == "KOPIA_ADMIN_DIALOGUE_SECRET"
                    && command.env[0].1.expose_secret() == "s3cret"
            })
            .times(1)
            .returning(|_| exits_with(Some(0)));

        let runner = InteractiveRunner::new(Arc::new(spawner), "/usr/bin/docker", "KOPIA_ADMIN_DIALOGUE_SECRET");
        let handle = runner
            .run_interactive(&ContainerHandle::new("kopia-server"), add_bob())
            .unwrap();
        assert_eq!(handle.wait().await, DialogueOutcome::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_notifies_observer_once() {
        let mut spawner = MockProcessSpawner::new();
        spawner.expect_spawn().times(1).returning(|_| exits_with(Some(1)));
        let observer = Arc::new(RecordingObserver::default());

        let runner = InteractiveRunner::new(Arc::new(spawner), "docker", "KOPIA_ADMIN_DIALOGUE_SECRET")
            .with_observer(observer.clone());
        let handle = runner
            .run_interactive(&ContainerHandle::new("kopia-server"), add_bob())
            .unwrap();
        let id = handle.id;

        let outcome = handle.wait().await;
        assert_eq!(outcome, DialogueOutcome::Mismatch { exit_code: Some(1) });
        assert!(matches!(
            outcome.into_result(),
            Err(ExecError::DialogueMismatch { exit_code: Some(1) })
        ));

        let calls = observer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (id, DialogueOutcome::Mismatch { exit_code: Some(1) }));
    }

    #[tokio::test]
    async fn test_observer_fires_when_handle_dropped() {
        let mut spawner = MockProcessSpawner::new();
        spawner.expect_spawn().times(1).returning(|_| exits_with(None));
        let observer = Arc::new(RecordingObserver::default());

        let runner = InteractiveRunner::new(Arc::new(spawner), "docker", "KOPIA_ADMIN_DIALOGUE_SECRET")
            .with_observer(observer.clone());
        drop(
            runner
                .run_interactive(&ContainerHandle::new("kopia-server"), add_bob())
                .unwrap(),
        );

        for _ in 0..100 {
            if !observer.calls.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let calls = observer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, DialogueOutcome::Mismatch { exit_code: None });
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let mut spawner = MockProcessSpawner::new();
        spawner
            .expect_spawn()
            .times(1)
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::NotFound, "docker not found")));
        let observer = Arc::new(RecordingObserver::default());

        let runner = InteractiveRunner::new(Arc::new(spawner), "docker", "KOPIA_ADMIN_DIALOGUE_SECRET")
            .with_observer(observer.clone());
        let err = runner
            .run_interactive(&ContainerHandle::new("kopia-server"), add_bob())
            .unwrap_err();

        assert!(matches!(err, ExecError::Spawn(_)));
        assert!(observer.calls.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_spawner_reports_exit_code() {
        let exit = TokioSpawner
            .spawn(CommandSpec {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 3".to_string()],
                env: vec![],
            })
            .unwrap();
        assert_eq!(exit.await.unwrap(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_spawner_passes_env() {
        let exit = TokioSpawner
            .spawn(CommandSpec {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "test \"$DIALOGUE_SECRET\" = s3cret".to_string()],
                env: vec![("DIALOGUE_SECRET".to_string(), SecretString::from("s3cret".to_string()))],
            })
            .unwrap();
        assert_eq!(exit.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_tokio_spawner_missing_program() {
        let err = TokioSpawner
            .spawn(CommandSpec {
                program: "/nonexistent/kopia-admin-driver".to_string(),
                args: vec![],
                env: vec![],
            })
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
