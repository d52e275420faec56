//! Credential provisioning against the Kopia server container
//!
//! Each request moves through `Issued → Settled`. The remote side gives no
//! acknowledgement for an interactive `user add`, so the orchestrator waits
//! a fixed settle delay after issuing each operation and then reports
//! success. Callers that need the real outcome of a create can use
//! [`ProvisioningOrchestrator::create_credential_and_wait`] instead.
//!
//! Requests are not serialized here. Two overlapping requests race against
//! the container's user list; the caller must accept one at a time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{DialogueConfig, ProvisioningConfig};
use crate::container::{
    validate_identity, CapturedResult, CommandExecutor, ContainerHandle, DialogueHandle, InteractiveRunner,
    Result, ScriptedDialogue,
};
use crate::metrics;

/// Provisioning operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Remove => "remove",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionState {
    /// The mutating command has been issued
    Issued,
    /// The settle delay has elapsed
    Settled,
}

/// Fixed wait per operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub create: Duration,
    pub remove: Duration,
}

impl SettlePolicy {
    pub fn delay_for(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Create => self.create,
            Operation::Remove => self.remove,
        }
    }
}

impl From<&ProvisioningConfig> for SettlePolicy {
    fn from(config: &ProvisioningConfig) -> Self {
        Self {
            create: config.create_settle_delay(),
            remove: config.remove_settle_delay(),
        }
    }
}

/// What a provisioning request reports back
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub operation: Operation,
    pub identity: String,
    pub state: ProvisionState,
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    pub issued_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
    /// Output of the remove command; `None` for creates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CapturedResult>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Sequences captured executions and interactive dialogues into the
/// list/create/remove operations
pub struct ProvisioningOrchestrator {
    container: ContainerHandle,
    kopia_path: String,
    dialogue: DialogueConfig,
    settle: SettlePolicy,
    executor: CommandExecutor,
    runner: InteractiveRunner,
}

impl ProvisioningOrchestrator {
    pub fn new(
        provisioning: &ProvisioningConfig,
        dialogue: &DialogueConfig,
        executor: CommandExecutor,
        runner: InteractiveRunner,
    ) -> Self {
        Self {
            container: ContainerHandle::new(provisioning.container_name.clone()),
            kopia_path: provisioning.kopia_path.clone(),
            dialogue: dialogue.clone(),
            settle: SettlePolicy::from(provisioning),
            executor,
            runner,
        }
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    pub fn settle_policy(&self) -> SettlePolicy {
        self.settle
    }

    /// `kopia server user list --json`, returned verbatim for the caller to decode
    pub async fn list_credentials(&self) -> Result<CapturedResult> {
        self.executor
            .run_command(
                &self.container,
                [self.kopia_path.as_str(), "server", "user", "list", "--json"],
            )
            .await
    }

    /// Start the interactive `user add` and report `Settled` once the create
    /// settle delay has elapsed.
    ///
    /// The dialogue's own outcome is not awaited. A failure after this
    /// returns is only reported through the runner's observer.
    pub async fn create_credential(&self, identity: &str, secret: SecretString) -> Result<Provisioned> {
        let (provisioned, _dialogue) = self.create_credential_tracked(identity, secret).await?;
        Ok(provisioned)
    }

    /// Same contract as [`create_credential`](Self::create_credential), but
    /// also hands back the dialogue so the caller can keep the driver alive
    /// until its outcome has been observed.
    pub async fn create_credential_tracked(
        &self,
        identity: &str,
        secret: SecretString,
    ) -> Result<(Provisioned, DialogueHandle)> {
        let dialogue = ScriptedDialogue::add_user(&self.kopia_path, identity, secret, &self.dialogue)?;
        let issued_at = Utc::now();

        let handle = self.runner.run_interactive(&self.container, dialogue)?;
        info!(
            identity = %identity,
            container = %self.container,
            dialogue_id = %handle.id,
            state = ?ProvisionState::Issued,
            "Credential create issued"
        );

        let provisioned = self.settle(Operation::Create, identity, issued_at, None).await;
        Ok((provisioned, handle))
    }

    /// Start the interactive `user add` and wait for the driver to exit.
    ///
    /// Returns `DialogueMismatch` when the dialogue did not complete.
    pub async fn create_credential_and_wait(&self, identity: &str, secret: SecretString) -> Result<Provisioned> {
        let dialogue = ScriptedDialogue::add_user(&self.kopia_path, identity, secret, &self.dialogue)?;
        let issued_at = Utc::now();

        let handle = self.runner.run_interactive(&self.container, dialogue)?;
        debug!(identity = %identity, dialogue_id = %handle.id, "Waiting for credential dialogue");
        handle.wait().await.into_result()?;

        let settled_at = Utc::now();
        metrics::record_provisioning(Operation::Create.as_str());
        info!(identity = %identity, container = %self.container, "Credential created");

        Ok(Provisioned {
            operation: Operation::Create,
            identity: identity.to_string(),
            state: ProvisionState::Settled,
            settle_delay: Duration::ZERO,
            issued_at,
            settled_at,
            output: None,
        })
    }

    /// Run `kopia server user remove <identity>` and report `Settled` once
    /// the remove settle delay has elapsed
    pub async fn remove_credential(&self, identity: &str) -> Result<Provisioned> {
        validate_identity(identity)?;
        let issued_at = Utc::now();

        let output = self
            .executor
            .run_command(
                &self.container,
                [self.kopia_path.as_str(), "server", "user", "remove", identity],
            )
            .await?;
        info!(
            identity = %identity,
            container = %self.container,
            state = ?ProvisionState::Issued,
            "Credential remove issued"
        );

        Ok(self
            .settle(Operation::Remove, identity, issued_at, Some(output))
            .await)
    }

    async fn settle(
        &self,
        operation: Operation,
        identity: &str,
        issued_at: DateTime<Utc>,
        output: Option<CapturedResult>,
    ) -> Provisioned {
        let delay = self.settle.delay_for(operation);
        tokio::time::sleep(delay).await;

        metrics::record_provisioning(operation.as_str());
        info!(
            operation = %operation,
            identity = %identity,
            settle_ms = delay.as_millis() as u64,
            state = ?ProvisionState::Settled,
            "Provisioning settled"
        );

        Provisioned {
            operation,
            identity: identity.to_string(),
            state: ProvisionState::Settled,
            settle_delay: delay,
            issued_at,
            settled_at: Utc::now(),
            output,
        }
    }
}
