//! kopia-admin library
//!
//! Executes commands inside a running Kopia server container: one-shot
//! commands with captured output, and prompt-driven credential dialogues.

use std::sync::Arc;

use anyhow::Result;

pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod provisioning;

use crate::config::AppConfig;
use crate::container::{CommandExecutor, DockerRuntime, InteractiveRunner, TokioSpawner};
use crate::provisioning::ProvisioningOrchestrator;

/// Wire the Docker runtime and process spawner into an orchestrator
pub fn build_orchestrator(config: &AppConfig) -> Result<ProvisioningOrchestrator> {
    let runtime = DockerRuntime::connect(&config.runtime)?;
    let executor = CommandExecutor::new(Arc::new(runtime));
    let runner = InteractiveRunner::new(
        Arc::new(TokioSpawner),
        config.runtime.docker_path.clone(),
        config.dialogue.secret_env.clone(),
    );

    Ok(ProvisioningOrchestrator::new(
        &config.provisioning,
        &config.dialogue,
        executor,
        runner,
    ))
}
