//! Container execution module for kopia-admin
//!
//! Handles all interactions with the Kopia server container:
//! - Demultiplexing attached exec output
//! - Running one-shot commands and capturing their stdout
//! - Driving interactive commands through scripted dialogues

pub mod demux;
pub mod dialogue;
mod error;
mod executor;
pub mod runtime;
pub mod session;

pub use demux::{Channel, Demultiplexer, Demuxed, Frame, FrameStream, StdFrameCodec};
pub use dialogue::{
    validate_identity, CommandSpec, DialogueHandle, DialogueObserver, DialogueOutcome, DialogueStep, ExitFuture,
    InteractiveRunner, LoggingObserver, ProcessSpawner, Reply, ScriptedDialogue, TokioSpawner,
};
pub use error::{ExecError, Result};
pub use executor::{normalize_output, CapturedResult, CommandExecutor};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use session::{ContainerHandle, ExecRequest, ExecSession};
