//! bifrost: run scripts in a long-lived companion runtime from a Rust host.
//!
//! The host spawns one companion process, sends it scripts as framed JSON on
//! stdin, and watches its stdout for a completion marker. Named variables
//! travel through a [`VariableSync`] before and after each run. Timeouts and
//! interrupts replace the companion with a fresh process.

mod monitor;
mod state;
mod supervisor;

pub mod bridge;
pub mod companion;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod sync;

pub use bridge::codec::{FrameCodec, FrameError, MAX_PAYLOAD_LEN};
pub use bridge::protocol::{CompanionMessage, DispatchRequest, OutputLine};
pub use companion::{CompanionError, CompanionWriter, ScriptHandler, serve};
pub use config::{BridgeConfig, CompanionConfig};
pub use coordinator::{Bridge, RunError, RunOutcome, RunReport};
pub use state::{CompletionReason, RunSnapshot, RunState};
pub use supervisor::{ProcessSupervisor, SpawnError};
pub use sync::{
    EncodedVariable, JsonFileSync, SerializerRegistry, SyncError, TypeTag, Variable, VariableSet,
    VariableSync,
};
pub use tokio_util::sync::CancellationToken;
