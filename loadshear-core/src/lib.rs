//! The sharded scripted load generation engine: script verification/lowering, the
//! per-shard event loop, TCP/UDP session state machines, the payload catalog, and
//! metrics aggregation. `loadshear-cli` is the only thing that drives this end to end;
//! everything here is usable standalone by an embedder that wants to build its own
//! `Program` in memory instead of reading one from JSON.

pub mod action;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod net;
pub mod orchestrator;
pub mod payload;
pub mod resolve;
pub mod script;
pub mod shard;

pub use action::{ActionDescriptor, ActionType};
pub use error::LoadshearError;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use script::{LoweredProgram, Program};
