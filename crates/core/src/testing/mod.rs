//! Shared test utilities for plamo2-core.
//!
//! Tiny configurations and synthetic checkpoints in the published tensor
//! layout, and an in-process tensor-parallel group, for integration tests
//! and benches.

mod checkpoint;
mod threaded;
mod tiny_config;

pub use checkpoint::{synthetic_checkpoint, tokens};
pub use threaded::{ThreadedCommunicator, ThreadedGroup};
pub use tiny_config::{tiny_plamo2_config, tiny_plamo2_runtime};
