//! PLaMo-2 hybrid attention / state-space decoder on candle.
//!
//! - [`config`] - model `config.json` and deployment settings
//! - [`models::plamo2`] - layer schedule, mixers, decoder stack, LM head
//! - [`ssm`] - causal conv and selective scan kernels, recurrent state cache
//! - [`loader`] - checkpoint translation and sharded hydration
//! - [`distributed`] - tensor/pipeline parallel layers and transport

pub mod config;
pub mod distributed;
pub mod forward_context;
pub mod layers;
pub mod loader;
pub mod models;
pub mod ssm;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
