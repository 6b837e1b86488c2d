//! State-space (Mamba) building blocks.
//!
//! Recurrent layers keep per-slot conv and SSM rows instead of a KV cache.
//! The conv and scan kernels each come in a varlen prefill form and a
//! batched decode form that share the same per-step arithmetic.

pub mod causal_conv1d;
pub mod selective_scan;
pub mod state;

pub use causal_conv1d::{causal_conv1d_decode, causal_conv1d_prefill, causal_conv1d_update};
pub use selective_scan::{
    selective_scan_decode, selective_scan_prefill, softplus, ssm_step, ScanInputs, ScanParams,
};
pub use state::{MambaLayerState, MambaStateCache, StateCacheError};
