extern crate anyhow;

// Rexport main API
pub use config::Config;
pub use device::FramedPort;
pub use protocol::Frame;
pub use sampler::{Outcome, Sampler, SamplerConfig, Shutdown};

pub mod config;
pub mod device;
pub mod devices;
pub mod output;
pub mod protocol;
pub mod sampler;

/// Rexports all error types
pub mod error {
    pub use crate::config::error::*;
    pub use crate::device::error::*;
    pub use crate::output::error::*;
    pub use crate::protocol::error::*;
}
