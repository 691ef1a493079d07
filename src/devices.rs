//! Sensors speaking to us over IO devices.

pub use sgp30::{Register, Sample, Sgp30Frame};

pub mod sgp30;
