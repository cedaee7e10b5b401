//! Capability detection and feedback

mod detector;
pub mod profiles;

pub use detector::CapabilityDetector;
