//! Spec-to-manifest compiler: fingerprinting, parameter and secret
//! resolution, dynamic-shape expansion, deterministic graph ordering.

pub mod compile;
pub mod error;
pub mod expand;
pub mod fingerprint;
pub mod graph;
pub mod params;
pub mod secrets;

pub use compile::{compile, CompileOptions, TimestampPolicy, COMPILER_VERSION};
pub use error::CompileError;
pub use params::ResolvedParams;
pub use secrets::SecretKeySet;
