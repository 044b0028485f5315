//! Core data model: pipeline spec, registry view, compiled manifest

pub mod manifest;
pub mod registry;
pub mod spec;

pub use manifest::{Fingerprints, Manifest, ManifestMeta, ManifestStep};
pub use registry::{ComponentSpec, RegistryView};
pub use spec::{PipelineSpec, StepSpec};
