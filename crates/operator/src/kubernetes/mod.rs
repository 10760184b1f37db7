pub mod client;
pub mod resources;

pub use client::{KubeResourceClient, ResourceClient};
pub use resources::{child_manifest, child_phase, ChildPhase};
