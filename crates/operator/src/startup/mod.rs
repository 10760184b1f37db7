//! Startup utilities run before the controller begins watching.

pub mod crds;

pub use crds::{all_crds, ensure_crds, is_established, names_conflict};
