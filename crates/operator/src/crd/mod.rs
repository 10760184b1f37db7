pub mod batch;
pub mod common;
pub mod selector;
pub mod template;

pub use batch::{BatchPhase, JobBatch, JobBatchSpec, JobBatchStatus};
pub use selector::Selector;
pub use template::{JobTemplate, JobTemplateSpec};
