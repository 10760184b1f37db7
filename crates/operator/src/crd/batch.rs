use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "jobbatch.dev",
    version = "v1alpha1",
    kind = "JobBatch",
    shortname = "jb",
    namespaced,
    status = "JobBatchStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Success","type":"boolean","jsonPath":".status.success"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#
)]
pub struct JobBatchSpec {
    /// Selects the JobTemplates to run. An absent or empty selector selects nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Maximum number of child jobs running at the same time
    #[serde(rename = "maxConcurrent", default = "default_max_concurrent")]
    pub max_concurrent: i32,

    /// Number of failed child jobs tolerated before no further jobs are started
    #[serde(rename = "maxFailures", default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<i32>,
}

fn default_max_concurrent() -> i32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
pub enum BatchPhase {
    #[default]
    Pending,
    Complete,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPhase::Pending => write!(f, "Pending"),
            BatchPhase::Complete => write!(f, "Complete"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct JobBatchStatus {
    /// Pending until every selected template has a terminal child job
    #[serde(default)]
    pub phase: BatchPhase,

    /// True when the batch completed without failed child jobs
    #[serde(default)]
    pub success: bool,

    /// Human readable summary
    #[serde(default)]
    pub message: String,
}

impl JobBatch {
    pub fn is_complete(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == BatchPhase::Complete)
            .unwrap_or(false)
    }

    /// Concurrency budget; a misconfigured value below one still lets a single job run.
    pub fn slots(&self) -> i32 {
        self.spec.max_concurrent.max(1)
    }

    pub fn failure_threshold(&self) -> Option<i32> {
        self.spec.max_failures.map(|n| n.max(0))
    }
}
