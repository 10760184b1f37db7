use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reusable pod template. Batches select templates by label; a template is
/// only read at the moment a child job is created from it.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "jobbatch.dev",
    version = "v1alpha1",
    kind = "JobTemplate",
    shortname = "jt",
    namespaced,
    derive = "PartialEq"
)]
pub struct JobTemplateSpec {
    /// Pod metadata and spec used for every child job created from this template
    pub template: PodTemplateSpec,
}
