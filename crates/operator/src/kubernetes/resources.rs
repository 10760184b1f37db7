use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::common::{ANNOTATION_OWNER, LABEL_BATCH_NAME, LABEL_TEMPLATE_NAME};
use crate::crd::{JobBatch, JobTemplate};

/// Lifecycle phase of a child job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl ChildPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChildPhase::Succeeded | ChildPhase::Failed | ChildPhase::Unknown)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ChildPhase::Failed | ChildPhase::Unknown)
    }
}

impl fmt::Display for ChildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildPhase::Pending => write!(f, "Pending"),
            ChildPhase::Running => write!(f, "Running"),
            ChildPhase::Succeeded => write!(f, "Succeeded"),
            ChildPhase::Failed => write!(f, "Failed"),
            ChildPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<&str> for ChildPhase {
    fn from(s: &str) -> Self {
        match s {
            "Running" => ChildPhase::Running,
            "Succeeded" => ChildPhase::Succeeded,
            "Failed" => ChildPhase::Failed,
            "Unknown" => ChildPhase::Unknown,
            _ => ChildPhase::Pending,
        }
    }
}

/// Phase of a child pod; a pod the kubelet has not reported on yet is Pending.
pub fn child_phase(pod: &Pod) -> ChildPhase {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(ChildPhase::from)
        .unwrap_or(ChildPhase::Pending)
}

pub fn template_name_of(pod: &Pod) -> Option<&str> {
    pod.labels().get(LABEL_TEMPLATE_NAME).map(String::as_str)
}

/// UID of the object that controls `pod`, if any
pub fn controller_uid(pod: &Pod) -> Option<&str> {
    pod.owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.as_str())
}

/// Whether `pod` belongs to this incarnation of `batch`.
///
/// A batch that was deleted and re-created keeps its name but gets a new
/// UID, so children left behind by the old one carry a stale controller
/// reference. Pods without a controller reference are matched by label only.
pub fn is_owned_by(pod: &Pod, batch: &JobBatch) -> bool {
    match (controller_uid(pod), batch.uid()) {
        (Some(owner), Some(uid)) => owner == uid,
        _ => true,
    }
}

/// Ordering used to pick the authoritative child when a template has more
/// than one: earliest creation first, name as the tie breaker.
pub fn creation_order(a: &Pod, b: &Pod) -> std::cmp::Ordering {
    let ts = |p: &Pod| p.creation_timestamp().map(|t| t.0);
    ts(a).cmp(&ts(b)).then_with(|| a.name_any().cmp(&b.name_any()))
}

pub fn batch_reference(batch: &JobBatch) -> ObjectReference {
    let mut reference = batch.object_ref(&());
    if reference.namespace.is_none() {
        reference.namespace = Some("default".to_string());
    }
    reference
}

fn owner_reference(batch: &JobBatch) -> OwnerReference {
    OwnerReference {
        api_version: JobBatch::api_version(&()).to_string(),
        kind: JobBatch::kind(&()).to_string(),
        name: batch.name_any(),
        uid: batch.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build the child pod that runs `template` on behalf of `batch`.
///
/// The pod inherits the template's metadata and spec; the batch labels and
/// owner annotation are layered on top so they always win.
pub fn child_manifest(batch: &JobBatch, template: &JobTemplate) -> Pod {
    let namespace = batch.namespace().unwrap_or_else(|| "default".to_string());
    let template_meta = template.spec.template.metadata.clone().unwrap_or_default();

    let mut labels: BTreeMap<String, String> = template_meta.labels.unwrap_or_default();
    labels.insert(LABEL_BATCH_NAME.to_string(), batch.name_any());
    labels.insert(LABEL_TEMPLATE_NAME.to_string(), template.name_any());

    let mut annotations: BTreeMap<String, String> = template_meta.annotations.unwrap_or_default();
    annotations.insert(
        ANNOTATION_OWNER.to_string(),
        format!("{}/{}", namespace, batch.name_any()),
    );

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", template.name_any())),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(batch)]),
            ..Default::default()
        },
        spec: template.spec.template.spec.clone(),
        status: None,
    }
}
