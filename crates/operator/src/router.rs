//! Maps cache change events to work keys.
//!
//! Key derivation is kept in pure functions so the routing rules can be
//! tested without a queue or an API server.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error};

use crate::cache::{ChangeEvent, EventHandler, ObjectKey};
use crate::crd::common::ANNOTATION_OWNER;
use crate::crd::{JobBatch, JobTemplate};
use crate::kubernetes::resources::{child_phase, ChildPhase};
use crate::queue::{WorkKey, WorkQueue};
use crate::Result;

/// Keys for a JobBatch change. Updates that leave the object unchanged (a
/// resync re-listing it) produce nothing.
pub fn batch_keys(event: &ChangeEvent<JobBatch>) -> Result<Vec<WorkKey>> {
    if let ChangeEvent::Modified { old, new } = event {
        if old == new {
            return Ok(vec![]);
        }
    }
    let key = ObjectKey::from_object(event.object())?;
    Ok(vec![WorkKey::Batch(key)])
}

/// Keys for a child job change.
///
/// Every change re-triggers the owning batch. A transition into a terminal
/// phase additionally emits a one-off status key for that child. Pods without
/// the owner annotation are not ours and are ignored.
pub fn child_keys(event: &ChangeEvent<Pod>) -> Result<Vec<WorkKey>> {
    if let ChangeEvent::Modified { old, new } = event {
        if old == new {
            return Ok(vec![]);
        }
    }

    let pod = event.object();
    let owner = match pod.annotations().get(ANNOTATION_OWNER) {
        Some(owner) => owner,
        None => return Ok(vec![]),
    };
    let batch: ObjectKey = owner.parse()?;
    let mut keys = vec![WorkKey::Batch(batch)];

    if let ChangeEvent::Modified { old, new } = event {
        let before = child_phase(old);
        let after = child_phase(new);
        if !before.is_terminal() && after.is_terminal() {
            debug!(
                pod = %new.name_any(),
                from = %before,
                to = %after,
                "Child job reached a terminal phase"
            );
            keys.push(WorkKey::ChildStatus(ObjectKey::from_object(new.as_ref())?));
        }
    }

    Ok(keys)
}

/// Template changes never enqueue work: already dispatched jobs keep the
/// template content they were created from.
pub fn template_keys(event: &ChangeEvent<JobTemplate>) -> Result<Vec<WorkKey>> {
    let kind = match event {
        ChangeEvent::Added(_) => "added",
        ChangeEvent::Modified { .. } => "updated",
        ChangeEvent::Deleted(_) => "deleted",
    };
    debug!(
        template = %ObjectKey::from_object(event.object())?,
        kind,
        "JobTemplate changed (not triggering reconciliation)"
    );
    Ok(vec![])
}

/// Feeds the work queue from the three watch caches.
pub struct EventRouter {
    queue: WorkQueue<WorkKey>,
}

impl EventRouter {
    pub fn new(queue: WorkQueue<WorkKey>) -> Self {
        Self { queue }
    }

    fn enqueue(&self, kind: &str, keys: Result<Vec<WorkKey>>) {
        match keys {
            Ok(keys) => {
                for key in keys {
                    debug!(%key, "Enqueueing");
                    self.queue.add(key);
                }
            }
            Err(e) => error!(kind, error = %e, "Dropping event for invalid object"),
        }
    }
}

impl EventHandler<JobBatch> for EventRouter {
    fn handle(&self, event: ChangeEvent<JobBatch>) {
        self.enqueue("JobBatch", batch_keys(&event));
    }
}

impl EventHandler<Pod> for EventRouter {
    fn handle(&self, event: ChangeEvent<Pod>) {
        self.enqueue("Pod", child_keys(&event));
    }
}

impl EventHandler<JobTemplate> for EventRouter {
    fn handle(&self, event: ChangeEvent<JobTemplate>) {
        self.enqueue("JobTemplate", template_keys(&event));
    }
}
