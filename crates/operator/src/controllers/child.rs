use kube::ResourceExt;
use tracing::debug;

use super::batch::Context;
use crate::{
    cache::ObjectKey,
    crd::common::LABEL_BATCH_NAME,
    kubernetes::{
        resources::{batch_reference, is_owned_by, template_name_of},
        child_phase, ChildPhase,
    },
    sinks::{publish, reasons, Notification},
    Result,
};

/// Publish the one-off notification for a child job that just finished.
///
/// Nothing here feeds back into convergence, so a child or batch that has
/// disappeared in the meantime is simply skipped.
pub async fn notify_status(key: &ObjectKey, ctx: &Context) -> Result<()> {
    let Some(pod) = ctx.children.get(&key.namespace, &key.name) else {
        debug!("Child job {} no longer cached, skipping status notification", key);
        return Ok(());
    };
    let Some(batch_name) = pod.labels().get(LABEL_BATCH_NAME) else {
        debug!("Child job {} has no batch label", key);
        return Ok(());
    };
    let Some(batch) = ctx.batches.get(&key.namespace, batch_name) else {
        debug!("Batch {}/{} for child job {} is gone", key.namespace, batch_name, key);
        return Ok(());
    };
    if !is_owned_by(&pod, &batch) {
        debug!("Child job {} belongs to an earlier batch {}/{}", key, key.namespace, batch_name);
        return Ok(());
    }

    let phase = child_phase(&pod);
    let message = format!("Child job '{}' exited with status '{}'", pod.name_any(), phase);
    let reference = batch_reference(&batch);
    let notification = match phase {
        ChildPhase::Succeeded => Notification::normal(reference, reasons::CHILD_JOB_SUCCEEDED, message),
        ChildPhase::Failed => Notification::warning(reference, reasons::CHILD_JOB_FAILED, message),
        ChildPhase::Unknown => Notification::warning(reference, reasons::CHILD_JOB_ERROR, message),
        ChildPhase::Pending | ChildPhase::Running => return Ok(()),
    };
    let notification = match template_name_of(&pod) {
        Some(template) => notification.for_template(template),
        None => notification,
    };

    publish(ctx.sink.as_ref(), notification).await;
    Ok(())
}
