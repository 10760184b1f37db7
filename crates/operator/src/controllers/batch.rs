use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{ObjectKey, WatchCache},
    crd::{
        common::{LABEL_BATCH_NAME, LABEL_TEMPLATE_NAME},
        BatchPhase, JobBatch, JobBatchStatus, JobTemplate, Selector,
    },
    kubernetes::{
        resources::{batch_reference, creation_order, is_owned_by, template_name_of},
        child_manifest, child_phase, ResourceClient,
    },
    metrics,
    polling::{wait_for_resource, DEFAULT_POLL_INTERVAL},
    sinks::{publish, reasons, Notification, NotificationSink},
    Result,
};

/// Everything a reconciliation reads from or writes to.
pub struct Context {
    pub client: Arc<dyn ResourceClient>,
    pub batches: Arc<WatchCache<JobBatch>>,
    pub templates: Arc<WatchCache<JobTemplate>>,
    pub children: Arc<WatchCache<Pod>>,
    pub sink: Arc<dyn NotificationSink>,
    /// How long a freshly created child may take to show up in `children`
    pub child_sync_timeout: Duration,
}

/// The authoritative child per template plus the extras a creation race or an
/// earlier incarnation of the batch left behind
#[derive(Debug, Default)]
struct ChildIndex {
    by_template: BTreeMap<String, Arc<Pod>>,
    duplicates: Vec<Arc<Pod>>,
    /// Children controlled by a previous batch with the same name
    leftovers: Vec<Arc<Pod>>,
    /// Every non-terminal child, leftovers included, until it is gone
    non_terminal: i32,
}

impl ChildIndex {
    fn build(batch: &JobBatch, mut children: Vec<Arc<Pod>>) -> Self {
        children.sort_by(|a, b| creation_order(a, b));

        let mut index = ChildIndex::default();
        for child in children {
            if !child_phase(&child).is_terminal() {
                index.non_terminal += 1;
            }
            if !is_owned_by(&child, batch) {
                index.leftovers.push(child);
                continue;
            }
            let Some(template) = template_name_of(&child) else {
                continue;
            };
            if index.by_template.contains_key(template) {
                index.duplicates.push(child);
            } else {
                index.by_template.insert(template.to_string(), child);
            }
        }
        index
    }
}

/// Outcome tally over the selected templates
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    completed: usize,
    failed: usize,
}

fn summary(total: usize, tally: &Tally, failure_threshold: Option<i32>) -> String {
    let base = format!("Ran {} tests, {} failures", tally.completed, tally.failed);
    match failure_threshold {
        Some(n) if tally.completed < total => format!(
            "{} ({} skipped after exceeding maxFailures={})",
            base,
            total - tally.completed,
            n
        ),
        _ => base,
    }
}

/// Drive the batch identified by `key` one step towards completion.
///
/// Reads come from the watch caches. Returning an error hands the key back
/// to the work queue for a retry with backoff.
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<()> {
    let batch = match ctx.batches.get(&key.namespace, &key.name) {
        Some(batch) => batch,
        None => return cleanup(key, ctx).await,
    };

    if batch.is_complete() {
        debug!("JobBatch {} already complete", key);
        return Ok(());
    }

    let selector = match Selector::from_label_selector(batch.spec.selector.as_ref()) {
        Ok(selector) => selector,
        Err(e) => {
            warn!("JobBatch {} has an invalid selector: {}", key, e);
            let message = format!("invalid selector: {}", e);
            update_status(&batch, false, &message, ctx).await?;
            metrics::BATCHES_COMPLETED_TOTAL.with_label_values(&["invalid"]).inc();
            publish(
                ctx.sink.as_ref(),
                Notification::warning(batch_reference(&batch), reasons::BATCH_INVALID, message),
            )
            .await;
            return Ok(());
        }
    };

    let templates = ctx.templates.list(&key.namespace, &selector);
    let children = ctx.children.list(
        &key.namespace,
        &Selector::from_labels([(LABEL_BATCH_NAME, key.name.as_str())]),
    );
    let index = ChildIndex::build(&batch, children);
    remove_extras(&index.leftovers, "leftover", ctx).await;
    remove_extras(&index.duplicates, "duplicate", ctx).await;

    let mut tally = Tally::default();
    let mut undispatched = Vec::new();
    for template in &templates {
        match index.by_template.get(&template.name_any()) {
            Some(child) => {
                let phase = child_phase(child);
                if phase.is_terminal() {
                    tally.completed += 1;
                    if phase.is_failure() {
                        tally.failed += 1;
                    }
                }
            }
            None => undispatched.push(template.clone()),
        }
    }

    let threshold = batch.failure_threshold();
    let over_threshold = threshold.map_or(false, |n| tally.failed > n as usize);

    let mut slots = batch.slots() - index.non_terminal;
    if over_threshold {
        if !undispatched.is_empty() {
            info!(
                "JobBatch {} exceeded maxFailures ({} failed), not starting {} remaining templates",
                key,
                tally.failed,
                undispatched.len()
            );
        }
    } else {
        for template in &undispatched {
            if slots <= 0 {
                debug!("JobBatch {} has no free slots, deferring {}", key, template.name_any());
                break;
            }
            dispatch(&batch, template, ctx).await?;
            slots -= 1;
        }
    }

    let total = templates.len();
    let done = tally.completed == total || (over_threshold && index.non_terminal == 0);
    if !done {
        debug!(
            "JobBatch {} pending: {}/{} templates finished, {} running",
            key,
            tally.completed,
            total,
            batch.slots() - slots
        );
        return Ok(());
    }

    let success = tally.failed == 0 && tally.completed == total;
    let message = summary(total, &tally, if over_threshold { threshold } else { None });
    update_status(&batch, success, &message, ctx).await?;
    info!("JobBatch {} complete: {}", key, message);

    let (outcome, notification) = if success {
        (
            "succeeded",
            Notification::normal(batch_reference(&batch), reasons::BATCH_SUCCEEDED, message),
        )
    } else {
        (
            "failed",
            Notification::warning(batch_reference(&batch), reasons::BATCH_FAILED, message),
        )
    };
    metrics::BATCHES_COMPLETED_TOTAL.with_label_values(&[outcome]).inc();
    publish(ctx.sink.as_ref(), notification).await;

    Ok(())
}

/// The batch is gone; delete whatever children still carry its label.
async fn cleanup(key: &ObjectKey, ctx: &Context) -> Result<()> {
    let children = ctx.children.list(
        &key.namespace,
        &Selector::from_labels([(LABEL_BATCH_NAME, key.name.as_str())]),
    );
    if children.is_empty() {
        debug!("JobBatch {} deleted, no child jobs left", key);
        return Ok(());
    }

    info!("JobBatch {} deleted, removing {} child jobs", key, children.len());
    for child in children {
        ctx.client
            .delete_child(&key.namespace, &child.name_any())
            .await?;
    }
    Ok(())
}

async fn remove_extras(pods: &[Arc<Pod>], what: &str, ctx: &Context) {
    for pod in pods {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        warn!(
            "Removing {} child job {}/{} for template {}",
            what,
            namespace,
            name,
            template_name_of(pod).unwrap_or_default()
        );
        if let Err(e) = ctx.client.delete_child(&namespace, &name).await {
            warn!("Failed to delete {} child job {}/{}: {}", what, namespace, name, e);
        }
    }
}

/// Start the child job for `template` and wait until the cache has seen it.
async fn dispatch(batch: &JobBatch, template: &JobTemplate, ctx: &Context) -> Result<()> {
    let template_name = template.name_any();
    let manifest = child_manifest(batch, template);

    let child = match ctx.client.create_child(&manifest).await {
        Ok(created) => {
            metrics::CHILD_JOBS_CREATED_TOTAL.inc();
            publish(
                ctx.sink.as_ref(),
                Notification::normal(
                    batch_reference(batch),
                    reasons::CHILD_JOB_STARTED,
                    format!("Starting job for template {}", template_name),
                )
                .for_template(&template_name),
            )
            .await;
            created
        }
        Err(e) if e.is_already_exists() => match find_existing(batch, &template_name, ctx).await? {
            Some(existing) => {
                info!(
                    "Child job for template {} already exists as {}",
                    template_name,
                    existing.name_any()
                );
                existing
            }
            None => return Err(e),
        },
        Err(e) => {
            error!("Failed to create child job for template {}: {}", template_name, e);
            publish(
                ctx.sink.as_ref(),
                Notification::warning(
                    batch_reference(batch),
                    reasons::CHILD_JOB_CREATION_FAILED,
                    format!("Failed to start job for template {}: {}", template_name, e),
                )
                .for_template(&template_name),
            )
            .await;
            return Err(e);
        }
    };

    let namespace = child.namespace().unwrap_or_else(|| "default".to_string());
    let name = child.name_any();
    let children = ctx.children.clone();
    wait_for_resource(
        &format!("child job {}/{} to appear in cache", namespace, name),
        ctx.child_sync_timeout,
        DEFAULT_POLL_INTERVAL,
        || {
            let found = children.get(&namespace, &name).map(|_| ());
            async move { Ok::<_, crate::Error>(found) }
        },
    )
    .await
}

/// Re-read the children of `template` from the store after a lost creation race.
async fn find_existing(batch: &JobBatch, template_name: &str, ctx: &Context) -> Result<Option<Pod>> {
    let namespace = batch.namespace().unwrap_or_else(|| "default".to_string());
    let batch_name = batch.name_any();
    let query = Selector::from_labels([
        (LABEL_BATCH_NAME, batch_name.as_str()),
        (LABEL_TEMPLATE_NAME, template_name),
    ])
    .to_query()
    .unwrap_or_default();

    let mut existing = ctx.client.list_children(&namespace, &query).await?;
    existing.retain(|pod| is_owned_by(pod, batch));
    existing.sort_by(creation_order);
    Ok(existing.into_iter().next())
}

/// Write the terminal status. The cached resourceVersion travels with the
/// object, so a concurrent writer surfaces as a conflict.
async fn update_status(batch: &JobBatch, success: bool, message: &str, ctx: &Context) -> Result<()> {
    let mut updated = batch.clone();
    updated.status = Some(JobBatchStatus {
        phase: BatchPhase::Complete,
        success,
        message: message.to_string(),
    });
    ctx.client.replace_batch_status(&updated).await?;
    Ok(())
}
