//! End-to-end convergence scenarios against an in-memory store.
//!
//! `FakeClient` applies every write straight into the watch caches, the way
//! an informer would deliver it, so each reconciliation sees the effects of
//! the previous one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Pod, PodStatus, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, Time};
use kube::api::ObjectMeta;
use kube::error::ErrorResponse;
use kube::ResourceExt;

use jobbatch_operator::{
    cache::{ChangeEvent, EventHandler, WatchCache},
    controllers::{self, Context},
    crd::{
        common::{LABEL_BATCH_NAME, LABEL_TEMPLATE_NAME},
        BatchPhase, JobBatch, JobBatchSpec, JobBatchStatus, JobTemplate, JobTemplateSpec, Selector,
    },
    kubernetes::{child_phase, ResourceClient},
    queue::{WorkKey, WorkQueue},
    router::EventRouter,
    sinks::{reasons, Notification, NotificationSink, NotificationType},
    Error, Result,
};

const NS: &str = "ci";

struct FakeClient {
    batches: Arc<WatchCache<JobBatch>>,
    children: Arc<WatchCache<Pod>>,
    router: Option<Arc<EventRouter>>,
    seq: AtomicI64,
    conflict_next_status: AtomicBool,
    status_writes: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl FakeClient {
    fn route<K>(&self, event: ChangeEvent<K>)
    where
        EventRouter: EventHandler<K>,
    {
        if let Some(router) = &self.router {
            EventHandler::<K>::handle(router.as_ref(), event);
        }
    }

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kubernetes(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} (fake)", reason),
            reason: reason.to_string(),
            code,
        }))
    }
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn create_child(&self, pod: &Pod) -> Result<Pod> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut created = pod.clone();
        let prefix = pod.metadata.generate_name.clone().unwrap_or_default();
        created.metadata.name = Some(format!("{}{:05}", prefix, n));
        created.metadata.uid = Some(format!("pod-uid-{}", n));
        created.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap()));
        created.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        let event = self.children.apply(created.clone())?;
        self.route(event);
        Ok(created)
    }

    async fn list_children(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let labels: Vec<(String, String)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(self
            .children
            .list(namespace, &Selector::from_labels(labels))
            .into_iter()
            .map(|p| p.as_ref().clone())
            .collect())
    }

    async fn delete_child(&self, namespace: &str, name: &str) -> Result<()> {
        if let Some(pod) = self.children.get(namespace, name) {
            let event = self.children.remove(pod.as_ref().clone())?;
            self.route(event);
            self.deleted.lock().unwrap().push(name.to_string());
        }
        Ok(())
    }

    async fn replace_batch_status(&self, batch: &JobBatch) -> Result<JobBatch> {
        if self.conflict_next_status.swap(false, Ordering::SeqCst) {
            return Err(Self::api_error(409, "Conflict"));
        }
        let namespace = batch.namespace().unwrap_or_default();
        let stored = self
            .batches
            .get(&namespace, &batch.name_any())
            .ok_or_else(|| Self::api_error(404, "NotFound"))?;
        if stored.resource_version() != batch.resource_version() {
            return Err(Self::api_error(409, "Conflict"));
        }

        let mut updated = stored.as_ref().clone();
        updated.status = batch.status.clone();
        let version: u64 = stored.resource_version().and_then(|v| v.parse().ok()).unwrap_or(0);
        updated.metadata.resource_version = Some((version + 1).to_string());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let event = self.batches.apply(updated.clone())?;
        self.route(event);
        Ok(updated)
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    fn reasons(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|n| n.reason.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// A sink whose backend is always down
struct BrokenSink;

#[async_trait]
impl NotificationSink for BrokenSink {
    fn name(&self) -> &str {
        "broken"
    }

    async fn send(&self, _notification: &Notification) -> Result<()> {
        Err(Error::Internal("events API unavailable".to_string()))
    }
}

struct Harness {
    ctx: Arc<Context>,
    client: Arc<FakeClient>,
    sink: Arc<RecordingSink>,
    templates: Arc<WatchCache<JobTemplate>>,
}

impl Harness {
    fn new() -> Self {
        Self::build(None, None)
    }

    fn build(router: Option<Arc<EventRouter>>, sink_override: Option<Arc<dyn NotificationSink>>) -> Self {
        let batches = Arc::new(WatchCache::new("JobBatch"));
        let templates = Arc::new(WatchCache::new("JobTemplate"));
        let children = Arc::new(WatchCache::new("Pod"));
        let client = Arc::new(FakeClient {
            batches: batches.clone(),
            children: children.clone(),
            router,
            seq: AtomicI64::new(0),
            conflict_next_status: AtomicBool::new(false),
            status_writes: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(RecordingSink::default());
        let ctx = Arc::new(Context {
            client: client.clone(),
            batches,
            templates: templates.clone(),
            children,
            sink: sink_override.unwrap_or_else(|| sink.clone() as Arc<dyn NotificationSink>),
            child_sync_timeout: Duration::from_secs(5),
        });
        Self {
            ctx,
            client,
            sink,
            templates,
        }
    }

    fn add_batch(&self, name: &str, selector: Option<LabelSelector>, max_concurrent: i32, max_failures: Option<i32>) {
        self.add_batch_with_uid(name, &format!("{}-uid", name), selector, max_concurrent, max_failures);
    }

    fn add_batch_with_uid(
        &self,
        name: &str,
        uid: &str,
        selector: Option<LabelSelector>,
        max_concurrent: i32,
        max_failures: Option<i32>,
    ) {
        let mut batch = JobBatch::new(
            name,
            JobBatchSpec {
                selector,
                max_concurrent,
                max_failures,
            },
        );
        batch.metadata.namespace = Some(NS.to_string());
        batch.metadata.uid = Some(uid.to_string());
        batch.metadata.resource_version = Some("1".to_string());
        let event = self.ctx.batches.apply(batch).unwrap();
        self.client.route(event);
    }

    fn delete_batch(&self, name: &str) {
        let batch = self.ctx.batches.get(NS, name).unwrap();
        let event = self.ctx.batches.remove(batch.as_ref().clone()).unwrap();
        self.client.route(event);
    }

    fn add_template(&self, name: &str, suite: &str) {
        let mut template = JobTemplate::new(
            name,
            JobTemplateSpec {
                template: PodTemplateSpec::default(),
            },
        );
        template.metadata.namespace = Some(NS.to_string());
        template.metadata.labels = Some(BTreeMap::from([("suite".to_string(), suite.to_string())]));
        let event = self.templates.apply(template).unwrap();
        self.client.route(event);
    }

    fn add_child(&self, name: &str, batch: &str, template: &str, phase: &str, created: i64) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                creation_timestamp: Some(Time(Utc.timestamp_opt(created, 0).unwrap())),
                labels: Some(BTreeMap::from([
                    (LABEL_BATCH_NAME.to_string(), batch.to_string()),
                    (LABEL_TEMPLATE_NAME.to_string(), template.to_string()),
                ])),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let event = self.ctx.children.apply(pod).unwrap();
        self.client.route(event);
    }

    /// Move the child of `template` to `phase`, as the kubelet would
    fn finish(&self, batch: &str, template: &str, phase: &str) {
        let pod = self
            .children_of(batch)
            .into_iter()
            .find(|p| p.labels().get(LABEL_TEMPLATE_NAME).map(String::as_str) == Some(template))
            .unwrap_or_else(|| panic!("no child for template {}", template));
        let mut updated = pod.as_ref().clone();
        updated.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        let event = self.ctx.children.apply(updated).unwrap();
        self.client.route(event);
    }

    fn children_of(&self, batch: &str) -> Vec<Arc<Pod>> {
        self.ctx
            .children
            .list(NS, &Selector::from_labels([(LABEL_BATCH_NAME, batch)]))
    }

    fn templates_started(&self, batch: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .children_of(batch)
            .iter()
            .filter_map(|p| p.labels().get(LABEL_TEMPLATE_NAME).cloned())
            .collect();
        names.sort();
        names
    }

    fn running(&self, batch: &str) -> usize {
        self.children_of(batch)
            .iter()
            .filter(|p| !child_phase(p).is_terminal())
            .count()
    }

    fn status(&self, batch: &str) -> Option<JobBatchStatus> {
        self.ctx.batches.get(NS, batch).and_then(|b| b.status.clone())
    }

    async fn reconcile(&self, batch: &str) -> Result<()> {
        controllers::sync(&WorkKey::batch(NS, batch), &self.ctx).await
    }
}

fn suite(name: &str) -> Option<LabelSelector> {
    Some(LabelSelector {
        match_labels: Some(BTreeMap::from([("suite".to_string(), name.to_string())])),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_bounded_concurrency_runs_all_templates() {
    let h = Harness::new();
    for t in ["t1", "t2", "t3"] {
        h.add_template(t, "smoke");
    }
    h.add_template("other", "nightly");
    h.add_batch("b1", suite("smoke"), 2, None);

    h.reconcile("b1").await.unwrap();
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2"]);
    assert_eq!(h.running("b1"), 2);
    assert_eq!(h.status("b1"), None);

    // Nothing changed: no third job may start.
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.children_of("b1").len(), 2);

    h.finish("b1", "t1", "Succeeded");
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2", "t3"]);
    assert_eq!(h.running("b1"), 2);

    h.finish("b1", "t2", "Succeeded");
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.status("b1"), None);

    h.finish("b1", "t3", "Succeeded");
    h.reconcile("b1").await.unwrap();

    let status = h.status("b1").unwrap();
    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(status.success);
    assert_eq!(status.message, "Ran 3 tests, 0 failures");

    assert_eq!(
        h.sink.reasons(),
        vec![
            reasons::CHILD_JOB_STARTED,
            reasons::CHILD_JOB_STARTED,
            reasons::CHILD_JOB_STARTED,
            reasons::BATCH_SUCCEEDED,
        ]
    );
}

#[tokio::test]
async fn test_child_jobs_carry_batch_identity() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_batch("b1", suite("smoke"), 1, None);
    h.reconcile("b1").await.unwrap();

    let child = h.children_of("b1").pop().unwrap();
    assert!(child.name_any().starts_with("t1-"));
    let owner = &child.owner_references()[0];
    assert_eq!(owner.name, "b1");
    assert_eq!(owner.uid, "b1-uid");
    assert_eq!(owner.controller, Some(true));

    let started = h.sink.sent.lock().unwrap()[0].clone();
    assert_eq!(started.message, "Starting job for template t1");
    assert_eq!(started.template_name, "t1");
    assert_eq!(started.involved_object.name.as_deref(), Some("b1"));
}

#[tokio::test]
async fn test_empty_selector_completes_immediately() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_batch("none", None, 1, None);
    h.add_batch("blank", Some(LabelSelector::default()), 1, None);

    for batch in ["none", "blank"] {
        h.reconcile(batch).await.unwrap();
        let status = h.status(batch).unwrap();
        assert_eq!(status.phase, BatchPhase::Complete);
        assert!(status.success);
        assert_eq!(status.message, "Ran 0 tests, 0 failures");
        assert!(h.children_of(batch).is_empty());
    }
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_template("t2", "smoke");
    h.add_batch("b1", suite("smoke"), 5, None);

    h.reconcile("b1").await.unwrap();
    let first: Vec<String> = h.children_of("b1").iter().map(|p| p.name_any()).collect();
    h.reconcile("b1").await.unwrap();
    let second: Vec<String> = h.children_of("b1").iter().map(|p| p.name_any()).collect();
    assert_eq!(first, second);

    h.finish("b1", "t1", "Succeeded");
    h.finish("b1", "t2", "Succeeded");
    h.reconcile("b1").await.unwrap();
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.client.status_writes.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.reasons().iter().filter(|r| *r == reasons::BATCH_SUCCEEDED).count(), 1);
}

#[tokio::test]
async fn test_any_failure_fails_the_batch() {
    let h = Harness::new();
    for t in ["t1", "t2", "t3"] {
        h.add_template(t, "smoke");
    }
    h.add_batch("b1", suite("smoke"), 3, None);
    h.reconcile("b1").await.unwrap();

    h.finish("b1", "t1", "Succeeded");
    h.finish("b1", "t2", "Failed");
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.status("b1"), None);

    h.finish("b1", "t3", "Unknown");
    h.reconcile("b1").await.unwrap();

    let status = h.status("b1").unwrap();
    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(!status.success);
    assert_eq!(status.message, "Ran 3 tests, 2 failures");

    let last = h.sink.sent.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.reason, reasons::BATCH_FAILED);
    assert_eq!(last.notification_type, NotificationType::Warning);
}

#[tokio::test]
async fn test_deleted_batch_cleans_up_children() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_template("t2", "smoke");
    h.add_batch("b1", suite("smoke"), 2, None);
    h.add_batch("b2", suite("smoke"), 1, None);
    h.reconcile("b1").await.unwrap();
    h.reconcile("b2").await.unwrap();
    h.finish("b1", "t1", "Succeeded");

    h.delete_batch("b1");
    h.reconcile("b1").await.unwrap();

    assert!(h.children_of("b1").is_empty());
    assert_eq!(h.client.deleted.lock().unwrap().len(), 2);
    assert_eq!(h.children_of("b2").len(), 1);

    // A second pass finds nothing left to do.
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.client.deleted.lock().unwrap().len(), 2);
}

fn owner_uids(h: &Harness, batch: &str) -> Vec<String> {
    h.children_of(batch)
        .iter()
        .map(|p| p.owner_references()[0].uid.clone())
        .collect()
}

#[tokio::test]
async fn test_recreated_batch_starts_over() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_template("t2", "smoke");
    h.add_batch("b1", suite("smoke"), 2, None);
    h.reconcile("b1").await.unwrap();
    h.finish("b1", "t1", "Failed");
    h.finish("b1", "t2", "Succeeded");
    h.reconcile("b1").await.unwrap();
    assert!(!h.status("b1").unwrap().success);
    let old: Vec<String> = h.children_of("b1").iter().map(|p| p.name_any()).collect();

    // Delete and re-create under the same name before the deletion is
    // reconciled, so both land on the same work key.
    h.delete_batch("b1");
    h.add_batch_with_uid("b1", "b1-uid-2", suite("smoke"), 2, None);
    let writes = h.client.status_writes.load(Ordering::SeqCst);
    h.reconcile("b1").await.unwrap();

    assert_eq!(h.status("b1"), None);
    assert_eq!(h.client.status_writes.load(Ordering::SeqCst), writes);
    let mut deleted = h.client.deleted.lock().unwrap().clone();
    deleted.sort();
    let mut expected = old.clone();
    expected.sort();
    assert_eq!(deleted, expected);
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2"]);
    assert_eq!(owner_uids(&h, "b1"), vec!["b1-uid-2", "b1-uid-2"]);

    h.finish("b1", "t1", "Succeeded");
    h.finish("b1", "t2", "Succeeded");
    h.reconcile("b1").await.unwrap();
    let status = h.status("b1").unwrap();
    assert!(status.success);
    assert_eq!(status.message, "Ran 2 tests, 0 failures");
}

#[tokio::test]
async fn test_running_leftover_holds_a_slot() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_batch("b1", suite("smoke"), 1, None);
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.running("b1"), 1);

    h.delete_batch("b1");
    h.add_batch_with_uid("b1", "b1-uid-2", suite("smoke"), 1, None);

    // The old child is deleted but still counted during this pass.
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.client.deleted.lock().unwrap().len(), 1);
    assert!(h.children_of("b1").is_empty());

    h.reconcile("b1").await.unwrap();
    assert_eq!(owner_uids(&h, "b1"), vec!["b1-uid-2"]);
    assert_eq!(h.running("b1"), 1);
}

#[tokio::test]
async fn test_duplicate_children_keep_the_earliest() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_template("t2", "smoke");
    h.add_batch("b1", suite("smoke"), 2, None);
    h.add_child("t1-late", "b1", "t1", "Running", 200);
    h.add_child("t1-early", "b1", "t1", "Running", 100);

    // Both duplicates occupy a slot during this pass, so t2 has to wait.
    h.reconcile("b1").await.unwrap();
    assert_eq!(*h.client.deleted.lock().unwrap(), vec!["t1-late".to_string()]);
    let names: Vec<String> = h.children_of("b1").iter().map(|p| p.name_any()).collect();
    assert_eq!(names, vec!["t1-early"]);

    h.reconcile("b1").await.unwrap();
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2"]);
}

#[tokio::test]
async fn test_max_failures_stops_dispatch() {
    let h = Harness::new();
    for t in ["t1", "t2", "t3", "t4"] {
        h.add_template(t, "smoke");
    }
    h.add_batch("b1", suite("smoke"), 2, Some(0));
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2"]);

    h.finish("b1", "t1", "Failed");
    h.reconcile("b1").await.unwrap();
    // Over the threshold: t3 is not started, and t2 is still running.
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2"]);
    assert_eq!(h.status("b1"), None);

    h.finish("b1", "t2", "Succeeded");
    h.reconcile("b1").await.unwrap();

    let status = h.status("b1").unwrap();
    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(!status.success);
    assert_eq!(
        status.message,
        "Ran 2 tests, 1 failures (2 skipped after exceeding maxFailures=0)"
    );
}

#[tokio::test]
async fn test_failures_within_threshold_keep_running() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_template("t2", "smoke");
    h.add_batch("b1", suite("smoke"), 1, Some(1));
    h.reconcile("b1").await.unwrap();

    h.finish("b1", "t1", "Failed");
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.templates_started("b1"), vec!["t1", "t2"]);

    h.finish("b1", "t2", "Succeeded");
    h.reconcile("b1").await.unwrap();
    assert_eq!(h.status("b1").unwrap().message, "Ran 2 tests, 1 failures");
}

#[tokio::test]
async fn test_invalid_selector_is_terminal() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_batch(
        "b1",
        Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "suite".to_string(),
                operator: "In".to_string(),
                values: Some(vec![]),
            }]),
            ..Default::default()
        }),
        1,
        None,
    );

    h.reconcile("b1").await.unwrap();
    let status = h.status("b1").unwrap();
    assert_eq!(status.phase, BatchPhase::Complete);
    assert!(!status.success);
    assert!(status.message.starts_with("invalid selector:"));
    assert!(h.children_of("b1").is_empty());
    assert_eq!(h.sink.reasons(), vec![reasons::BATCH_INVALID]);
}

#[tokio::test]
async fn test_status_conflict_is_retried() {
    let h = Harness::new();
    h.add_batch("b1", None, 1, None);
    h.client.conflict_next_status.store(true, Ordering::SeqCst);

    let err = h.reconcile("b1").await.unwrap_err();
    assert!(err.is_conflict());
    assert!(err.is_retryable());
    assert_eq!(h.status("b1"), None);

    h.reconcile("b1").await.unwrap();
    assert_eq!(h.status("b1").unwrap().phase, BatchPhase::Complete);
}

#[tokio::test]
async fn test_sink_failures_do_not_block_convergence() {
    let h = Harness::build(None, Some(Arc::new(BrokenSink)));
    h.add_template("t1", "smoke");
    h.add_batch("b1", suite("smoke"), 1, None);

    h.reconcile("b1").await.unwrap();
    h.finish("b1", "t1", "Succeeded");
    h.reconcile("b1").await.unwrap();
    assert!(h.status("b1").unwrap().success);
}

#[tokio::test]
async fn test_child_status_notifications() {
    let h = Harness::new();
    h.add_template("t1", "smoke");
    h.add_batch("b1", suite("smoke"), 1, None);
    h.reconcile("b1").await.unwrap();
    h.finish("b1", "t1", "Failed");

    let pod = h.children_of("b1").pop().unwrap();
    controllers::sync(&WorkKey::child_status(NS, pod.name_any()), &h.ctx)
        .await
        .unwrap();

    let last = h.sink.sent.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.reason, reasons::CHILD_JOB_FAILED);
    assert_eq!(
        last.message,
        format!("Child job '{}' exited with status 'Failed'", pod.name_any())
    );
}

/// Workers, router and queue together: the batch converges with nobody
/// calling reconcile directly.
#[tokio::test(start_paused = true)]
async fn test_workers_converge_through_the_queue() {
    let queue: WorkQueue<WorkKey> = WorkQueue::default();
    let router = Arc::new(EventRouter::new(queue.clone()));
    let h = Harness::build(Some(router), None);

    let workers: Vec<_> = (0..2)
        .map(|id| tokio::spawn(controllers::run_worker(id, queue.clone(), h.ctx.clone())))
        .collect();

    for t in ["t1", "t2", "t3"] {
        h.add_template(t, "smoke");
    }
    h.add_batch("b1", suite("smoke"), 2, None);

    let mut max_running = 0;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        max_running = max_running.max(h.running("b1"));
        if h.status("b1").is_some() {
            break;
        }
        // Let every started job succeed.
        let pending: Vec<String> = h
            .children_of("b1")
            .iter()
            .filter(|p| !child_phase(p).is_terminal())
            .filter_map(|p| p.labels().get(LABEL_TEMPLATE_NAME).cloned())
            .collect();
        for template in pending {
            h.finish("b1", &template, "Succeeded");
        }
    }

    let status = h.status("b1").expect("batch never completed");
    assert!(status.success);
    assert_eq!(status.message, "Ran 3 tests, 0 failures");
    assert!(max_running <= 2);

    // One terminal-status notification per child on top of dispatch and completion.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = h.sink.reasons();
    assert_eq!(sent.iter().filter(|r| *r == reasons::CHILD_JOB_SUCCEEDED).count(), 3);
    assert_eq!(sent.iter().filter(|r| *r == reasons::BATCH_SUCCEEDED).count(), 1);

    queue.shut_down();
    for worker in workers {
        worker.await.unwrap();
    }
}
