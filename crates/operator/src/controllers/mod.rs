pub mod batch;
pub mod child;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{informer::Informer, WatchCache},
    config::Config,
    crd::{common::LABEL_BATCH_NAME, JobBatch, JobTemplate},
    kubernetes::{KubeResourceClient, ResourceClient},
    metrics,
    queue::{WorkKey, WorkQueue},
    router::EventRouter,
    sinks::NotificationSink,
    Result,
};

pub use batch::Context;

/// Route a work key to the handler for its kind.
pub async fn sync(key: &WorkKey, ctx: &Context) -> Result<()> {
    match key {
        WorkKey::Batch(batch) => batch::reconcile(batch, ctx).await,
        WorkKey::ChildStatus(child) => child::notify_status(child, ctx).await,
    }
}

/// Pull keys until the queue shuts down.
///
/// The queue owns retries: retryable failures go back with backoff, anything
/// else is logged and dropped.
pub async fn run_worker(id: usize, queue: WorkQueue<WorkKey>, ctx: Arc<Context>) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        match sync(&key, &ctx).await {
            Ok(()) => {
                metrics::RECONCILE_TOTAL.with_label_values(&["success"]).inc();
                queue.forget(&key);
            }
            Err(e) if e.is_retryable() => {
                metrics::RECONCILE_TOTAL.with_label_values(&["retry"]).inc();
                warn!(
                    worker = id,
                    %key,
                    attempt = queue.num_requeues(&key) + 1,
                    error = %e,
                    "Reconciliation failed, retrying with backoff"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                metrics::RECONCILE_TOTAL.with_label_values(&["dropped"]).inc();
                error!(worker = id, %key, error = %e, "Dropping key after permanent error");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

pub struct BatchController {
    client: Client,
    config: Config,
    sink: Arc<dyn NotificationSink>,
}

impl BatchController {
    pub fn new(client: Client, config: Config, sink: Arc<dyn NotificationSink>) -> Self {
        Self { client, config, sink }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.config.controller.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let controller = &self.config.controller;
        info!(
            namespace = controller.namespace.as_deref().unwrap_or("<all>"),
            workers = controller.workers,
            "Starting JobBatch controller"
        );

        let queue: WorkQueue<WorkKey> =
            WorkQueue::new(self.config.queue.backoff_min, self.config.queue.backoff_max);
        let router = Arc::new(EventRouter::new(queue.clone()));

        let batches = Arc::new(WatchCache::<JobBatch>::new("JobBatch"));
        let templates = Arc::new(WatchCache::<JobTemplate>::new("JobTemplate"));
        let children = Arc::new(WatchCache::<Pod>::new("Pod"));

        let informers = vec![
            spawn_informer(
                Informer::new(self.api(), batches.clone(), controller.resync_period),
                router.clone(),
                shutdown.clone(),
            ),
            spawn_informer(
                Informer::new(self.api(), templates.clone(), controller.resync_period),
                router.clone(),
                shutdown.clone(),
            ),
            spawn_informer(
                Informer::new(self.api(), children.clone(), controller.resync_period)
                    .with_label_selector(LABEL_BATCH_NAME),
                router.clone(),
                shutdown.clone(),
            ),
        ];

        tokio::select! {
            _ = wait_for_caches(&batches, &templates, &children) => info!(
                batches = batches.len(),
                templates = templates.len(),
                children = children.len(),
                "Caches synced"
            ),
            _ = shutdown.changed() => {
                info!("Shutdown requested before caches synced");
                queue.shut_down();
                join_all(informers).await;
                return Ok(());
            }
        }

        let ctx = Arc::new(Context {
            client: Arc::new(KubeResourceClient::new(self.client.clone())) as Arc<dyn ResourceClient>,
            batches,
            templates,
            children,
            sink: self.sink.clone(),
            child_sync_timeout: controller.child_sync_timeout,
        });

        let workers: Vec<_> = (0..controller.workers)
            .map(|id| tokio::spawn(run_worker(id, queue.clone(), ctx.clone())))
            .collect();

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down JobBatch controller");
        queue.shut_down();
        join_all(workers).await;
        join_all(informers).await;
        info!("Final metrics:\n{}", metrics::gather_metrics());
        Ok(())
    }
}

/// Resolves once every watched kind has completed its initial list.
async fn wait_for_caches(
    batches: &WatchCache<JobBatch>,
    templates: &WatchCache<JobTemplate>,
    children: &WatchCache<Pod>,
) {
    tokio::join!(
        batches.wait_for_sync(),
        templates.wait_for_sync(),
        children.wait_for_sync()
    );
}

fn spawn_informer<K>(
    informer: Informer<K>,
    router: Arc<EventRouter>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    EventRouter: crate::cache::EventHandler<K>,
{
    tokio::spawn(informer.run(router, shutdown))
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Task panicked");
        }
    }
}
