use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, WatchStreamExt},
    Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{EventHandler, WatchCache};
use crate::Result;

/// Keeps a [`WatchCache`] current and forwards every change to a handler.
///
/// The watch stream handles resumption and relisting after compaction; the
/// periodic full list additionally repairs anything the stream missed.
pub struct Informer<K>
where
    K: Resource + Clone,
{
    api: Api<K>,
    cache: Arc<WatchCache<K>>,
    resync_period: Duration,
    label_selector: Option<String>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, cache: Arc<WatchCache<K>>, resync_period: Duration) -> Self {
        Self {
            api,
            cache,
            resync_period,
            label_selector: None,
        }
    }

    /// Only mirror objects matching this label selector
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub async fn run(self, handler: Arc<dyn EventHandler<K>>, mut shutdown: watch::Receiver<bool>) {
        let kind = self.cache.kind();
        info!(kind, resync = ?self.resync_period, "Starting informer");

        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }
        let stream = watcher(self.api.clone(), config).default_backoff();
        tokio::pin!(stream);

        let mut resync = tokio::time::interval(self.resync_period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the initial list comes from the watcher.
        resync.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => apply_watch_event(&self.cache, event, handler.as_ref()),
                    Some(Err(e)) => warn!(kind, error = %e, "Watch stream error, backing off"),
                    None => {
                        error!(kind, "Watch stream ended");
                        break;
                    }
                },
                _ = resync.tick() => {
                    if self.cache.has_synced() {
                        if let Err(e) = self.resync(handler.as_ref()).await {
                            warn!(kind, error = %e, "Periodic resync failed");
                        }
                    }
                }
            }
        }

        info!(kind, "Informer stopped");
    }

    async fn resync(&self, handler: &dyn EventHandler<K>) -> Result<()> {
        let mut params = ListParams::default();
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }
        let list = self.api.list(&params).await?;
        debug!(kind = self.cache.kind(), count = list.items.len(), "Resyncing from full list");
        apply_list(&self.cache, list.items, handler);
        Ok(())
    }
}

/// Fold one watch event into `cache` and pass the resulting change on.
///
/// A `Restarted` list replaces the whole cache and marks it synced. Single
/// object events older than the cached copy are dropped.
pub fn apply_watch_event<K>(cache: &WatchCache<K>, event: watcher::Event<K>, handler: &dyn EventHandler<K>)
where
    K: Resource + Clone,
{
    let kind = cache.kind();
    match event {
        watcher::Event::Applied(obj) | watcher::Event::Deleted(obj) if cache.is_stale(&obj) => {
            debug!(
                kind,
                name = obj.meta().name.as_deref().unwrap_or_default(),
                "Skipping watch event older than the cached object"
            );
        }
        watcher::Event::Applied(obj) => match cache.apply(obj) {
            Ok(change) => handler.handle(change),
            Err(e) => error!(kind, error = %e, "Dropping unparseable object"),
        },
        watcher::Event::Deleted(obj) => match cache.remove(obj) {
            Ok(change) => handler.handle(change),
            Err(e) => error!(kind, error = %e, "Dropping unparseable object"),
        },
        watcher::Event::Restarted(objs) => {
            debug!(kind, count = objs.len(), "Watch (re)listed");
            apply_list(cache, objs, handler);
            cache.mark_synced();
        }
    }
}

/// Replace the contents of `cache` with a full list and pass on the difference.
pub fn apply_list<K>(cache: &WatchCache<K>, objs: Vec<K>, handler: &dyn EventHandler<K>)
where
    K: Resource + Clone,
{
    for event in cache.replace(objs) {
        handler.handle(event);
    }
}
