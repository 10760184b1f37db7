//! In-memory mirrors of the watched resource kinds.
//!
//! A [`WatchCache`] holds the last observed state of every object of one kind
//! and turns each mutation into a [`ChangeEvent`]. The [`informer`] module keeps
//! a cache current from a watch stream plus a periodic full list, and hands the
//! resulting events to an [`EventHandler`].

pub mod informer;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kube::{Resource, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::crd::Selector;
use crate::{Error, Result};

pub use informer::Informer;

/// Namespace and name of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_object<K: Resource>(obj: &K) -> Result<Self> {
        let name = obj
            .meta()
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidObject("object has no name".to_string()))?;
        Ok(Self {
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(ObjectKey::new(ns, name))
            }
            _ => Err(Error::InvalidKey(format!("'{}' is not of the form namespace/name", s))),
        }
    }
}

/// A change to one cached object
#[derive(Debug)]
pub enum ChangeEvent<K> {
    Added(Arc<K>),
    Modified { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> ChangeEvent<K> {
    /// The current (or, for deletions, last known) state of the object
    pub fn object(&self) -> &K {
        match self {
            ChangeEvent::Added(obj) => obj,
            ChangeEvent::Modified { new, .. } => new,
            ChangeEvent::Deleted(obj) => obj,
        }
    }
}

/// Receives every change applied to a [`WatchCache`].
pub trait EventHandler<K>: Send + Sync {
    fn handle(&self, event: ChangeEvent<K>);
}

pub struct WatchCache<K> {
    kind: &'static str,
    objects: RwLock<HashMap<ObjectKey, Arc<K>>>,
    synced: watch::Sender<bool>,
}

impl<K> WatchCache<K>
where
    K: Resource + Clone,
{
    pub fn new(kind: &'static str) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            objects: RwLock::new(HashMap::new()),
            synced,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.read().get(&ObjectKey::new(namespace, name)).cloned()
    }

    /// Objects in `namespace` whose labels match `selector`, ordered by name
    pub fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        let mut matched: Vec<(ObjectKey, Arc<K>)> = self
            .read()
            .iter()
            .filter(|(key, obj)| key.namespace == namespace && selector.matches(obj.labels()))
            .map(|(key, obj)| (key.clone(), obj.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        matched.into_iter().map(|(_, obj)| obj).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn mark_synced(&self) {
        if !self.synced.send_replace(true) {
            debug!(kind = self.kind, objects = self.len(), "Watch cache synced");
        }
    }

    /// Resolves once the initial list has been loaded
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Whether `obj` is older than what the cache already holds.
    ///
    /// A resync can overtake watch events that were already buffered; those
    /// carry a lower resourceVersion and must not roll the cache back.
    /// Versions that are not plain integers are never considered stale.
    pub fn is_stale(&self, obj: &K) -> bool {
        let Ok(key) = ObjectKey::from_object(obj) else {
            return false;
        };
        let Some(cached) = self.get(&key.namespace, &key.name) else {
            return false;
        };
        match (resource_version(cached.as_ref()), resource_version(obj)) {
            (Some(have), Some(incoming)) => incoming < have,
            _ => false,
        }
    }

    /// Insert or overwrite an object
    pub fn apply(&self, obj: K) -> Result<ChangeEvent<K>> {
        let key = ObjectKey::from_object(&obj)?;
        let new = Arc::new(obj);
        let old = self.write().insert(key, new.clone());
        Ok(match old {
            Some(old) => ChangeEvent::Modified { old, new },
            None => ChangeEvent::Added(new),
        })
    }

    /// Remove an object; the event carries its final state
    pub fn remove(&self, obj: K) -> Result<ChangeEvent<K>> {
        let key = ObjectKey::from_object(&obj)?;
        self.write().remove(&key);
        Ok(ChangeEvent::Deleted(Arc::new(obj)))
    }

    /// Replace the whole contents with a fresh list, emitting the difference.
    ///
    /// Objects that are listed again unchanged still produce a `Modified`
    /// event; filtering those out is the handler's job.
    pub fn replace(&self, objs: Vec<K>) -> Vec<ChangeEvent<K>> {
        let mut incoming = HashMap::with_capacity(objs.len());
        for obj in objs {
            match ObjectKey::from_object(&obj) {
                Ok(key) => {
                    incoming.insert(key, Arc::new(obj));
                }
                Err(e) => error!(kind = self.kind, error = %e, "Dropping unparseable object from list"),
            }
        }

        let mut objects = self.write();
        let mut events = Vec::new();
        for (key, old) in objects.iter() {
            if !incoming.contains_key(key) {
                events.push(ChangeEvent::Deleted(old.clone()));
            }
        }
        for (key, new) in incoming.iter() {
            match objects.get(key) {
                Some(old) => events.push(ChangeEvent::Modified {
                    old: old.clone(),
                    new: new.clone(),
                }),
                None => events.push(ChangeEvent::Added(new.clone())),
            }
        }
        *objects = incoming;
        events
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn resource_version<K: Resource>(obj: &K) -> Option<u64> {
    obj.meta().resource_version.as_deref()?.parse().ok()
}
