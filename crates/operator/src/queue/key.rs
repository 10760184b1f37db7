use std::fmt;
use std::str::FromStr;

use crate::cache::ObjectKey;
use crate::{Error, Result};

const BATCH_PREFIX: &str = "batch";
const CHILD_STATUS_PREFIX: &str = "podstatus";

/// Unit of work on the queue. Two events producing equal keys collapse into
/// one queued item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKey {
    /// Reconcile the JobBatch with this key
    Batch(ObjectKey),
    /// Publish the terminal status of the child job with this key
    ChildStatus(ObjectKey),
}

impl WorkKey {
    pub fn batch(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        WorkKey::Batch(ObjectKey::new(namespace, name))
    }

    pub fn child_status(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        WorkKey::ChildStatus(ObjectKey::new(namespace, name))
    }

    pub fn object_key(&self) -> &ObjectKey {
        match self {
            WorkKey::Batch(key) | WorkKey::ChildStatus(key) => key,
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::Batch(key) => write!(f, "{}:{}", BATCH_PREFIX, key),
            WorkKey::ChildStatus(key) => write!(f, "{}:{}", CHILD_STATUS_PREFIX, key),
        }
    }
}

impl FromStr for WorkKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidKey(format!("'{}' has no kind tag", s)))?;
        let key: ObjectKey = rest.parse()?;
        match tag {
            BATCH_PREFIX => Ok(WorkKey::Batch(key)),
            CHILD_STATUS_PREFIX => Ok(WorkKey::ChildStatus(key)),
            other => Err(Error::InvalidKey(format!("unknown kind tag '{}' in '{}'", other, s))),
        }
    }
}
