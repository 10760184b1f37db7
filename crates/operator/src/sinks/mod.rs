//! Best-effort notifications about batch progress.
//!
//! Publishing never participates in convergence: [`publish`] logs a failed
//! write and carries on.

pub mod event;
pub mod stdout;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use event::KubeEventSink;
pub use stdout::StdoutSink;

use crate::Result;

/// Well-known notification reasons
pub mod reasons {
    /// A child job was created for a template
    pub const CHILD_JOB_STARTED: &str = "ChildJobStarted";
    /// Creating a child job was rejected by the API server
    pub const CHILD_JOB_CREATION_FAILED: &str = "ChildJobCreationFailed";
    /// A child job finished successfully
    pub const CHILD_JOB_SUCCEEDED: &str = "ChildJobSucceeded";
    /// A child job failed
    pub const CHILD_JOB_FAILED: &str = "ChildJobFailed";
    /// A child job ended in an unknown state
    pub const CHILD_JOB_ERROR: &str = "ChildJobError";
    /// Every template ran and none failed
    pub const BATCH_SUCCEEDED: &str = "BatchSucceeded";
    /// The batch completed with failures
    pub const BATCH_FAILED: &str = "BatchFailed";
    /// The batch spec cannot be acted on
    pub const BATCH_INVALID: &str = "BatchInvalid";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    Normal,
    Warning,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Normal => "Normal",
            NotificationType::Warning => "Warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// The JobBatch this notification is about
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    /// Template the notification concerns, empty for batch-level notifications
    #[serde(rename = "templateName", default)]
    pub template_name: String,
}

impl Notification {
    pub fn normal(involved_object: ObjectReference, reason: &str, message: impl Into<String>) -> Self {
        Self {
            involved_object,
            reason: reason.to_string(),
            message: message.into(),
            notification_type: NotificationType::Normal,
            template_name: String::new(),
        }
    }

    pub fn warning(involved_object: ObjectReference, reason: &str, message: impl Into<String>) -> Self {
        Self {
            notification_type: NotificationType::Warning,
            ..Self::normal(involved_object, reason, message)
        }
    }

    pub fn for_template(mut self, template_name: impl Into<String>) -> Self {
        self.template_name = template_name.into();
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Fire-and-forget delivery
pub async fn publish(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.send(&notification).await {
        warn!(
            sink = sink.name(),
            reason = %notification.reason,
            error = %e,
            "Failed to publish notification"
        );
    }
}
