//! Kubernetes Event recording.
//!
//! Notifications become `core/v1` Events on the involved JobBatch so they
//! show up in `kubectl describe jobbatch` and `kubectl get events`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

use super::{Notification, NotificationSink};
use crate::crd::common::{LABEL_BATCH_NAME, LABEL_TEMPLATE_NAME};
use crate::Result;

pub struct KubeEventSink {
    client: Client,
    component: String,
    host: String,
}

impl KubeEventSink {
    /// `component` and `host` are reported as the event source.
    pub fn new(client: Client, component: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
            host: host.into(),
        }
    }
}

/// Build the Event object for a notification.
pub fn build_event(notification: &Notification, component: &str, host: &str) -> Event {
    let involved = &notification.involved_object;
    let namespace = involved.namespace.clone().unwrap_or_else(|| "default".to_string());
    let batch_name = involved.name.clone().unwrap_or_default();
    let now = Time(Utc::now());

    let mut labels = BTreeMap::new();
    if !batch_name.is_empty() {
        labels.insert(LABEL_BATCH_NAME.to_string(), batch_name.clone());
    }
    if !notification.template_name.is_empty() {
        labels.insert(LABEL_TEMPLATE_NAME.to_string(), notification.template_name.clone());
    }

    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", if batch_name.is_empty() { "jobbatch" } else { &batch_name })),
            namespace: Some(namespace),
            labels: Some(labels),
            ..Default::default()
        },
        involved_object: involved.clone(),
        reason: Some(notification.reason.clone()),
        message: Some(notification.message.clone()),
        type_: Some(notification.notification_type.as_str().to_string()),
        source: Some(EventSource {
            component: Some(component.to_string()),
            host: (!host.is_empty()).then(|| host.to_string()),
        }),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        reporting_component: Some(component.to_string()),
        reporting_instance: (!host.is_empty()).then(|| host.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl NotificationSink for KubeEventSink {
    fn name(&self) -> &str {
        "kubernetes-events"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let event = build_event(notification, &self.component, &self.host);
        let namespace = event.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &event).await?;
        debug!(reason = %notification.reason, "Recorded event");
        Ok(())
    }
}
