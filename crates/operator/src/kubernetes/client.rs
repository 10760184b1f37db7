use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, ResourceExt,
};
use tracing::{debug, info};

use crate::crd::JobBatch;
use crate::{Error, Result};

/// The store mutations the reconciler needs.
///
/// Reads go through the watch caches; only writes, and the one re-read after
/// a lost creation race, reach the API server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create a child pod, returning the stored object with its generated name
    async fn create_child(&self, pod: &Pod) -> Result<Pod>;

    /// List child pods straight from the API server
    async fn list_children(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Delete a child pod. A pod that is already gone is not an error.
    async fn delete_child(&self, namespace: &str, name: &str) -> Result<()>;

    /// Conditionally replace the batch status; the object's resourceVersion
    /// must match the stored one or a conflict error is returned.
    async fn replace_batch_status(&self, batch: &JobBatch) -> Result<JobBatch>;
}

pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn create_child(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let created = self.pods(&namespace).create(&PostParams::default(), pod).await?;
        info!("Created child job {}/{}", namespace, created.name_any());
        Ok(created)
    }

    async fn list_children(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_child(&self, namespace: &str, name: &str) -> Result<()> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted child job {}/{}", namespace, name);
                Ok(())
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    debug!("Child job {}/{} already gone", namespace, name);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn replace_batch_status(&self, batch: &JobBatch) -> Result<JobBatch> {
        let namespace = batch.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<JobBatch> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(batch)?;
        let updated = api
            .replace_status(&batch.name_any(), &PostParams::default(), data)
            .await?;
        Ok(updated)
    }
}
