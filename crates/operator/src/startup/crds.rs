//! CRD registration on startup.
//!
//! Both kinds are created from their generated schema. A kind that already
//! exists is left untouched; a freshly created one must report
//! `Established` before the controller starts watching it.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing::{info, warn};

use crate::crd::{JobBatch, JobTemplate};
use crate::polling::{wait_for_resource, DEFAULT_POLL_INTERVAL};
use crate::{Error, Result};

/// Every CRD the controller depends on
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![JobBatch::crd(), JobTemplate::crd()]
}

fn condition_is_true(crd: &CustomResourceDefinition, type_: &str) -> Option<bool> {
    crd.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status == "True")
}

pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    condition_is_true(crd, "Established").unwrap_or(false)
}

/// The reason the API server refused the CRD's names, if it did
pub fn names_conflict(crd: &CustomResourceDefinition) -> Option<String> {
    let conditions = crd.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .find(|c| c.type_ == "NamesAccepted" && c.status == "False")
        .map(|c| c.message.clone().unwrap_or_default())
}

/// Create any missing CRDs and wait until they can be served.
pub async fn ensure_crds(client: &Client, timeout: Duration) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());

    for crd in all_crds() {
        let name = crd.name_any();
        match api.create(&PostParams::default(), &crd).await {
            Ok(_) => info!("Created {} CRD, waiting for it to be established", name),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    info!("{} CRD already installed", name);
                    continue;
                }
                return Err(err);
            }
        }

        let established = wait_for_resource(
            &format!("{} CRD to be established", name),
            timeout,
            DEFAULT_POLL_INTERVAL,
            || {
                let api = api.clone();
                let name = name.clone();
                async move {
                    let current = api.get(&name).await?;
                    if let Some(reason) = names_conflict(&current) {
                        warn!("{} CRD names not accepted: {}", name, reason);
                    }
                    Ok::<_, Error>(is_established(&current).then_some(()))
                }
            },
        )
        .await;

        if let Err(e) = established {
            warn!("Removing {} CRD that never became established", name);
            if let Err(delete_err) = api.delete(&name, &DeleteParams::default()).await {
                warn!("Failed to delete {} CRD: {}", name, delete_err);
            }
            return Err(e);
        }
        info!("{} CRD established", name);
    }

    Ok(())
}
