//! Shared Kubernetes client utilities

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tfinfra_models::{Infrastructure, InfrastructureStatus};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// Get a Kubernetes client
pub async fn get_k8s_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// True for a kube API 404
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Turn a 404 into `None`, for deletes of objects that may already be gone
pub fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads and writes the actuator needs besides the Terraformer's own
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Replace the status of an Infrastructure
    async fn patch_infrastructure_status(
        &self,
        infra: &Infrastructure,
        status: &InfrastructureStatus,
    ) -> Result<()>;

    /// Fetch a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_infrastructure_status(
        &self,
        infra: &Infrastructure,
        status: &InfrastructureStatus,
    ) -> Result<()> {
        let namespace = infra.namespace().unwrap_or_default();
        let api: Api<Infrastructure> = Api::namespaced(self.client.clone(), &namespace);

        let patch = json!({ "status": status });
        api.patch_status(
            &infra.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
