//! Infrastructure actuator
//!
//! Implements the two verbs of the Infrastructure controller on top of a
//! [`JobRunner`], a [`KubeClient`] and an optional [`ProviderClientFactory`]:
//! - `reconcile`: apply the Terraform configuration and publish its outputs
//! - `delete`: clean up provider dependents and destroy the Terraform resources
//!
//! Both verbs are idempotent. Failures are written to the status (best-effort)
//! and returned for the caller to requeue; nothing is retried here.

mod delete;
pub mod outputs;
mod reconcile;

#[cfg(test)]
mod fixtures;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tfinfra_models::{Infrastructure, LastOperationType};

use crate::error::{Error, Result};
use crate::k8s_client::KubeClient;
use crate::names::{purposes, secrets};
use crate::provider::ProviderClientFactory;
use crate::status::StatusReporter;
use crate::terraformer::JobRunner;
use crate::types::{JobKey, TerraformerSettings};

pub use self::outputs::ZonedOutputs;

/// Collaborators of the actuator, passed once at construction
pub struct ActuatorConfig {
    pub runner: Arc<dyn JobRunner>,
    pub kube: Arc<dyn KubeClient>,
    /// Provider API for dependent cleanup; cleanup is skipped without one
    pub provider: Option<Arc<dyn ProviderClientFactory>>,
    pub settings: TerraformerSettings,
}

pub struct Actuator {
    runner: Arc<dyn JobRunner>,
    kube: Arc<dyn KubeClient>,
    provider: Option<Arc<dyn ProviderClientFactory>>,
    settings: TerraformerSettings,
    status: StatusReporter,
}

impl Actuator {
    pub fn new(config: ActuatorConfig) -> Self {
        Self {
            status: StatusReporter::new(config.kube.clone()),
            runner: config.runner,
            kube: config.kube,
            provider: config.provider,
            settings: config.settings,
        }
    }

    /// Job key of the infrastructure: purpose `infra` in its own namespace
    fn job_key(infra: &Infrastructure) -> Result<JobKey> {
        let namespace = infra
            .namespace()
            .ok_or_else(|| Error::fatal("infrastructure has no namespace"))?;
        Ok(JobKey::new(purposes::INFRA, namespace, infra.name_any()))
    }

    /// Fetch the credentials secret and make sure it holds the expected keys
    ///
    /// The job gets the values as secret refs; only the provider cleanup
    /// before a destroy reads them.
    async fn check_credentials(&self, infra: &Infrastructure) -> Result<Secret> {
        let secret_ref = &infra.spec.secret_ref;
        if infra.namespace().as_deref() != Some(secret_ref.namespace.as_str()) {
            return Err(Error::fatal(format!(
                "secret {}/{} must be in the namespace of the infrastructure",
                secret_ref.namespace, secret_ref.name
            )));
        }

        let secret = self
            .kube
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| {
                Error::not_found("Secret", format!("{}/{}", secret_ref.namespace, secret_ref.name))
            })?;

        let has_key = |key: &str| {
            secret.data.as_ref().is_some_and(|d| d.contains_key(key))
                || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
        };
        let missing: Vec<&str> = [secrets::ACCESS_KEY_ID, secrets::SECRET_ACCESS_KEY]
            .into_iter()
            .filter(|key| !has_key(key))
            .collect();

        if !missing.is_empty() {
            return Err(Error::fatal(format!(
                "secret {}/{} is missing {}",
                secret_ref.namespace,
                secret_ref.name,
                missing.join(", ")
            )));
        }
        Ok(secret)
    }

    /// Report a failure in the status and hand it back
    ///
    /// A cancelled run is not a failure of the infrastructure and is not reported.
    async fn fail(
        &self,
        infra: &Infrastructure,
        operation: LastOperationType,
        description: &str,
        progress: i32,
        error: Error,
    ) -> Error {
        if matches!(error, Error::Cancelled { .. }) {
            tracing::info!("{} of infrastructure {} cancelled", description, infra.name_any());
        } else {
            tracing::error!("{} for infrastructure {}: {}", description, infra.name_any(), error);
            self.status
                .error(infra, operation, description, progress, &error)
                .await;
        }
        error
    }
}
