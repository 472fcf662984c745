use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tfinfra_models::{Infrastructure, LastOperationType};
use tokio_util::sync::CancellationToken;

use super::Actuator;
use crate::error::{Error, Result};
use crate::names::outputs::VPC_ID;
use crate::provider::{credentials_from_secret, destroy_load_balancers_and_security_groups};
use crate::terraform::{render_files, variables_environment};
use crate::terraformer::TerraformState;
use crate::types::{JobKey, JobRunConfig};

const OPERATION: LastOperationType = LastOperationType::Delete;

impl Actuator {
    /// Destroy the infrastructure
    ///
    /// Without a Terraform state there is nothing to destroy: a leftover job
    /// and the stored configuration are discarded, and neither the status nor
    /// the provider is touched.
    pub async fn delete(&self, infra: &Infrastructure, cancel: &CancellationToken) -> Result<()> {
        let key = Self::job_key(infra)?;

        // 1. Anything to destroy?
        let state = match self.runner.get_state(&key).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                tracing::info!("No terraform state for {}, nothing to destroy", key);
                if let Err(e) = self.runner.discard(&key, &self.settings, cancel).await {
                    return Err(self
                        .fail(infra, OPERATION, "Failed to clean up the terraform config", 30, e)
                        .await);
                }
                return Ok(());
            }
            Err(e) => {
                return Err(self
                    .fail(infra, OPERATION, "Failed to read the terraform state", 30, e)
                    .await)
            }
        };

        self.status
            .processing(infra, OPERATION, "Deleting the infrastructure", 10)
            .await;

        let secret = match self.check_credentials(infra).await {
            Ok(secret) => secret,
            Err(e) => {
                return Err(self
                    .fail(infra, OPERATION, "Failed to prepare the terraform config", 10, e)
                    .await)
            }
        };

        // 2. Dependents created outside of terraform
        if let Err(e) = self.destroy_dependents(infra, &key, &state, &secret).await {
            return Err(self
                .fail(
                    infra,
                    OPERATION,
                    "Failed to destroy load balancers and security groups",
                    30,
                    e,
                )
                .await);
        }

        // 3. Destroy
        let files = match render_files(infra) {
            Ok(files) => Some(files),
            Err(e) => {
                tracing::warn!(
                    "Cannot render terraform config of {} ({}), destroying with the stored one",
                    key,
                    e
                );
                None
            }
        };
        let config = JobRunConfig::destroy(
            key,
            files,
            variables_environment(&infra.spec.secret_ref),
            self.settings.clone(),
        );

        if let Err(e) = self.runner.run(&config, cancel).await {
            return Err(self
                .fail(infra, OPERATION, "Failed to destroy the terraform config", 60, e)
                .await);
        }

        self.status
            .success(infra, OPERATION, "Successfully deleted the infrastructure", None)
            .await?;

        tracing::info!("Deleted infrastructure {}", config.key);
        Ok(())
    }

    async fn destroy_dependents(
        &self,
        infra: &Infrastructure,
        key: &JobKey,
        state: &TerraformState,
        secret: &Secret,
    ) -> Result<()> {
        let Some(factory) = &self.provider else {
            tracing::info!(
                "No provider client configured, skipping load balancer and security group cleanup of {}",
                key
            );
            return Ok(());
        };

        let vpc_id = match state.output_variables(&[VPC_ID.to_string()]) {
            Ok(mut values) => values.remove(VPC_ID).unwrap_or_default(),
            Err(Error::VariablesNotFound { .. }) => {
                tracing::info!(
                    "Skipping explicit load balancer and security group deletion of {} because not all variables have been found in the terraform state",
                    key
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let credentials = credentials_from_secret(secret)?;
        let provider = factory.client(&infra.spec.region, &credentials).await?;

        let cluster = infra.namespace().unwrap_or_default();
        destroy_load_balancers_and_security_groups(provider.as_ref(), &vpc_id, &cluster).await
    }
}
