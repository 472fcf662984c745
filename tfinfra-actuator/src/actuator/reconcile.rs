use std::collections::BTreeMap;

use tfinfra_models::{Infrastructure, LastOperationType, ProviderStatus};
use tokio_util::sync::CancellationToken;

use super::{outputs, Actuator};
use crate::error::{Error, Result};
use crate::names::outputs::VPC_ID;
use crate::terraform::{output_keys, render_files, variables_environment};
use crate::types::{JobKey, JobRunConfig};

const OPERATION: LastOperationType = LastOperationType::Reconcile;

impl Actuator {
    /// Apply the infrastructure and publish its outputs in the status
    pub async fn reconcile(&self, infra: &Infrastructure, cancel: &CancellationToken) -> Result<()> {
        self.status
            .processing(infra, OPERATION, "Reconciling the infrastructure", 10)
            .await;

        // 1. Terraform inputs
        let config = match self.apply_config(infra).await {
            Ok(config) => config,
            Err(e) => {
                return Err(self
                    .fail(infra, OPERATION, "Failed to prepare the terraform config", 10, e)
                    .await)
            }
        };

        // 2. Apply
        if let Err(e) = self.runner.run(&config, cancel).await {
            return Err(self
                .fail(infra, OPERATION, "Failed to apply the terraform config", 50, e)
                .await);
        }

        // 3. Outputs
        let provider_status = match self.extract_provider_status(infra, &config.key).await {
            Ok(status) => status,
            Err(e) => {
                return Err(self
                    .fail(infra, OPERATION, "Failed to extract the provider status", 80, e)
                    .await)
            }
        };

        self.status
            .success(
                infra,
                OPERATION,
                "Successfully reconciled the infrastructure",
                Some(provider_status),
            )
            .await?;

        tracing::info!("Reconciled infrastructure {}", config.key);
        Ok(())
    }

    async fn apply_config(&self, infra: &Infrastructure) -> Result<JobRunConfig> {
        let key = Self::job_key(infra)?;
        let files = render_files(infra)?;
        self.check_credentials(infra).await?;

        Ok(JobRunConfig::apply(
            key,
            files,
            variables_environment(&infra.spec.secret_ref),
            self.settings.clone(),
        ))
    }

    async fn extract_provider_status(&self, infra: &Infrastructure, key: &JobKey) -> Result<ProviderStatus> {
        let zones = &infra.spec.zones;
        let keys = output_keys(zones.len());

        let values: BTreeMap<String, String> =
            match self.runner.get_state_output_variables(key, &keys).await {
                Ok(values) => values,
                Err(Error::VariablesNotFound { missing, found })
                    if !missing.iter().any(|k| k == VPC_ID) =>
                {
                    tracing::warn!(
                        "Terraform state of {} lacks optional outputs {}, publishing partial status",
                        key,
                        missing.join(", ")
                    );
                    found
                }
                Err(e) => return Err(e),
            };

        outputs::provider_status(&values, zones)
    }
}
