//! Terraformer: runs Terraform as a Kubernetes Job
//!
//! A run for a [`JobKey`] goes through these steps:
//! 1. Take the in-process lock for the key
//! 2. Ensure the `terraformer` ServiceAccount, Role and RoleBinding
//! 3. Reuse, supersede or clear a Job left over for the key
//! 4. Store the configuration and create the state ConfigMap if missing
//! 5. Create the Job and wait for it to finish
//! 6. Clean up the Job and its pods
//! 7. After a successful destroy, delete the stored configuration and state
//!
//! [`JobRunner::discard`] removes the same objects without running anything,
//! for resources deleted before Terraform wrote any state.

pub mod job;
pub mod lock;
pub mod state;
pub mod wait;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::k8s_client::ignore_not_found;
use crate::names::terraformer;
use crate::types::{JobKey, JobOutcome, JobRunConfig, TerraformCommand, TerraformFiles, TerraformerSettings};

use self::job::{
    job_phase, leftover_action, pod_selector, pod_started, render_job, termination_message, JobPhase,
    LeftoverAction,
};
use self::lock::KeyedLocks;
pub use self::state::TerraformState;
use self::wait::poll_until;

/// Lifecycle manager for Terraform job runs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `terraform apply|destroy` for the key and wait for the result
    ///
    /// Returns [`Error::Cancelled`] promptly once `cancel` fires; the job is
    /// left in place so a later run with the same configuration can pick it up.
    async fn run(&self, config: &JobRunConfig, cancel: &CancellationToken) -> Result<JobOutcome>;

    /// Current Terraform state; `NotFound` when none exists or it is empty
    async fn get_state(&self, key: &JobKey) -> Result<TerraformState>;

    /// Named outputs of the current state
    async fn get_state_output_variables(
        &self,
        key: &JobKey,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>>;

    /// Remove the key's job, its pods and the stored configuration and state
    ///
    /// Objects that are already gone are skipped, so this can be repeated.
    async fn discard(
        &self,
        key: &JobKey,
        settings: &TerraformerSettings,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// [`JobRunner`] backed by the Kubernetes API
pub struct Terraformer {
    client: Client,
    locks: KeyedLocks,
}

impl Terraformer {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            locks: KeyedLocks::new(),
        }
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    /// ServiceAccount, Role and RoleBinding the job runs with
    async fn ensure_rbac(&self, namespace: &str) -> Result<()> {
        let params = PatchParams::apply(terraformer::FIELD_MANAGER).force();

        let service_accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let service_account = json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": { "name": terraformer::SERVICE_ACCOUNT, "namespace": namespace },
        });
        service_accounts
            .patch(terraformer::SERVICE_ACCOUNT, &params, &Patch::Apply(&service_account))
            .await?;

        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let role = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": { "name": terraformer::ROLE, "namespace": namespace },
            "rules": [
                {
                    "apiGroups": [""],
                    "resources": ["configmaps"],
                    "verbs": ["get", "list", "watch", "create", "update", "patch"],
                },
                {
                    "apiGroups": [""],
                    "resources": ["secrets"],
                    "verbs": ["get", "list", "watch"],
                },
            ],
        });
        roles
            .patch(terraformer::ROLE, &params, &Patch::Apply(&role))
            .await?;

        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let binding = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": { "name": terraformer::ROLE, "namespace": namespace },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "Role",
                "name": terraformer::ROLE,
            },
            "subjects": [
                {
                    "kind": "ServiceAccount",
                    "name": terraformer::SERVICE_ACCOUNT,
                    "namespace": namespace,
                },
            ],
        });
        bindings
            .patch(terraformer::ROLE, &params, &Patch::Apply(&binding))
            .await?;

        Ok(())
    }

    async fn store_configuration(&self, key: &JobKey, files: &TerraformFiles) -> Result<()> {
        let params = PatchParams::apply(terraformer::FIELD_MANAGER).force();

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(key.config_map_name()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (terraformer::MAIN_TF.to_string(), files.main.clone()),
                (terraformer::VARIABLES_TF.to_string(), files.variables.clone()),
            ])),
            ..Default::default()
        };
        self.config_maps(&key.namespace)
            .patch(&key.config_map_name(), &params, &Patch::Apply(&config_map))
            .await?;

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(key.variables_secret_name()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                terraformer::TFVARS.to_string(),
                ByteString(files.tfvars.clone().into_bytes()),
            )])),
            ..Default::default()
        };
        self.secrets(&key.namespace)
            .patch(&key.variables_secret_name(), &params, &Patch::Apply(&secret))
            .await?;

        Ok(())
    }

    /// Create an empty state ConfigMap; an existing state is never touched
    async fn ensure_state(&self, key: &JobKey) -> Result<()> {
        let state = ConfigMap {
            metadata: ObjectMeta {
                name: Some(key.state_config_map_name()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(terraformer::STATE_KEY.to_string(), String::new())])),
            ..Default::default()
        };

        match self.config_maps(&key.namespace).create(&PostParams::default(), &state).await {
            Ok(_) => {
                tracing::info!("Created empty terraform state {}", key.state_config_map_name());
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Decide what to do with a job left over for the key
    ///
    /// Returns true if the existing job runs the same configuration and is
    /// awaited instead of starting a new one.
    async fn reuse_or_clear_job(
        &self,
        config: &JobRunConfig,
        config_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let name = config.key.job_name();
        let Some(existing) = self.jobs(&config.key.namespace).get_opt(&name).await? else {
            return Ok(false);
        };

        match leftover_action(&existing, config.command, config_hash) {
            LeftoverAction::Reuse => {
                tracing::info!("Reusing running terraformer job {}", name);
                return Ok(true);
            }
            LeftoverAction::Supersede => {
                tracing::info!("Superseding running terraformer job {}", name);
            }
            LeftoverAction::Clear => {
                tracing::info!("Removing finished terraformer job {} ({:?})", name, job_phase(&existing));
            }
        }

        self.remove_job(&config.key, &config.settings, cancel).await?;
        Ok(false)
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    async fn wait_for_job(&self, config: &JobRunConfig, cancel: &CancellationToken) -> Result<()> {
        let name = config.key.job_name();
        let jobs = self.jobs(&config.key.namespace);
        let settings = &config.settings;
        let pod_seen = AtomicBool::new(false);

        let (name, jobs, pod_seen) = (&name, &jobs, &pod_seen);
        poll_until(name, settings.deadline_job, settings.poll_interval, cancel, move |elapsed| async move {
            let job = match jobs.get_opt(name).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    return Err(Error::JobFailed {
                        job: name.clone(),
                        reason: "job was deleted while running".to_string(),
                    })
                }
                Err(e) => {
                    tracing::warn!("Failed to read terraformer job {} (will retry): {}", name, e);
                    return Ok(false);
                }
            };

            match job_phase(&job) {
                JobPhase::Succeeded => return Ok(true),
                JobPhase::Failed(reason) => {
                    let pods = self.list_pods(&config.key).await.unwrap_or_default();
                    let reason = termination_message(&pods).unwrap_or(reason);
                    return Err(Error::JobFailed {
                        job: name.clone(),
                        reason,
                    });
                }
                JobPhase::Active => {}
            }

            if !pod_seen.load(Ordering::Relaxed) && elapsed >= settings.deadline_pod {
                match self.list_pods(&config.key).await {
                    Ok(pods) if pod_started(&pods) => pod_seen.store(true, Ordering::Relaxed),
                    Ok(_) => {
                        return Err(Error::PodDeadlineExceeded {
                            job: name.clone(),
                            deadline: settings.deadline_pod,
                        })
                    }
                    Err(e) => tracing::warn!("Failed to list pods of job {} (will retry): {}", name, e),
                }
            }

            Ok(false)
        })
        .await
    }

    async fn list_pods(&self, key: &JobKey) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&pod_selector(key));
        Ok(self.pods(&key.namespace).list(&params).await?.items)
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Delete the job, wait for it and its pods to go away, then force-delete
    /// whatever pods are left
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires.
    async fn remove_job(
        &self,
        key: &JobKey,
        settings: &TerraformerSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = key.job_name();
        let jobs = self.jobs(&key.namespace);

        ignore_not_found(jobs.delete(&name, &DeleteParams::background()).await)?;

        let (name, jobs) = (&name, &jobs);
        let waited = poll_until(name, settings.deadline_cleaning, settings.poll_interval, cancel, move |_| async move {
            let job_gone = jobs.get_opt(name).await?.is_none();
            Ok(job_gone && self.list_pods(key).await?.is_empty())
        })
        .await;

        match waited {
            Err(Error::DeadlineExceeded { .. }) => {}
            result => return result,
        }

        let remaining = self.list_pods(key).await?;
        tracing::warn!(
            "Terraformer job {} not gone after {}s, force deleting {} pod(s)",
            name,
            settings.deadline_cleaning.as_secs(),
            remaining.len()
        );
        let force = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        let pods = self.pods(&key.namespace);
        for pod in remaining {
            if let Some(pod_name) = pod.metadata.name {
                ignore_not_found(pods.delete(&pod_name, &force).await)?;
            }
        }
        Ok(())
    }

    async fn delete_artifacts(&self, key: &JobKey) -> Result<()> {
        let config_maps = self.config_maps(&key.namespace);
        let params = DeleteParams::default();

        ignore_not_found(config_maps.delete(&key.config_map_name(), &params).await)?;
        ignore_not_found(
            self.secrets(&key.namespace)
                .delete(&key.variables_secret_name(), &params)
                .await,
        )?;
        ignore_not_found(config_maps.delete(&key.state_config_map_name(), &params).await)?;

        tracing::info!("Deleted terraform configuration and state of {}", key);
        Ok(())
    }
}

#[async_trait]
impl JobRunner for Terraformer {
    async fn run(&self, config: &JobRunConfig, cancel: &CancellationToken) -> Result<JobOutcome> {
        let key = &config.key;
        let job_name = key.job_name();
        let config_hash = config.config_hash();

        // 1. One run per key at a time
        let _guard = self.locks.lock(key).await;
        let started = Instant::now();
        tracing::info!("Running terraform {} for {}", config.command, key);

        // 2. RBAC for the job
        self.ensure_rbac(&key.namespace).await?;

        // 3. Leftover job
        let reused = self.reuse_or_clear_job(config, &config_hash, cancel).await?;

        if !reused {
            // 4. Configuration and state
            match &config.files {
                Some(files) => self.store_configuration(key, files).await?,
                None => {
                    if self.config_maps(&key.namespace).get_opt(&key.config_map_name()).await?.is_none() {
                        return Err(Error::not_found("ConfigMap", key.config_map_name()));
                    }
                }
            }
            self.ensure_state(key).await?;

            // 5. Job
            let job = render_job(config, &config_hash)?;
            self.jobs(&key.namespace)
                .create(&PostParams::default(), &job)
                .await?;
            tracing::info!("Created terraformer job {}", job_name);
        }

        // 6. Cleanup, unless the wait was cancelled
        match self.wait_for_job(config, cancel).await {
            Err(e @ Error::Cancelled { .. }) => {
                tracing::info!("Stopped waiting for terraformer job {}", job_name);
                return Err(e);
            }
            result => {
                if let Err(e) = self.remove_job(key, &config.settings, cancel).await {
                    tracing::warn!("Failed to clean up terraformer job {}: {}", job_name, e);
                }
                result?;
            }
        }

        // 7. Nothing left to manage after a destroy
        if config.command == TerraformCommand::Destroy {
            self.delete_artifacts(key).await?;
        }

        let duration = started.elapsed();
        tracing::info!(
            "Terraform {} for {} finished in {}s",
            config.command,
            key,
            duration.as_secs()
        );

        Ok(JobOutcome {
            job_name,
            reused,
            duration,
        })
    }

    async fn get_state(&self, key: &JobKey) -> Result<TerraformState> {
        let name = key.state_config_map_name();
        let config_map = self
            .config_maps(&key.namespace)
            .get_opt(&name)
            .await?
            .ok_or_else(|| Error::not_found("terraform state", name.clone()))?;

        let raw = config_map
            .data
            .and_then(|mut data| data.remove(terraformer::STATE_KEY))
            .unwrap_or_default();

        let state = TerraformState::new(raw);
        if state.is_empty() {
            return Err(Error::not_found("terraform state", name));
        }
        Ok(state)
    }

    async fn get_state_output_variables(
        &self,
        key: &JobKey,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>> {
        self.get_state(key).await?.output_variables(keys)
    }

    async fn discard(
        &self,
        key: &JobKey,
        settings: &TerraformerSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.locks.lock(key).await;

        self.remove_job(key, settings, cancel).await?;
        self.delete_artifacts(key).await
    }
}
