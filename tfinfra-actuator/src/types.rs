//! Input and output types for Terraformer job runs

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::names::terraformer;

// ============================================================================
// Job Key
// ============================================================================

/// Identity of a job run: at most one live job exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// What the job provisions (e.g., "infra")
    pub purpose: String,
    /// Namespace holding the job and its artifacts
    pub namespace: String,
    /// Name of the owning resource
    pub name: String,
}

impl JobKey {
    pub fn new(purpose: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}.{}", self.name, self.purpose)
    }

    /// ConfigMap holding `main.tf` and `variables.tf`
    pub fn config_map_name(&self) -> String {
        format!("{}.tf-config", self.prefix())
    }

    /// Secret holding `terraform.tfvars`
    pub fn variables_secret_name(&self) -> String {
        format!("{}.tf-vars", self.prefix())
    }

    /// ConfigMap holding `terraform.tfstate`
    pub fn state_config_map_name(&self) -> String {
        format!("{}.tf-state", self.prefix())
    }

    pub fn job_name(&self) -> String {
        format!("{}.tf-job", self.prefix())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.prefix())
    }
}

// ============================================================================
// Job Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformCommand {
    Apply,
    Destroy,
}

impl TerraformCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for TerraformCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs of the Terraformer job
#[derive(Debug, Clone, PartialEq)]
pub struct TerraformerSettings {
    /// Terraformer container image
    pub image: String,
    /// Pod retries before the job is marked Failed
    pub backoff_limit: i32,
    /// Hard ceiling on the job runtime, enforced by Kubernetes
    pub active_deadline: Duration,
    /// How long a pod may stay unscheduled/pending
    pub deadline_pod: Duration,
    /// How long the actuator waits for the job to finish
    pub deadline_job: Duration,
    /// Grace period for job pods to go away before they are force-deleted
    pub deadline_cleaning: Duration,
    /// Interval between job status polls
    pub poll_interval: Duration,
}

impl Default for TerraformerSettings {
    fn default() -> Self {
        Self {
            image: terraformer::DEFAULT_IMAGE.to_string(),
            backoff_limit: 0,
            active_deadline: Duration::from_secs(630),
            deadline_pod: Duration::from_secs(15 * 60),
            deadline_job: Duration::from_secs(15 * 60),
            deadline_cleaning: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Value of a job environment variable
///
/// Secret-backed values are passed to the pod as `secretKeyRef` and never read
/// by the actuator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    Literal(String),
    SecretKey { secret: String, key: String },
}

/// Rendered Terraform configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerraformFiles {
    pub main: String,
    pub variables: String,
    pub tfvars: String,
}

/// Everything needed to run one Terraform command for a key
///
/// Built once and passed to [`crate::terraformer::JobRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunConfig {
    pub key: JobKey,
    pub command: TerraformCommand,
    /// Configuration to store before the run; `None` reuses the stored one
    pub files: Option<TerraformFiles>,
    /// Job environment, keyed by variable name
    pub environment: BTreeMap<String, VariableValue>,
    pub settings: TerraformerSettings,
}

impl JobRunConfig {
    pub fn apply(
        key: JobKey,
        files: TerraformFiles,
        environment: BTreeMap<String, VariableValue>,
        settings: TerraformerSettings,
    ) -> Self {
        Self {
            key,
            command: TerraformCommand::Apply,
            files: Some(files),
            environment,
            settings,
        }
    }

    pub fn destroy(
        key: JobKey,
        files: Option<TerraformFiles>,
        environment: BTreeMap<String, VariableValue>,
        settings: TerraformerSettings,
    ) -> Self {
        Self {
            key,
            command: TerraformCommand::Destroy,
            files,
            environment,
            settings,
        }
    }

    /// Digest of everything that changes what the job does
    ///
    /// A live job with the same hash is reused instead of superseded.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_str());
        hasher.update([0u8]);
        hasher.update(&self.settings.image);
        hasher.update([0u8]);
        if let Some(files) = &self.files {
            for part in [&files.main, &files.variables, &files.tfvars] {
                hasher.update(part);
                hasher.update([0u8]);
            }
        }
        for (name, value) in &self.environment {
            hasher.update(name);
            match value {
                VariableValue::Literal(v) => hasher.update(v),
                VariableValue::SecretKey { secret, key } => {
                    hasher.update(secret);
                    hasher.update("/");
                    hasher.update(key);
                }
            }
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Result of a finished job run
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_name: String,
    /// Whether an already running job with the same configuration was awaited
    pub reused: bool,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> TerraformFiles {
        TerraformFiles {
            main: "main".to_string(),
            variables: "vars".to_string(),
            tfvars: "tfvars".to_string(),
        }
    }

    #[test]
    fn test_artifact_names_follow_key() {
        let key = JobKey::new("infra", "shoot--dev", "infra");
        assert_eq!(key.config_map_name(), "infra.infra.tf-config");
        assert_eq!(key.variables_secret_name(), "infra.infra.tf-vars");
        assert_eq!(key.state_config_map_name(), "infra.infra.tf-state");
        assert_eq!(key.job_name(), "infra.infra.tf-job");
        assert_eq!(key.to_string(), "shoot--dev/infra.infra");
    }

    #[test]
    fn test_config_hash_depends_on_command_and_files() {
        let key = JobKey::new("infra", "ns", "infra");
        let settings = TerraformerSettings::default();
        let apply = JobRunConfig::apply(key.clone(), files(), BTreeMap::new(), settings.clone());
        let destroy = JobRunConfig::destroy(key.clone(), Some(files()), BTreeMap::new(), settings.clone());

        assert_eq!(apply.config_hash(), apply.clone().config_hash());
        assert_ne!(apply.config_hash(), destroy.config_hash());

        let mut changed = files();
        changed.tfvars = "other".to_string();
        let apply_changed = JobRunConfig::apply(key, changed, BTreeMap::new(), settings);
        assert_ne!(apply.config_hash(), apply_changed.config_hash());
    }
}
