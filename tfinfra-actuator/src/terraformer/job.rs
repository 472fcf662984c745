//! Terraformer Job manifest and status helpers

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tera::{Context as TeraContext, Tera};

use crate::error::Result;
use crate::names::terraformer;
use crate::types::{JobKey, JobRunConfig, TerraformCommand, VariableValue};

const JOB_TEMPLATE: &str = "terraformer-job";

static TEMPLATES: OnceCell<Tera> = OnceCell::new();

fn templates() -> Result<&'static Tera> {
    TEMPLATES.get_or_try_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template(JOB_TEMPLATE, include_str!("../templates/terraformer-job.yaml"))?;
        Ok(tera)
    })
}

/// Environment entry as seen by the template
#[derive(Debug, Serialize)]
struct EnvEntry<'a> {
    name: &'a str,
    value: Option<&'a str>,
    secret: Option<&'a str>,
    key: Option<&'a str>,
}

/// Render the Job for a run
///
/// Secret-backed variables become `secretKeyRef` entries; their values never
/// appear in the manifest.
pub fn render_job(config: &JobRunConfig, config_hash: &str) -> Result<Job> {
    let key = &config.key;

    let env: Vec<EnvEntry> = config
        .environment
        .iter()
        .map(|(name, value)| match value {
            VariableValue::Literal(v) => EnvEntry {
                name: name.as_str(),
                value: Some(v.as_str()),
                secret: None,
                key: None,
            },
            VariableValue::SecretKey { secret, key } => EnvEntry {
                name: name.as_str(),
                value: None,
                secret: Some(secret.as_str()),
                key: Some(key.as_str()),
            },
        })
        .collect();

    let mut ctx = TeraContext::new();
    ctx.insert("job_name", &key.job_name());
    ctx.insert("namespace", &key.namespace);
    ctx.insert("name", &key.name);
    ctx.insert("purpose", &key.purpose);
    ctx.insert("command", config.command.as_str());
    ctx.insert("config_hash", config_hash);
    ctx.insert("image", &config.settings.image);
    ctx.insert("backoff_limit", &config.settings.backoff_limit);
    ctx.insert("active_deadline_seconds", &config.settings.active_deadline.as_secs());
    ctx.insert("service_account", terraformer::SERVICE_ACCOUNT);
    ctx.insert("field_manager", terraformer::FIELD_MANAGER);
    ctx.insert("label_purpose", terraformer::LABEL_PURPOSE);
    ctx.insert("label_name", terraformer::LABEL_NAME);
    ctx.insert("annotation_command", terraformer::ANNOTATION_COMMAND);
    ctx.insert("annotation_config_hash", terraformer::ANNOTATION_CONFIG_HASH);
    ctx.insert("config_map_name", &key.config_map_name());
    ctx.insert("state_config_map_name", &key.state_config_map_name());
    ctx.insert("variables_secret_name", &key.variables_secret_name());
    ctx.insert("env", &env);

    let yaml = templates()?.render(JOB_TEMPLATE, &ctx)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

/// Label selector matching the pods of a key's job
pub fn pod_selector(key: &JobKey) -> String {
    format!(
        "{}={},{}={}",
        terraformer::LABEL_PURPOSE,
        key.purpose,
        terraformer::LABEL_NAME,
        key.name
    )
}

// ============================================================================
// Job Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Succeeded,
    /// Failed, with the reason reported on the condition
    Failed(String),
}

impl JobPhase {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

pub fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = &job.status else {
        return JobPhase::Active;
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobPhase::Succeeded,
            "Failed" => {
                let reason = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                return JobPhase::Failed(reason);
            }
            _ => {}
        }
    }

    if status.succeeded.unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else {
        JobPhase::Active
    }
}

/// Command and config hash a live job was created with
fn job_fingerprint(job: &Job) -> (Option<&str>, Option<&str>) {
    (
        annotation(job, terraformer::ANNOTATION_COMMAND),
        annotation(job, terraformer::ANNOTATION_CONFIG_HASH),
    )
}

/// What to do with a job found for the key before starting a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeftoverAction {
    /// Still running the same command and configuration: wait on it
    Reuse,
    /// Still running something else: delete it first
    Supersede,
    /// Finished: delete it first
    Clear,
}

pub fn leftover_action(job: &Job, command: TerraformCommand, config_hash: &str) -> LeftoverAction {
    if job_phase(job).is_finished() {
        return LeftoverAction::Clear;
    }

    match job_fingerprint(job) {
        (Some(c), Some(h)) if c == command.as_str() && h == config_hash => LeftoverAction::Reuse,
        _ => LeftoverAction::Supersede,
    }
}

fn annotation<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// True once any pod of the job got past `Pending`
pub fn pod_started(pods: &[Pod]) -> bool {
    pods.iter().any(|pod| {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase != "Pending")
            .unwrap_or(false)
    })
}

/// Termination message of the terraform container, if any pod reported one
pub fn termination_message(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter_map(|pod| pod.status.as_ref())
        .flat_map(|s| s.container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref()?.message.clone())
        .map(|m| m.trim().to_string())
        .find(|m| !m.is_empty())
}
