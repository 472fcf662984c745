//! Infrastructure controller
//!
//! Wires the [`Actuator`] into a `kube::runtime` controller. A finalizer keeps
//! deleted resources around until the Terraform resources are destroyed.
//!
//! Every status write of the actuator triggers a new watch event, so
//! [`needs_reconcile`] and [`retry_after`] decide whether an event is worth a
//! Terraform run:
//! - up to date (`Succeeded` for the current generation) -> skip
//! - failed recently for the current generation -> wait out the retry delay
//! - anything else -> run

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tfinfra_actuator::Actuator;
use tfinfra_models::{Infrastructure, LastOperationState, LastOperationType};
use tokio_util::sync::CancellationToken;

use crate::health::HealthState;

pub const FINALIZER: &str = "tfinfra.io/infrastructure";

/// Set to `reconcile` to force a run without a spec change
pub const OPERATION_ANNOTATION: &str = "tfinfra.io/operation";
const OPERATION_RECONCILE: &str = "reconcile";

const TRANSIENT_REQUEUE: Duration = Duration::from_secs(15);
const FATAL_REQUEUE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("infrastructure has no namespace")]
    MissingNamespace,

    #[error("{0}")]
    Finalizer(#[source] Box<finalizer::Error<tfinfra_actuator::Error>>),
}

/// Shared controller context
pub struct Context {
    pub client: Client,
    pub actuator: Actuator,
    /// Fires on shutdown; running Terraformer waits return early
    pub cancel: CancellationToken,
}

/// Run the controller until the context's token is cancelled
pub async fn run(
    ctx: Arc<Context>,
    namespace: Option<&str>,
    concurrency: u16,
    health: HealthState,
) {
    let api: Api<Infrastructure> = match namespace {
        Some(ns) => Api::namespaced(ctx.client.clone(), ns),
        None => Api::all(ctx.client.clone()),
    };
    let shutdown = ctx.cancel.clone();

    tracing::info!(
        "Starting Infrastructure controller (namespace: {}, concurrency: {})",
        namespace.unwrap_or("<all>"),
        concurrency
    );
    health.set_ready(true);

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!("Reconciled {}", obj),
                Err(e) => tracing::debug!("Reconcile loop error: {}", e),
            }
        })
        .await;

    health.set_ready(false);
    tracing::info!("Infrastructure controller stopped");
}

pub async fn reconcile(infra: Arc<Infrastructure>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = infra.namespace().ok_or(Error::MissingNamespace)?;
    let api: Api<Infrastructure> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch_api = api.clone();

    finalizer(&api, FINALIZER, infra, |event| async move {
        match event {
            Event::Apply(infra) => apply(&infra, &ctx, &patch_api).await,
            Event::Cleanup(infra) => cleanup(&infra, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(
    infra: &Infrastructure,
    ctx: &Context,
    api: &Api<Infrastructure>,
) -> tfinfra_actuator::Result<Action> {
    if !needs_reconcile(infra) {
        tracing::debug!("Infrastructure {} is up to date", infra.name_any());
        return Ok(Action::await_change());
    }
    if let Some(wait) = retry_after(infra, LastOperationType::Reconcile, Utc::now()) {
        tracing::debug!("Infrastructure {} failed recently, retrying in {:?}", infra.name_any(), wait);
        return Ok(Action::requeue(wait));
    }

    ctx.actuator.reconcile(infra, &ctx.cancel).await?;

    if has_reconcile_annotation(infra) {
        let patch = serde_json::json!({
            "metadata": { "annotations": { OPERATION_ANNOTATION: null } }
        });
        api.patch(
            &infra.name_any(),
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
    }

    Ok(Action::await_change())
}

async fn cleanup(infra: &Infrastructure, ctx: &Context) -> tfinfra_actuator::Result<Action> {
    if let Some(wait) = retry_after(infra, LastOperationType::Delete, Utc::now()) {
        tracing::debug!("Deletion of {} failed recently, retrying in {:?}", infra.name_any(), wait);
        return Ok(Action::requeue(wait));
    }

    ctx.actuator.delete(infra, &ctx.cancel).await?;
    Ok(Action::await_change())
}

pub fn error_policy(infra: Arc<Infrastructure>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = requeue_delay(error);
    tracing::warn!(
        "Reconcile of infrastructure {} failed: {}, retrying in {:?}",
        infra.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}

/// Requeue delay by error class: transient, fatal configuration, or other
pub fn requeue_delay(error: &Error) -> Duration {
    match error {
        Error::MissingNamespace => FATAL_REQUEUE,
        Error::Finalizer(e) => match e.as_ref() {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => {
                if e.is_fatal() {
                    FATAL_REQUEUE
                } else if e.is_transient() {
                    TRANSIENT_REQUEUE
                } else {
                    DEFAULT_REQUEUE
                }
            }
            // Adding or removing the finalizer failed
            _ => TRANSIENT_REQUEUE,
        },
    }
}

fn has_reconcile_annotation(infra: &Infrastructure) -> bool {
    infra
        .annotations()
        .get(OPERATION_ANNOTATION)
        .is_some_and(|v| v == OPERATION_RECONCILE)
}

/// Whether the resource differs from what was last reconciled successfully
pub fn needs_reconcile(infra: &Infrastructure) -> bool {
    if has_reconcile_annotation(infra) {
        return true;
    }

    let Some(status) = &infra.status else {
        return true;
    };
    let Some(operation) = &status.last_operation else {
        return true;
    };

    status.observed_generation != infra.metadata.generation
        || operation.operation_type != LastOperationType::Reconcile
        || operation.state != LastOperationState::Succeeded
}

/// Remaining wait before a failed operation is retried
///
/// Only applies while the failure is about the current generation; a spec
/// change or the reconcile annotation retries right away.
pub fn retry_after(
    infra: &Infrastructure,
    operation_type: LastOperationType,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let status = infra.status.as_ref()?;
    let operation = status.last_operation.as_ref()?;

    if operation.operation_type != operation_type {
        return None;
    }
    if operation_type == LastOperationType::Reconcile
        && (status.observed_generation != infra.metadata.generation || has_reconcile_annotation(infra))
    {
        return None;
    }

    let delay = match operation.state {
        LastOperationState::Error => TRANSIENT_REQUEUE,
        LastOperationState::Failed => FATAL_REQUEUE,
        LastOperationState::Processing | LastOperationState::Succeeded => return None,
    };

    let elapsed = (now - operation.last_update_time).to_std().unwrap_or_default();
    delay.checked_sub(elapsed).filter(|wait| !wait.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tfinfra_models::{
        InfrastructureConfig, InfrastructureSpec, InfrastructureStatus, LastOperation, Networks,
        SecretReference, VpcConfig,
    };

    fn infra(generation: i64) -> Infrastructure {
        let mut infra = Infrastructure::new(
            "infra",
            InfrastructureSpec {
                provider_type: "aws".to_string(),
                region: "eu-west-1".to_string(),
                secret_ref: SecretReference {
                    namespace: "shoot--dev".to_string(),
                    name: "cloudprovider".to_string(),
                },
                zones: vec!["eu-1a".to_string()],
                ssh_public_key: None,
                provider_config: InfrastructureConfig {
                    networks: Networks {
                        vpc: VpcConfig {
                            id: None,
                            cidr: Some("10.250.0.0/16".to_string()),
                        },
                        workers: vec!["10.250.0.0/24".to_string()],
                        public: vec!["10.250.100.0/24".to_string()],
                        internal: vec!["10.250.200.0/24".to_string()],
                    },
                },
            },
        );
        infra.metadata.namespace = Some("shoot--dev".to_string());
        infra.metadata.generation = Some(generation);
        infra
    }

    fn with_status(
        mut infra: Infrastructure,
        observed: i64,
        operation_type: LastOperationType,
        state: LastOperationState,
        updated: DateTime<Utc>,
    ) -> Infrastructure {
        infra.status = Some(InfrastructureStatus {
            observed_generation: Some(observed),
            last_operation: Some(LastOperation {
                operation_type,
                state,
                description: String::new(),
                progress: 100,
                last_update_time: updated,
            }),
            last_error: None,
            provider_status: None,
        });
        infra
    }

    fn annotate(mut infra: Infrastructure) -> Infrastructure {
        infra.metadata.annotations = Some(BTreeMap::from([(
            OPERATION_ANNOTATION.to_string(),
            OPERATION_RECONCILE.to_string(),
        )]));
        infra
    }

    #[test]
    fn test_needs_reconcile_without_status() {
        assert!(needs_reconcile(&infra(1)));
    }

    #[test]
    fn test_up_to_date_is_skipped() {
        let infra = with_status(
            infra(3),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            Utc::now(),
        );
        assert!(!needs_reconcile(&infra));
    }

    #[test]
    fn test_generation_change_needs_reconcile() {
        let infra = with_status(
            infra(4),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            Utc::now(),
        );
        assert!(needs_reconcile(&infra));
    }

    #[test]
    fn test_unfinished_or_failed_needs_reconcile() {
        for state in [
            LastOperationState::Processing,
            LastOperationState::Error,
            LastOperationState::Failed,
        ] {
            let infra = with_status(infra(3), 3, LastOperationType::Reconcile, state, Utc::now());
            assert!(needs_reconcile(&infra), "{:?}", state);
        }
    }

    #[test]
    fn test_annotation_forces_reconcile() {
        let infra = annotate(with_status(
            infra(3),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            Utc::now(),
        ));
        assert!(needs_reconcile(&infra));
    }

    #[test]
    fn test_recent_error_waits() {
        let now = Utc::now();
        let infra = with_status(
            infra(3),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Error,
            now - chrono::Duration::seconds(5),
        );
        assert_eq!(
            retry_after(&infra, LastOperationType::Reconcile, now),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_old_error_retries_now() {
        let now = Utc::now();
        let infra = with_status(
            infra(3),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Error,
            now - chrono::Duration::seconds(60),
        );
        assert_eq!(retry_after(&infra, LastOperationType::Reconcile, now), None);
    }

    #[test]
    fn test_fatal_error_waits_longer() {
        let now = Utc::now();
        let infra = with_status(
            infra(3),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Failed,
            now - chrono::Duration::seconds(60),
        );
        assert_eq!(
            retry_after(&infra, LastOperationType::Reconcile, now),
            Some(Duration::from_secs(240))
        );
    }

    #[test]
    fn test_spec_change_skips_retry_delay() {
        let now = Utc::now();
        let infra = with_status(
            infra(4),
            3,
            LastOperationType::Reconcile,
            LastOperationState::Failed,
            now,
        );
        assert_eq!(retry_after(&infra, LastOperationType::Reconcile, now), None);
    }

    #[test]
    fn test_delete_retry_ignores_generation() {
        let now = Utc::now();
        let infra = with_status(
            infra(5),
            3,
            LastOperationType::Delete,
            LastOperationState::Error,
            now,
        );
        assert_eq!(
            retry_after(&infra, LastOperationType::Delete, now),
            Some(TRANSIENT_REQUEUE)
        );
        assert_eq!(retry_after(&infra, LastOperationType::Reconcile, now), None);
    }

    #[test]
    fn test_requeue_delay_by_class() {
        let apply = |e| Error::Finalizer(Box::new(finalizer::Error::ApplyFailed(e)));

        assert_eq!(
            requeue_delay(&apply(tfinfra_actuator::Error::provider("Throttling"))),
            TRANSIENT_REQUEUE
        );
        assert_eq!(
            requeue_delay(&apply(tfinfra_actuator::Error::fatal("bad networks"))),
            FATAL_REQUEUE
        );
        assert_eq!(
            requeue_delay(&Error::Finalizer(Box::new(finalizer::Error::CleanupFailed(
                tfinfra_actuator::Error::JobFailed {
                    job: "infra.infra.tf-job".to_string(),
                    reason: "exit code 1".to_string(),
                }
            )))),
            DEFAULT_REQUEUE
        );
        assert_eq!(requeue_delay(&Error::MissingNamespace), FATAL_REQUEUE);
    }
}
