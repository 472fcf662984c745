//! Status reporting for Infrastructure resources
//!
//! Every write replaces `lastOperation`, sets `observedGeneration` to the
//! resource's generation and keeps the provider status unless a new one is given.
//! Error writes are best-effort: a failed write is logged and the caller keeps
//! returning its original error.

use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tfinfra_models::{
    ErrorCode, Infrastructure, InfrastructureStatus, LastError, LastOperation, LastOperationState,
    LastOperationType, ProviderStatus,
};

use crate::error::{Error, Result};
use crate::k8s_client::KubeClient;

pub struct StatusReporter {
    client: Arc<dyn KubeClient>,
}

impl StatusReporter {
    pub fn new(client: Arc<dyn KubeClient>) -> Self {
        Self { client }
    }

    /// Record that an operation started; best-effort
    pub async fn processing(
        &self,
        infra: &Infrastructure,
        operation: LastOperationType,
        description: &str,
        progress: i32,
    ) {
        let mut status = base_status(infra);
        status.last_operation = Some(last_operation(
            operation,
            LastOperationState::Processing,
            description.to_string(),
            progress,
        ));

        if let Err(e) = self.client.patch_infrastructure_status(infra, &status).await {
            tracing::warn!(
                "Could not update status of infrastructure {} to processing: {}",
                infra.name_any(),
                e
            );
        }
    }

    /// Record a failed operation; best-effort
    ///
    /// The description is `"<description>: <error>"`.
    pub async fn error(
        &self,
        infra: &Infrastructure,
        operation: LastOperationType,
        description: &str,
        progress: i32,
        error: &Error,
    ) {
        let mut status = base_status(infra);
        let (last_operation, last_error) =
            reconcile_error(operation, format!("{}: {}", description, error), progress, error.is_fatal());
        status.last_operation = Some(last_operation);
        status.last_error = Some(last_error);

        if let Err(e) = self.client.patch_infrastructure_status(infra, &status).await {
            tracing::error!(
                "Could not update status of infrastructure {} after error: {}",
                infra.name_any(),
                e
            );
        }
    }

    /// Record a successful operation and clear the last error
    pub async fn success(
        &self,
        infra: &Infrastructure,
        operation: LastOperationType,
        description: &str,
        provider_status: Option<ProviderStatus>,
    ) -> Result<()> {
        let mut status = base_status(infra);
        status.last_operation = Some(reconcile_succeeded(operation, description.to_string()));
        status.last_error = None;
        if provider_status.is_some() {
            status.provider_status = provider_status;
        }

        self.client.patch_infrastructure_status(infra, &status).await
    }
}

fn base_status(infra: &Infrastructure) -> InfrastructureStatus {
    let mut status = infra.status.clone().unwrap_or_default();
    status.observed_generation = infra.metadata.generation;
    status
}

fn last_operation(
    operation: LastOperationType,
    state: LastOperationState,
    description: String,
    progress: i32,
) -> LastOperation {
    LastOperation {
        operation_type: operation,
        state,
        description,
        progress,
        last_update_time: Utc::now(),
    }
}

/// Last operation and last error for a failed attempt
///
/// Fatal errors are recorded as `Failed`, everything else as `Error`.
pub fn reconcile_error(
    operation: LastOperationType,
    description: String,
    progress: i32,
    fatal: bool,
) -> (LastOperation, LastError) {
    let state = if fatal {
        LastOperationState::Failed
    } else {
        LastOperationState::Error
    };
    let mut codes = determine_error_codes(&description);
    if fatal && !codes.contains(&ErrorCode::ConfigurationProblem) {
        codes.push(ErrorCode::ConfigurationProblem);
    }

    let operation = last_operation(operation, state, description.clone(), progress);
    let error = LastError {
        description,
        codes,
        last_update_time: Some(operation.last_update_time),
    };
    (operation, error)
}

pub fn reconcile_succeeded(operation: LastOperationType, description: String) -> LastOperation {
    last_operation(operation, LastOperationState::Succeeded, description, 100)
}

const UNAUTHORIZED: &[&str] = &[
    "unauthorized",
    "invalidclienttokenid",
    "signaturedoesnotmatch",
    "authfailure",
    "invalid_grant",
    "authentication failed",
];

const INSUFFICIENT_PRIVILEGES: &[&str] = &[
    "accessdenied",
    "access denied",
    "forbidden",
    "unauthorizedoperation",
    "not authorized to perform",
];

const QUOTA_EXCEEDED: &[&str] = &["limitexceeded", "quota", "toomanyrequests"];

const DEPENDENCIES: &[&str] = &[
    "dependencyviolation",
    "pendingverification",
    "optinrequired",
    "deleteconflict",
    "is already being used",
    "inusesubnetcannotbedeleted",
    "invalidcidrblock",
    "timeout while waiting for state to become",
];

const CONFIGURATION_PROBLEM: &[&str] = &[
    "invalid configuration",
    "invalidparametervalue",
    "invalidparametercombination",
    "malformed",
];

/// Error codes for a failure description, by case-insensitive substring match
pub fn determine_error_codes(description: &str) -> Vec<ErrorCode> {
    let text = description.to_lowercase();
    let table: [(&[&str], ErrorCode); 5] = [
        (UNAUTHORIZED, ErrorCode::InfraUnauthorized),
        (INSUFFICIENT_PRIVILEGES, ErrorCode::InfraInsufficientPrivileges),
        (QUOTA_EXCEEDED, ErrorCode::InfraQuotaExceeded),
        (DEPENDENCIES, ErrorCode::InfraDependencies),
        (CONFIGURATION_PROBLEM, ErrorCode::ConfigurationProblem),
    ];

    table
        .into_iter()
        .filter(|(patterns, _)| patterns.iter().any(|p| text.contains(p)))
        .map(|(_, code)| code)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s_client::MockKubeClient;
    use tfinfra_models::{InfrastructureConfig, InfrastructureSpec, SecretReference, Vpc};

    fn infra() -> Infrastructure {
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
                provider_config: InfrastructureConfig::default(),
            },
        );
        infra.metadata.namespace = Some("shoot--dev".to_string());
        infra.metadata.generation = Some(7);
        infra
    }

    #[test]
    fn test_determine_error_codes() {
        assert_eq!(
            determine_error_codes("UnauthorizedOperation: You are not authorized to perform this operation"),
            vec![ErrorCode::InfraUnauthorized, ErrorCode::InfraInsufficientPrivileges]
        );
        assert_eq!(
            determine_error_codes("VpcLimitExceeded: The maximum number of VPCs has been reached"),
            vec![ErrorCode::InfraQuotaExceeded]
        );
        assert_eq!(
            determine_error_codes("DependencyViolation: resource sg-1 has a dependent object"),
            vec![ErrorCode::InfraDependencies]
        );
        assert!(determine_error_codes("connection reset by peer").is_empty());
    }

    #[test]
    fn test_reconcile_error_state() {
        let (operation, error) =
            reconcile_error(LastOperationType::Reconcile, "apply: boom".to_string(), 50, false);
        assert_eq!(operation.state, LastOperationState::Error);
        assert_eq!(operation.progress, 50);
        assert_eq!(error.description, "apply: boom");

        let (operation, error) =
            reconcile_error(LastOperationType::Reconcile, "bad zones".to_string(), 80, true);
        assert_eq!(operation.state, LastOperationState::Failed);
        assert_eq!(error.codes, vec![ErrorCode::ConfigurationProblem]);
    }

    #[tokio::test]
    async fn test_error_write_sets_generation_and_description() {
        let mut client = MockKubeClient::new();
        client
            .expect_patch_infrastructure_status()
            .withf(|_, status| {
                let op = status.last_operation.as_ref().unwrap();
                let err = status.last_error.as_ref().unwrap();
                status.observed_generation == Some(7)
                    && op.operation_type == LastOperationType::Reconcile
                    && op.state == LastOperationState::Error
                    && err.description == "Failed to apply the terraform config: provider error: throttled"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let reporter = StatusReporter::new(Arc::new(client));
        reporter
            .error(
                &infra(),
                LastOperationType::Reconcile,
                "Failed to apply the terraform config",
                50,
                &Error::provider("throttled"),
            )
            .await;
    }

    #[tokio::test]
    async fn test_error_write_failure_is_swallowed() {
        let mut client = MockKubeClient::new();
        client
            .expect_patch_infrastructure_status()
            .times(1)
            .returning(|_, _| Err(Error::provider("api down")));

        let reporter = StatusReporter::new(Arc::new(client));
        reporter
            .error(&infra(), LastOperationType::Delete, "destroy", 60, &Error::provider("x"))
            .await;
    }

    #[tokio::test]
    async fn test_success_clears_error_and_keeps_provider_status() {
        let mut infra = infra();
        infra.status = Some(InfrastructureStatus {
            observed_generation: Some(6),
            last_operation: None,
            last_error: Some(LastError {
                description: "old".to_string(),
                codes: vec![],
                last_update_time: None,
            }),
            provider_status: Some(ProviderStatus {
                vpc: Vpc {
                    id: "vpc-1".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }),
        });

        let mut client = MockKubeClient::new();
        client
            .expect_patch_infrastructure_status()
            .withf(|_, status| {
                let op = status.last_operation.as_ref().unwrap();
                status.last_error.is_none()
                    && op.state == LastOperationState::Succeeded
                    && op.progress == 100
                    && status.observed_generation == Some(7)
                    && status.provider_status.as_ref().unwrap().vpc.id == "vpc-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let reporter = StatusReporter::new(Arc::new(client));
        reporter
            .success(&infra, LastOperationType::Delete, "Successfully deleted", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_success_write_failure_is_returned() {
        let mut client = MockKubeClient::new();
        client
            .expect_patch_infrastructure_status()
            .returning(|_, _| Err(Error::provider("api down")));

        let reporter = StatusReporter::new(Arc::new(client));
        let result = reporter
            .success(&infra(), LastOperationType::Reconcile, "ok", None)
            .await;
        assert!(result.is_err());
    }
}
