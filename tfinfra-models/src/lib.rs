//! Resource types for tfinfra
//!
//! The `Infrastructure` custom resource is the desired state the actuator reconciles.
//! Its status carries the last operation, the last error and the provider status
//! extracted from the Terraform state.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// Infrastructure Resource
// ============================================================================

/// Desired state of the cloud infrastructure for one cluster
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "tfinfra.io",
    version = "v1alpha1",
    kind = "Infrastructure",
    plural = "infrastructures",
    shortname = "infra",
    namespaced,
    status = "InfrastructureStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// Provider type (e.g., "aws")
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Region the infrastructure lives in
    pub region: String,
    /// Secret holding the provider credentials
    pub secret_ref: SecretReference,
    /// Availability zones, in the order used for zone-indexed outputs
    #[serde(default)]
    pub zones: Vec<String>,
    /// Public SSH key registered for the nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Provider specific network layout
    pub provider_config: InfrastructureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

/// Network layout requested for the infrastructure
///
/// The CIDR lists are positional: entry `i` belongs to `spec.zones[i]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureConfig {
    pub networks: Networks,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Networks {
    #[serde(default)]
    pub vpc: VpcConfig,
    /// Worker node CIDRs, one per zone
    #[serde(default)]
    pub workers: Vec<String>,
    /// Public (load balancer) CIDRs, one per zone
    #[serde(default)]
    pub public: Vec<String>,
    /// Internal CIDRs, one per zone
    #[serde(default)]
    pub internal: Vec<String>,
}

/// Either an existing VPC to reuse or the CIDR of a VPC to create
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
}

// ============================================================================
// Status
// ============================================================================

/// Observed state of the infrastructure
///
/// All fields are serialized (including `null`) so a merge patch of the whole
/// status clears fields that are no longer set, e.g. `lastError` after a success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
    #[serde(default)]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub provider_status: Option<ProviderStatus>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum LastOperationType {
    Reconcile,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    Error,
    Failed,
}

/// Outcome of the most recent reconcile or delete attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub operation_type: LastOperationType,
    pub state: LastOperationState,
    pub description: String,
    /// Progress in percent (0-100)
    pub progress: i32,
    pub last_update_time: DateTime<Utc>,
}

/// Error reported by the most recent failed attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    /// Always serialized so a merge patch replaces the codes of an older error
    #[serde(default)]
    pub codes: Vec<ErrorCode>,
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Well-known error categories derived from provider error messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum ErrorCode {
    #[serde(rename = "ERR_INFRA_UNAUTHORIZED")]
    InfraUnauthorized,
    #[serde(rename = "ERR_INFRA_INSUFFICIENT_PRIVILEGES")]
    InfraInsufficientPrivileges,
    #[serde(rename = "ERR_INFRA_QUOTA_EXCEEDED")]
    InfraQuotaExceeded,
    #[serde(rename = "ERR_INFRA_DEPENDENCIES")]
    InfraDependencies,
    #[serde(rename = "ERR_CONFIGURATION_PROBLEM")]
    ConfigurationProblem,
}

// ============================================================================
// Provider Status
// ============================================================================

/// Infrastructure outputs extracted from the Terraform state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub vpc: Vpc,
    pub ec2: Ec2,
    pub iam: Iam,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Vpc {
    pub id: String,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubnetPurpose {
    Nodes,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub purpose: SubnetPurpose,
    pub id: String,
    pub zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub purpose: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ec2 {
    #[serde(default)]
    pub key_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Iam {
    #[serde(default)]
    pub instance_profiles: Vec<InstanceProfile>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProfile {
    pub purpose: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub purpose: String,
    pub arn: String,
}
