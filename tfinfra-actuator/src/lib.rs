//! tfinfra Actuator - Terraform-backed reconciliation of Infrastructure resources
//!
//! This crate provides the Terraformer (Terraform runs as Kubernetes Jobs) and the
//! actuator that drives it for `Infrastructure` resources, writing progress,
//! errors and the extracted provider status back into the resource status.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tfinfra_actuator::{
//!     Actuator, ActuatorConfig, AwsProviderFactory, KubeClientImpl, Terraformer, TerraformerSettings,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(infra: tfinfra_models::Infrastructure) -> tfinfra_actuator::Result<()> {
//! let client = tfinfra_actuator::k8s_client::get_k8s_client().await?;
//! let actuator = Actuator::new(ActuatorConfig {
//!     runner: Arc::new(Terraformer::new(client.clone())),
//!     kube: Arc::new(KubeClientImpl::new(client)),
//!     provider: Some(Arc::new(AwsProviderFactory)),
//!     settings: TerraformerSettings::default(),
//! });
//!
//! actuator.reconcile(&infra, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod actuator;
pub mod error;
pub mod k8s_client;
pub mod names;
pub mod provider;
pub mod status;
pub mod terraform;
pub mod terraformer;
pub mod types;

// Re-export key types for convenience
pub use actuator::{Actuator, ActuatorConfig, ZonedOutputs};
pub use error::{Error, Result};
pub use k8s_client::{KubeClient, KubeClientImpl};
pub use provider::{AwsProviderFactory, ProviderClient, ProviderClientFactory};
pub use status::StatusReporter;
pub use terraformer::{JobRunner, TerraformState, Terraformer};
pub use types::*;
