//! Shared test fixtures for the actuator verbs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tfinfra_models::{
    Infrastructure, InfrastructureConfig, InfrastructureSpec, InfrastructureStatus, Networks,
    SecretReference, VpcConfig,
};

use super::{Actuator, ActuatorConfig};
use crate::k8s_client::MockKubeClient;
use crate::provider::{MockProviderClientFactory, ProviderClient, ProviderClientFactory};
use crate::terraformer::MockJobRunner;
use crate::types::{JobOutcome, JobRunConfig, TerraformerSettings};

pub type Statuses = Arc<Mutex<Vec<InfrastructureStatus>>>;

pub fn infra(zones: &[&str]) -> Infrastructure {
    let cidrs = |base: u8| -> Vec<String> {
        (0..zones.len())
            .map(|i| format!("10.250.{}.0/24", base as usize + i))
            .collect()
    };

    let mut infra = Infrastructure::new(
        "infra",
        InfrastructureSpec {
            provider_type: "aws".to_string(),
            region: "eu-west-1".to_string(),
            secret_ref: SecretReference {
                namespace: "shoot--dev".to_string(),
                name: "cloudprovider".to_string(),
            },
            zones: zones.iter().map(|z| z.to_string()).collect(),
            ssh_public_key: None,
            provider_config: InfrastructureConfig {
                networks: Networks {
                    vpc: VpcConfig {
                        id: None,
                        cidr: Some("10.250.0.0/16".to_string()),
                    },
                    workers: cidrs(0),
                    public: cidrs(100),
                    internal: cidrs(200),
                },
            },
        },
    );
    infra.metadata.namespace = Some("shoot--dev".to_string());
    infra.metadata.generation = Some(4);
    infra
}

pub fn credentials_secret() -> Option<Secret> {
    Some(Secret {
        data: Some(BTreeMap::from([
            ("accessKeyID".to_string(), ByteString(b"AKIA".to_vec())),
            ("secretAccessKey".to_string(), ByteString(b"secret".to_vec())),
        ])),
        ..Default::default()
    })
}

/// Kube client that serves the given secret and records every status write
pub fn recording_kube(secret: Option<Secret>) -> (MockKubeClient, Statuses) {
    let statuses: Statuses = Arc::default();
    let mut kube = MockKubeClient::new();

    kube.expect_get_secret()
        .returning(move |_, _| Ok(secret.clone()));

    let recorded = statuses.clone();
    kube.expect_patch_infrastructure_status()
        .returning(move |_, status| {
            recorded.lock().unwrap().push(status.clone());
            Ok(())
        });

    (kube, statuses)
}

pub fn outcome(config: &JobRunConfig) -> JobOutcome {
    JobOutcome {
        job_name: config.key.job_name(),
        reused: false,
        duration: Duration::from_secs(1),
    }
}

/// Factory handing out `client` for the fixture region and credentials
pub fn provider_factory(client: Arc<dyn ProviderClient>) -> Arc<dyn ProviderClientFactory> {
    let mut factory = MockProviderClientFactory::new();
    factory
        .expect_client()
        .withf(|region, credentials| {
            region == "eu-west-1"
                && credentials.access_key_id == "AKIA"
                && credentials.secret_access_key == "secret"
        })
        .returning(move |_, _| Ok(client.clone()));
    Arc::new(factory)
}

pub fn actuator(
    runner: MockJobRunner,
    kube: MockKubeClient,
    provider: Option<Arc<dyn ProviderClient>>,
) -> Actuator {
    Actuator::new(ActuatorConfig {
        runner: Arc::new(runner),
        kube: Arc::new(kube),
        provider: provider.map(provider_factory),
        settings: TerraformerSettings::default(),
    })
}
