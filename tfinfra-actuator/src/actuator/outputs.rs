//! Terraform outputs to provider status

use std::collections::BTreeMap;

use tfinfra_models::{
    Ec2, Iam, InstanceProfile, ProviderStatus, Role, SecurityGroup, Subnet, SubnetPurpose, Vpc,
};

use crate::error::{Error, Result};
use crate::names::outputs;

const PURPOSE_NODES: &str = "nodes";

/// Subnet outputs keyed by zone index
///
/// Built from `subnet-node-<i>` and `subnet-public-<i>` outputs. Every index
/// must be a canonical integer below the number of zones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZonedOutputs {
    entries: BTreeMap<(usize, SubnetPurpose), String>,
    zones: Vec<String>,
}

impl ZonedOutputs {
    pub fn parse(values: &BTreeMap<String, String>, zones: &[String]) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for (key, value) in values {
            let (purpose, suffix) = if let Some(suffix) = key.strip_prefix(outputs::SUBNET_NODES_PREFIX) {
                (SubnetPurpose::Nodes, suffix)
            } else if let Some(suffix) = key.strip_prefix(outputs::SUBNET_PUBLIC_PREFIX) {
                (SubnetPurpose::Public, suffix)
            } else {
                continue;
            };

            let index = parse_zone_index(suffix)
                .ok_or_else(|| Error::fatal(format!("output {} has no valid zone index", key)))?;
            if index >= zones.len() {
                return Err(Error::fatal(format!(
                    "output {} refers to zone {} but only {} zones are configured",
                    key,
                    index,
                    zones.len()
                )));
            }

            entries.insert((index, purpose), value.clone());
        }

        Ok(Self {
            entries,
            zones: zones.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subnets ordered by zone index, nodes before public
    pub fn subnets(&self) -> Vec<Subnet> {
        self.entries
            .iter()
            .filter_map(|((index, purpose), id)| {
                Some(Subnet {
                    purpose: *purpose,
                    id: id.clone(),
                    zone: self.zones.get(*index)?.clone(),
                })
            })
            .collect()
    }
}

/// Digits only, without sign or leading zeros
fn parse_zone_index(suffix: &str) -> Option<usize> {
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if suffix.len() > 1 && suffix.starts_with('0') {
        return None;
    }
    suffix.parse().ok()
}

/// Build the provider status from whatever outputs are present
///
/// Only the VPC id is required; absent optional outputs leave their section empty.
pub fn provider_status(values: &BTreeMap<String, String>, zones: &[String]) -> Result<ProviderStatus> {
    let vpc_id = values
        .get(outputs::VPC_ID)
        .ok_or_else(|| Error::VariablesNotFound {
            missing: vec![outputs::VPC_ID.to_string()],
            found: values.clone(),
        })?;

    let subnets = ZonedOutputs::parse(values, zones)?.subnets();

    let security_groups = values
        .get(outputs::SECURITY_GROUPS_NODES)
        .map(|id| SecurityGroup {
            purpose: PURPOSE_NODES.to_string(),
            id: id.clone(),
        })
        .into_iter()
        .collect();

    let instance_profiles = values
        .get(outputs::IAM_INSTANCE_PROFILE_NODES)
        .map(|name| InstanceProfile {
            purpose: PURPOSE_NODES.to_string(),
            name: name.clone(),
        })
        .into_iter()
        .collect();

    let roles = values
        .get(outputs::NODES_ROLE)
        .map(|arn| Role {
            purpose: PURPOSE_NODES.to_string(),
            arn: arn.clone(),
        })
        .into_iter()
        .collect();

    Ok(ProviderStatus {
        vpc: Vpc {
            id: vpc_id.clone(),
            subnets,
            security_groups,
        },
        ec2: Ec2 {
            key_name: values.get(outputs::SSH_KEY_NAME).cloned().unwrap_or_default(),
        },
        iam: Iam {
            instance_profiles,
            roles,
        },
    })
}
