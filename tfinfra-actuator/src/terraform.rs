//! Terraform inputs for an Infrastructure
//!
//! Renders `main.tf`, `variables.tf` and `terraform.tfvars` from the resource
//! spec and builds the job environment. Zone `i` of `spec.zones` owns entry `i`
//! of every CIDR list and the `*-<i>` outputs.

use std::collections::BTreeMap;

use kube::ResourceExt;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tera::{Context as TeraContext, Tera};
use tfinfra_models::{Infrastructure, SecretReference};

use crate::error::{Error, Result};
use crate::names::{outputs, secrets};
use crate::types::{TerraformFiles, VariableValue};

const MAIN_TF: &str = "infra/main.tf";
const VARIABLES_TF: &str = "infra/variables.tf";
const TFVARS: &str = "infra/terraform.tfvars";

static TEMPLATES: OnceCell<Tera> = OnceCell::new();

fn templates() -> Result<&'static Tera> {
    TEMPLATES.get_or_try_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (MAIN_TF, include_str!("templates/infra/main.tf")),
            (VARIABLES_TF, include_str!("templates/infra/variables.tf")),
            (TFVARS, include_str!("templates/infra/terraform.tfvars")),
        ])?;
        Ok(tera)
    })
}

/// CIDRs of one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneNetwork {
    pub name: String,
    pub worker: String,
    pub public: String,
    pub internal: String,
}

/// Pair each zone with its CIDRs
///
/// Fails with [`Error::Fatal`] when there are no zones, when a CIDR list is
/// shorter than the zone list or when the VPC is not exactly one of id or CIDR.
pub fn zone_networks(infra: &Infrastructure) -> Result<Vec<ZoneNetwork>> {
    let zones = &infra.spec.zones;
    let networks = &infra.spec.provider_config.networks;

    if zones.is_empty() {
        return Err(Error::fatal("spec.zones must not be empty"));
    }

    match (&networks.vpc.id, &networks.vpc.cidr) {
        (Some(_), None) | (None, Some(_)) => {}
        (Some(_), Some(_)) => {
            return Err(Error::fatal("networks.vpc: id and cidr are mutually exclusive"));
        }
        (None, None) => return Err(Error::fatal("networks.vpc: either id or cidr must be set")),
    }

    for (field, cidrs) in [
        ("workers", &networks.workers),
        ("public", &networks.public),
        ("internal", &networks.internal),
    ] {
        if cidrs.len() < zones.len() {
            return Err(Error::fatal(format!(
                "networks.{} has {} entries for {} zones",
                field,
                cidrs.len(),
                zones.len()
            )));
        }
    }

    Ok(zones
        .iter()
        .enumerate()
        .map(|(i, zone)| ZoneNetwork {
            name: zone.clone(),
            worker: networks.workers[i].clone(),
            public: networks.public[i].clone(),
            internal: networks.internal[i].clone(),
        })
        .collect())
}

/// Render the Terraform configuration for the infrastructure
pub fn render_files(infra: &Infrastructure) -> Result<TerraformFiles> {
    let zones = zone_networks(infra)?;
    let vpc = &infra.spec.provider_config.networks.vpc;
    let cluster_name = infra
        .namespace()
        .ok_or_else(|| Error::fatal("infrastructure has no namespace"))?;

    let mut ctx = TeraContext::new();
    ctx.insert("cluster_name", &cluster_name);
    ctx.insert("region", &infra.spec.region);
    ctx.insert("zones", &zones);
    ctx.insert("create_vpc", &vpc.id.is_none());
    ctx.insert("vpc_id", &vpc.id);
    ctx.insert("vpc_cidr", &vpc.cidr);
    ctx.insert("ssh_public_key", &infra.spec.ssh_public_key);
    ctx.insert("subnet_nodes_prefix", outputs::SUBNET_NODES_PREFIX);
    ctx.insert("subnet_public_prefix", outputs::SUBNET_PUBLIC_PREFIX);
    ctx.insert("output_vpc_id", outputs::VPC_ID);
    ctx.insert("output_key_name", outputs::SSH_KEY_NAME);
    ctx.insert("output_instance_profile_nodes", outputs::IAM_INSTANCE_PROFILE_NODES);
    ctx.insert("output_nodes_role", outputs::NODES_ROLE);
    ctx.insert("output_security_group_nodes", outputs::SECURITY_GROUPS_NODES);

    let tera = templates()?;
    Ok(TerraformFiles {
        main: tera.render(MAIN_TF, &ctx)?,
        variables: tera.render(VARIABLES_TF, &ctx)?,
        tfvars: tera.render(TFVARS, &ctx)?,
    })
}

/// Job environment: the credentials, straight from the referenced secret
pub fn variables_environment(secret_ref: &SecretReference) -> BTreeMap<String, VariableValue> {
    [
        ("TF_VAR_ACCESS_KEY_ID", secrets::ACCESS_KEY_ID),
        ("TF_VAR_SECRET_ACCESS_KEY", secrets::SECRET_ACCESS_KEY),
    ]
    .into_iter()
    .map(|(name, key)| {
        (
            name.to_string(),
            VariableValue::SecretKey {
                secret: secret_ref.name.clone(),
                key: key.to_string(),
            },
        )
    })
    .collect()
}

/// Output keys read after a successful apply
pub fn output_keys(zone_count: usize) -> Vec<String> {
    let mut keys: Vec<String> = [
        outputs::VPC_ID,
        outputs::SSH_KEY_NAME,
        outputs::IAM_INSTANCE_PROFILE_NODES,
        outputs::NODES_ROLE,
        outputs::SECURITY_GROUPS_NODES,
    ]
    .iter()
    .map(|k| k.to_string())
    .collect();

    for i in 0..zone_count {
        keys.push(format!("{}{}", outputs::SUBNET_NODES_PREFIX, i));
        keys.push(format!("{}{}", outputs::SUBNET_PUBLIC_PREFIX, i));
    }
    keys
}
