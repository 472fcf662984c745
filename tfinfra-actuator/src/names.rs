//! Name constants for tfinfra
//!
//! Output keys, label keys and artifact names shared between the Terraform
//! templates, the Terraformer and the actuator.

/// Job purposes (the first component of a job key)
pub mod purposes {
    /// Infrastructure provisioning (VPC, subnets, IAM, security groups)
    pub const INFRA: &str = "infra";
}

/// Output variable names emitted by the infrastructure Terraform configuration
pub mod outputs {
    pub const VPC_ID: &str = "vpc_id";
    pub const SSH_KEY_NAME: &str = "keyName";
    pub const IAM_INSTANCE_PROFILE_NODES: &str = "iamInstanceProfileNodes";
    pub const NODES_ROLE: &str = "nodesRole";
    pub const SECURITY_GROUPS_NODES: &str = "security_group_nodes";

    /// Zone-indexed subnet outputs: `<prefix><zone index>`
    pub const SUBNET_NODES_PREFIX: &str = "subnet-node-";
    pub const SUBNET_PUBLIC_PREFIX: &str = "subnet-public-";
}

/// Keys expected in the credentials secret referenced by `spec.secretRef`
pub mod secrets {
    pub const ACCESS_KEY_ID: &str = "accessKeyID";
    pub const SECRET_ACCESS_KEY: &str = "secretAccessKey";
}

/// Tags and names the cloud controller manager gives the resources it creates
pub mod provider {
    /// Followed by the cluster name, i.e. the infrastructure namespace
    pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";
    pub const CLUSTER_TAG_OWNED: &str = "owned";
    pub const LOAD_BALANCER_GROUP_PREFIX: &str = "k8s-elb-";

    /// Provider name attached to static credentials from the secret
    pub const CREDENTIALS_SOURCE: &str = "tfinfra";
}

/// Names used for the Terraformer job and its artifacts
pub mod terraformer {
    pub const DEFAULT_IMAGE: &str = "ghcr.io/tfinfra/terraformer:v0.4.0";

    /// Field manager for server-side apply
    pub const FIELD_MANAGER: &str = "tfinfra-actuator";

    pub const SERVICE_ACCOUNT: &str = "terraformer";
    pub const ROLE: &str = "tfinfra:terraformer";

    pub const LABEL_PURPOSE: &str = "terraformer.tfinfra.io/purpose";
    pub const LABEL_NAME: &str = "terraformer.tfinfra.io/name";
    pub const ANNOTATION_COMMAND: &str = "terraformer.tfinfra.io/command";
    pub const ANNOTATION_CONFIG_HASH: &str = "terraformer.tfinfra.io/config-hash";

    pub const MAIN_TF: &str = "main.tf";
    pub const VARIABLES_TF: &str = "variables.tf";
    pub const TFVARS: &str = "terraform.tfvars";
    pub const STATE_KEY: &str = "terraform.tfstate";
}
