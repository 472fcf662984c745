//! AWS implementation of the provider client
//!
//! Load balancers are classic ELBs created for `LoadBalancer` services; their
//! security groups carry the `k8s-elb-` name prefix. Both are matched by VPC and
//! by the `kubernetes.io/cluster/<cluster>` tag.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::{Credentials, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{Filter, SecurityGroup};
use aws_sdk_elasticloadbalancing::types::LoadBalancerDescription;

use super::{ProviderClient, ProviderClientFactory, ProviderCredentials};
use crate::error::{Error, Result};
use crate::names::provider::{
    CLUSTER_TAG_OWNED, CLUSTER_TAG_PREFIX, CREDENTIALS_SOURCE, LOAD_BALANCER_GROUP_PREFIX,
};

/// `DescribeTags` accepts at most this many load balancer names per call
const DESCRIBE_TAGS_BATCH: usize = 20;

const SECURITY_GROUP_NOT_FOUND: &str = "InvalidGroup.NotFound";

/// Tag key marking resources of a cluster
pub fn cluster_tag_key(cluster: &str) -> String {
    format!("{}{}", CLUSTER_TAG_PREFIX, cluster)
}

fn provider_error<E: std::error::Error>(error: E) -> Error {
    Error::provider(DisplayErrorContext(error).to_string())
}

/// Names of the load balancers placed in the VPC
fn load_balancers_in_vpc(descriptions: &[LoadBalancerDescription], vpc_id: &str) -> Vec<String> {
    descriptions
        .iter()
        .filter(|lb| lb.vpc_id() == Some(vpc_id))
        .filter_map(|lb| lb.load_balancer_name().map(str::to_string))
        .collect()
}

/// Ids of the groups created for load balancers
fn load_balancer_groups(groups: &[SecurityGroup]) -> Vec<String> {
    groups
        .iter()
        .filter(|group| {
            group
                .group_name()
                .is_some_and(|name| name.starts_with(LOAD_BALANCER_GROUP_PREFIX))
        })
        .filter_map(|group| group.group_id().map(str::to_string))
        .collect()
}

/// Builds [`AwsProviderClient`]s from static credentials
pub struct AwsProviderFactory;

#[async_trait]
impl ProviderClientFactory for AwsProviderFactory {
    async fn client(
        &self,
        region: &str,
        credentials: &ProviderCredentials,
    ) -> Result<Arc<dyn ProviderClient>> {
        Ok(Arc::new(AwsProviderClient::new(region, credentials).await))
    }
}

/// EC2 and ELB clients for one region and one set of credentials
pub struct AwsProviderClient {
    ec2: aws_sdk_ec2::Client,
    elb: aws_sdk_elasticloadbalancing::Client,
}

impl AwsProviderClient {
    pub async fn new(region: &str, credentials: &ProviderCredentials) -> Self {
        let credentials = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_SOURCE,
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        Self {
            ec2: aws_sdk_ec2::Client::new(&config),
            elb: aws_sdk_elasticloadbalancing::Client::new(&config),
        }
    }

    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancerDescription>> {
        let mut descriptions = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .elb
                .describe_load_balancers()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(provider_error)?;

            descriptions.extend_from_slice(page.load_balancer_descriptions());
            match page.next_marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => return Ok(descriptions),
            }
        }
    }
}

#[async_trait]
impl ProviderClient for AwsProviderClient {
    async fn list_load_balancers(&self, vpc_id: &str, cluster: &str) -> Result<Vec<String>> {
        let candidates = load_balancers_in_vpc(&self.describe_load_balancers().await?, vpc_id);
        let tag_key = cluster_tag_key(cluster);

        let mut names = Vec::new();
        for batch in candidates.chunks(DESCRIBE_TAGS_BATCH) {
            let tags = self
                .elb
                .describe_tags()
                .set_load_balancer_names(Some(batch.to_vec()))
                .send()
                .await
                .map_err(provider_error)?;

            for description in tags.tag_descriptions() {
                if description.tags().iter().any(|tag| tag.key() == tag_key) {
                    if let Some(name) = description.load_balancer_name() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        self.elb
            .delete_load_balancer()
            .load_balancer_name(name)
            .send()
            .await
            .map_err(provider_error)?;
        Ok(())
    }

    async fn list_security_groups(&self, vpc_id: &str, cluster: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .ec2
                .describe_security_groups()
                .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
                .filters(
                    Filter::builder()
                        .name(format!("tag:{}", cluster_tag_key(cluster)))
                        .values(CLUSTER_TAG_OWNED)
                        .build(),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(provider_error)?;

            ids.extend(load_balancer_groups(page.security_groups()));
            match page.next_token() {
                Some(next) if !next.is_empty() => next_token = Some(next.to_string()),
                _ => return Ok(ids),
            }
        }
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        match self.ec2.delete_security_group().group_id(id).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(SECURITY_GROUP_NOT_FOUND) => {
                tracing::info!("Security group {} already gone", id);
                Ok(())
            }
            Err(e) => Err(provider_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_balancer(name: &str, vpc_id: Option<&str>) -> LoadBalancerDescription {
        LoadBalancerDescription::builder()
            .load_balancer_name(name)
            .set_vpc_id(vpc_id.map(str::to_string))
            .build()
    }

    fn security_group(id: &str, name: &str) -> SecurityGroup {
        SecurityGroup::builder().group_id(id).group_name(name).build()
    }

    #[test]
    fn test_cluster_tag_key() {
        assert_eq!(cluster_tag_key("shoot--dev"), "kubernetes.io/cluster/shoot--dev");
    }

    #[test]
    fn test_load_balancers_outside_the_vpc_are_skipped() {
        let descriptions = vec![
            load_balancer("a1", Some("vpc-1")),
            load_balancer("b2", Some("vpc-2")),
            load_balancer("classic", None),
            load_balancer("c3", Some("vpc-1")),
        ];

        assert_eq!(load_balancers_in_vpc(&descriptions, "vpc-1"), vec!["a1", "c3"]);
        assert!(load_balancers_in_vpc(&descriptions, "vpc-9").is_empty());
    }

    #[test]
    fn test_only_load_balancer_groups_are_selected() {
        let groups = vec![
            security_group("sg-1", "k8s-elb-a1"),
            security_group("sg-2", "shoot--dev-nodes"),
            SecurityGroup::builder().group_name("k8s-elb-no-id").build(),
        ];

        assert_eq!(load_balancer_groups(&groups), vec!["sg-1"]);
    }
}
