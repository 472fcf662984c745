//! Provider-side cleanup of dependents Terraform does not own
//!
//! Load balancers and their security groups are created by the cloud controller
//! manager inside the VPC, so `terraform destroy` cannot remove the VPC while
//! they exist. They are deleted up front, scoped to the VPC and the cluster.
//!
//! Clients are built per operation from the infrastructure's region and the
//! credentials in its secret, see [`ProviderClientFactory`].

pub mod aws;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::names::secrets;

pub use self::aws::AwsProviderFactory;

/// Static credentials read from the infrastructure's secret
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Read the access key pair from `data`, falling back to `stringData`
pub fn credentials_from_secret(secret: &Secret) -> Result<ProviderCredentials> {
    let value = |key: &str| -> Result<String> {
        if let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(key)) {
            return String::from_utf8(bytes.0.clone())
                .map_err(|_| Error::fatal(format!("secret key {} is not valid UTF-8", key)));
        }
        secret
            .string_data
            .as_ref()
            .and_then(|data| data.get(key))
            .cloned()
            .ok_or_else(|| Error::fatal(format!("secret is missing {}", key)))
    };

    Ok(ProviderCredentials {
        access_key_id: value(secrets::ACCESS_KEY_ID)?,
        secret_access_key: value(secrets::SECRET_ACCESS_KEY)?,
    })
}

/// Builds a [`ProviderClient`] for a region and a set of credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderClientFactory: Send + Sync {
    async fn client(
        &self,
        region: &str,
        credentials: &ProviderCredentials,
    ) -> Result<Arc<dyn ProviderClient>>;
}

/// Minimal provider API used before a destroy
///
/// Implementations must only return resources that belong to the given VPC and
/// are tagged for the given cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Names of the load balancers of the cluster in the VPC
    async fn list_load_balancers(&self, vpc_id: &str, cluster: &str) -> Result<Vec<String>>;

    async fn delete_load_balancer(&self, name: &str) -> Result<()>;

    /// Ids of the load balancer security groups of the cluster in the VPC
    async fn list_security_groups(&self, vpc_id: &str, cluster: &str) -> Result<Vec<String>>;

    async fn delete_security_group(&self, id: &str) -> Result<()>;
}

/// Delete the cluster's load balancers, then their security groups
///
/// Stops at the first failure.
pub async fn destroy_load_balancers_and_security_groups(
    provider: &dyn ProviderClient,
    vpc_id: &str,
    cluster: &str,
) -> Result<()> {
    for name in provider.list_load_balancers(vpc_id, cluster).await? {
        tracing::info!("Deleting load balancer {} in vpc {}", name, vpc_id);
        provider.delete_load_balancer(&name).await?;
    }

    for id in provider.list_security_groups(vpc_id, cluster).await? {
        tracing::info!("Deleting security group {} in vpc {}", id, vpc_id);
        provider.delete_security_group(&id).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use k8s_openapi::ByteString;
    use mockall::Sequence;

    #[tokio::test]
    async fn test_load_balancers_deleted_before_security_groups() {
        let mut provider = MockProviderClient::new();
        let mut seq = Sequence::new();

        provider
            .expect_list_load_balancers()
            .withf(|vpc, cluster| vpc == "vpc-1" && cluster == "shoot--dev")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec!["lb-1".to_string()]));
        provider
            .expect_delete_load_balancer()
            .withf(|name| name == "lb-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        provider
            .expect_list_security_groups()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec!["sg-1".to_string()]));
        provider
            .expect_delete_security_group()
            .withf(|id| id == "sg-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        destroy_load_balancers_and_security_groups(&provider, "vpc-1", "shoot--dev")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_stops_cleanup() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_list_load_balancers()
            .returning(|_, _| Ok(vec!["lb-1".to_string()]));
        provider
            .expect_delete_load_balancer()
            .returning(|_| Err(Error::provider("Throttling")));
        provider.expect_list_security_groups().never();

        let err = destroy_load_balancers_and_security_groups(&provider, "vpc-1", "shoot--dev")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_credentials_from_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([
                ("accessKeyID".to_string(), ByteString(b"AKIA".to_vec())),
                ("secretAccessKey".to_string(), ByteString(b"secret".to_vec())),
            ])),
            ..Default::default()
        };

        let credentials = credentials_from_secret(&secret).unwrap();
        assert_eq!(credentials.access_key_id, "AKIA");
        assert_eq!(credentials.secret_access_key, "secret");

        let debug = format!("{:?}", credentials);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("\"secret\""));
    }

    #[test]
    fn test_credentials_fall_back_to_string_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "accessKeyID".to_string(),
                ByteString(b"AKIA".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([(
                "secretAccessKey".to_string(),
                "from-string-data".to_string(),
            )])),
            ..Default::default()
        };

        let credentials = credentials_from_secret(&secret).unwrap();
        assert_eq!(credentials.secret_access_key, "from-string-data");
    }

    #[test]
    fn test_credentials_reject_invalid_utf8() {
        let secret = Secret {
            data: Some(BTreeMap::from([
                ("accessKeyID".to_string(), ByteString(vec![0xff, 0xfe])),
                ("secretAccessKey".to_string(), ByteString(b"secret".to_vec())),
            ])),
            ..Default::default()
        };

        let err = credentials_from_secret(&secret).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("accessKeyID"));
    }
}
