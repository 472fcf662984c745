use anyhow::{Context, Result};
use kube::CustomResourceExt;
use tfinfra_models::Infrastructure;

/// Print the Infrastructure CRD, ready for `kubectl apply -f -`
pub fn print_crd() -> Result<()> {
    print!("{}", crd_yaml()?);
    Ok(())
}

fn crd_yaml() -> Result<String> {
    serde_yaml::to_string(&Infrastructure::crd()).context("Failed to serialize the Infrastructure CRD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_yaml() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("name: infrastructures.tfinfra.io"));
        assert!(yaml.contains("kind: Infrastructure"));
    }
}
