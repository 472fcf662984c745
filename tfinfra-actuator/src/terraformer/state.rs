//! Terraform state access
//!
//! The state is stored by the Terraformer job in the `<name>.<purpose>.tf-state`
//! ConfigMap. Both the v3 (`modules[].outputs`) and v4+ (`outputs`) layouts are
//! understood.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Raw Terraform state as persisted by the job
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerraformState {
    raw: String,
}

impl TerraformState {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// True when nothing was ever written to the state
    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// All root module outputs, rendered as strings
    ///
    /// String outputs are returned as-is, other types as compact JSON.
    pub fn outputs(&self) -> Result<BTreeMap<String, String>> {
        if self.is_empty() {
            return Ok(BTreeMap::new());
        }

        let state: Value = serde_json::from_str(&self.raw)?;
        let outputs = match state.get("outputs") {
            Some(outputs) => Some(outputs),
            None => root_module_outputs(&state),
        };

        let mut values = BTreeMap::new();
        if let Some(Value::Object(outputs)) = outputs {
            for (name, output) in outputs {
                let value = output.get("value").unwrap_or(output);
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                values.insert(name.clone(), value);
            }
        }

        Ok(values)
    }

    /// Look up the given output variables
    ///
    /// Fails with [`Error::VariablesNotFound`] if any key is missing; the error
    /// carries the keys that were found so callers can degrade gracefully.
    pub fn output_variables(&self, keys: &[String]) -> Result<BTreeMap<String, String>> {
        let outputs = self.outputs()?;

        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match outputs.get(key) {
                Some(value) => {
                    found.insert(key.clone(), value.clone());
                }
                None => missing.push(key.clone()),
            }
        }

        if missing.is_empty() {
            Ok(found)
        } else {
            Err(Error::VariablesNotFound { missing, found })
        }
    }
}

/// v3 states keep outputs per module; the root module has path `["root"]`
fn root_module_outputs(state: &Value) -> Option<&Value> {
    let modules = state.get("modules")?.as_array()?;
    modules
        .iter()
        .find(|m| {
            m.get("path")
                .and_then(|p| p.as_array())
                .map(|p| p.len() == 1 && p[0] == "root")
                .unwrap_or(false)
        })
        .or_else(|| modules.first())
        .and_then(|m| m.get("outputs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE_V4: &str = r#"{
        "version": 4,
        "terraform_version": "1.5.7",
        "outputs": {
            "vpc_id": { "value": "vpc-1", "type": "string" },
            "subnet-public-0": { "value": "subnet-a", "type": "string" },
            "zone_count": { "value": 2, "type": "number" }
        },
        "resources": []
    }"#;

    const STATE_V3: &str = r#"{
        "version": 3,
        "modules": [
            {
                "path": ["root"],
                "outputs": {
                    "vpc_id": { "sensitive": false, "type": "string", "value": "vpc-legacy" }
                },
                "resources": {}
            }
        ]
    }"#;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_reads_v4_outputs() {
        let state = TerraformState::new(STATE_V4);
        let outputs = state.outputs().unwrap();

        assert_eq!(outputs["vpc_id"], "vpc-1");
        assert_eq!(outputs["subnet-public-0"], "subnet-a");
        assert_eq!(outputs["zone_count"], "2");
    }

    #[test]
    fn test_reads_v3_root_module_outputs() {
        let state = TerraformState::new(STATE_V3);
        let values = state.output_variables(&keys(&["vpc_id"])).unwrap();
        assert_eq!(values["vpc_id"], "vpc-legacy");
    }

    #[test]
    fn test_missing_variables_carry_found_values() {
        let state = TerraformState::new(STATE_V4);
        let err = state
            .output_variables(&keys(&["vpc_id", "keyName", "nodesRole"]))
            .unwrap_err();

        match err {
            Error::VariablesNotFound { missing, found } => {
                assert_eq!(missing, vec!["keyName", "nodesRole"]);
                assert_eq!(found.len(), 1);
                assert_eq!(found["vpc_id"], "vpc-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_state_has_no_outputs() {
        let state = TerraformState::new("  \n");
        assert!(state.is_empty());
        assert!(state.outputs().unwrap().is_empty());
        assert!(state.output_variables(&keys(&["vpc_id"])).unwrap_err().is_variables_not_found());
    }

    #[test]
    fn test_corrupt_state_is_not_variables_not_found() {
        let state = TerraformState::new("{not json");
        let err = state.output_variables(&keys(&["vpc_id"])).unwrap_err();
        assert!(!err.is_variables_not_found());
        assert!(matches!(err, Error::Serialization(_)));
    }
}
