use std::{fs, path::Path};

use super::Policy;
use crate::error::ConfigError;

/// Load and validate a policy document. `.json` files are read as JSON, anything
/// else as YAML.
pub fn load_policy(path: &Path) -> Result<Policy, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::PolicyRead {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let policy: Policy = if is_json {
        serde_json::from_str(&raw).map_err(|err| parse_error(path, err))?
    } else {
        serde_yaml::from_str(&raw).map_err(|err| parse_error(path, err))?
    };
    policy.validate()?;
    Ok(policy)
}

fn parse_error(path: &Path, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::PolicyParse {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
