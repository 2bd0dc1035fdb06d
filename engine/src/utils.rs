//! Utility functions

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Image tag grammar from the OCI distribution spec
const IMAGE_TAG: &str = r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$";

/// Version information for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Substitute `{name}` placeholders in a template
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Reject versions that are not valid image tags.
///
/// The version ends up in shell command lines, so nothing outside the tag
/// alphabet may pass.
pub fn validate_version(version: &str) -> Result<(), DeployError> {
    let tag_re = Regex::new(IMAGE_TAG).map_err(|e| DeployError::Internal(e.to_string()))?;
    if tag_re.is_match(version) {
        Ok(())
    } else {
        Err(DeployError::Configuration(format!(
            "version {:?} is not a valid image tag",
            version
        )))
    }
}
