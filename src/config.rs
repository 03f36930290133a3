//! File-based configuration loading for the IP allow-list.
//!
//! TOML is the sole config source; a missing or malformed file is fatal at
//! startup, never a per-connection error.

use std::path::Path;

use crate::admission::{AdmissionPolicy, AllowListConfig};
use crate::error::{DuoproxyError, Result};

pub fn load_admission_policy(path: &Path) -> Result<AdmissionPolicy> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| {
        DuoproxyError::ConfigurationError(format!(
            "reading allow-list file '{}': {e}",
            path.display()
        ))
    })?;
    load_admission_policy_from_str(&toml_str)
}

pub fn load_admission_policy_from_str(toml_str: &str) -> Result<AdmissionPolicy> {
    let raw: AllowListConfig = toml::from_str(toml_str)
        .map_err(|e| DuoproxyError::ConfigurationError(format!("parsing allow-list: {e}")))?;
    Ok(AdmissionPolicy::from_config(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_exact_host_form() {
        let policy = load_admission_policy_from_str(r#"allowed_ips = ["127.0.0.1"]"#).unwrap();
        assert!(policy.allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn loads_cidr_form() {
        let policy = load_admission_policy_from_str(
            r#"
            port = 1080
            [acl]
            ipv4 = ["127.0.0.0/8"]
            "#,
        )
        .unwrap();
        assert!(policy.allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        let err = load_admission_policy_from_str("not valid toml {{{").unwrap_err();
        assert!(matches!(err, DuoproxyError::ConfigurationError(_)));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = load_admission_policy(Path::new("/nonexistent/duoproxy/allowed_ips.toml")).unwrap_err();
        assert!(matches!(err, DuoproxyError::ConfigurationError(_)));
    }
}
