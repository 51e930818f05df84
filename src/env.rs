//! Environment variable substitution for configuration values
//!
//! Secrets (access keys, app secrets, passwords) are referenced from the
//! configuration file as `${VAR_NAME}` and substituted before parsing, so
//! credential material never has to be written into the file itself.

use std::env;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, StorageError};

/// Regex pattern for matching environment variable references: ${VAR_NAME}
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Substitute environment variable references in a string.
///
/// All missing variables are collected and reported in one error, so a
/// misconfigured deployment is fixed in a single round trip.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let mut result = input.to_string();

    for caps in ENV_VAR_PATTERN.captures_iter(input) {
        let full_match = &caps[0];
        let var_name = &caps[1];

        match env::var(var_name) {
            Ok(value) => {
                result = result.replace(full_match, &value);
            }
            Err(_) => {
                if !missing.contains(&var_name.to_string()) {
                    missing.push(var_name.to_string());
                }
            }
        }
    }

    if !missing.is_empty() {
        return Err(StorageError::Config(format!(
            "missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_known_variable() {
        env::set_var("EXTMOUNT_ENV_TEST_KEY", "AKIA123");
        let out = substitute_env_vars("access_key: ${EXTMOUNT_ENV_TEST_KEY}").unwrap();
        assert_eq!(out, "access_key: AKIA123");
    }

    #[test]
    fn test_no_references_passthrough() {
        let out = substitute_env_vars("bucket: docs").unwrap();
        assert_eq!(out, "bucket: docs");
    }

    #[test]
    fn test_collects_all_missing_variables() {
        let err = substitute_env_vars("a: ${EXTMOUNT_MISSING_A}\nb: ${EXTMOUNT_MISSING_B}")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("EXTMOUNT_MISSING_A"));
        assert!(msg.contains("EXTMOUNT_MISSING_B"));
    }

    #[test]
    fn test_duplicate_reference_reported_once() {
        let err =
            substitute_env_vars("a: ${EXTMOUNT_MISSING_C}\nb: ${EXTMOUNT_MISSING_C}").unwrap_err();
        let msg = err.to_string();
        assert_eq!(msg.matches("EXTMOUNT_MISSING_C").count(), 1);
    }
}
