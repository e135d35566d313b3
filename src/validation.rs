//! Name validation for roles and lease ids.
//!
//! Role names and lease ids become storage path segments and cloud display
//! names, so anything that could escape a path or a display name is rejected.

use crate::{AzSecretsError, Result};

/// Characters rejected in role names: path separators, characters reserved
/// in URLs and storage keys, list wildcards and quotes.
const FORBIDDEN_CHARS: &str = "/\\;|&$`<>(){}[]!*?~#%^\"'";

/// Maximum allowed length for a role name.
const MAX_NAME_LENGTH: usize = 255;

/// Validates a role name.
///
/// Rejects:
/// - Empty names
/// - Names longer than 255 characters
/// - Control characters (including null bytes)
/// - Path separators, URL-reserved characters, wildcards and quotes
///
/// # Errors
///
/// Returns [`AzSecretsError::InvalidConfiguration`] if validation fails.
///
/// # Example
///
/// ```
/// use azsecrets::validation::validate_role_name;
///
/// assert!(validate_role_name("web-app").is_ok());
/// assert!(validate_role_name("reader_prod.eu").is_ok());
///
/// assert!(validate_role_name("").is_err());
/// assert!(validate_role_name("../config").is_err());
/// assert!(validate_role_name("web?version=2").is_err());
/// ```
pub fn validate_role_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AzSecretsError::invalid("role name cannot be empty"));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(AzSecretsError::invalid(format!(
            "role name exceeds maximum length of {} characters",
            MAX_NAME_LENGTH
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(AzSecretsError::invalid(
            "role name contains control characters",
        ));
    }

    if name.chars().any(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(AzSecretsError::invalid(format!(
            "role name contains forbidden characters (not allowed: {})",
            FORBIDDEN_CHARS
        )));
    }

    if name == "." || name == ".." {
        return Err(AzSecretsError::invalid("role name cannot be . or .."));
    }

    Ok(())
}

/// Validates a lease id: lease ids are generated UUIDs.
pub fn validate_lease_id(lease_id: &str) -> Result<()> {
    uuid::Uuid::parse_str(lease_id)
        .map(|_| ())
        .map_err(|_| AzSecretsError::invalid(format!("malformed lease id: {:?}", lease_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_role_name("web").is_ok());
        assert!(validate_role_name("API_READER_123").is_ok());
        assert!(validate_role_name("prod.storage.contributor").is_ok());
        assert!(validate_role_name("ops@example.com").is_ok());
    }

    #[test]
    fn test_empty_name() {
        let result = validate_role_name("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_too_long() {
        let result = validate_role_name(&"a".repeat(256));
        assert!(result.unwrap_err().to_string().contains("maximum length"));
        assert!(validate_role_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_control_characters() {
        for name in ["name\0null", "name\x01ctl", "line\nbreak", "tab\tbed"] {
            let err = validate_role_name(name).unwrap_err();
            assert!(err.to_string().contains("control"), "{:?}", name);
        }
    }

    #[test]
    fn test_forbidden_characters() {
        let names = [
            "roles/nested",
            "creds/../config",
            "..\\up",
            "web?version=2",
            "web#fragment",
            "web%2Fnested",
            "web&other",
            "web;param",
            "web*",
            "web[0]",
            "web{a,b}",
            "web(1)",
            "web<prod>",
            "web|ro",
            "web$1",
            "web`1`",
            "web!",
            "web~",
            "web^2",
            "web\"quoted\"",
            "web's",
        ];

        for name in names {
            let result = validate_role_name(name);
            assert!(
                matches!(result, Err(AzSecretsError::InvalidConfiguration(_))),
                "expected {:?} to fail validation",
                name
            );
        }
    }

    #[test]
    fn test_dot_names() {
        assert!(validate_role_name(".").is_err());
        assert!(validate_role_name("..").is_err());
        assert!(validate_role_name("...").is_ok());
    }

    #[test]
    fn test_lease_id() {
        assert!(validate_lease_id(&uuid::Uuid::new_v4().to_string()).is_ok());
        assert!(validate_lease_id("../config").is_err());
        assert!(validate_lease_id("").is_err());
    }
}
