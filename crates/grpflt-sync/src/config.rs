//! Sync configuration
//!
//! Connection parameters and schema attribute names for a reconciliation run.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Configuration for a reconciliation run.
#[derive(Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// LDAP URI (e.g., "ldap://ldap.example.com:389").
    pub uri: String,

    /// Bind DN with permission to read groups and modify persons.
    pub bind_dn: String,

    /// Bind password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Base DN for all searches (e.g., "dc=example,dc=com").
    pub base_dn: String,

    /// Persons OU, relative to `base_dn` (e.g., "ou=people").
    pub persons_ou: String,

    /// Deadline for each directory operation, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Number of retries for transient failures during group discovery.
    #[serde(default = "default_discovery_retries")]
    pub discovery_retries: u32,

    /// Base delay for discovery retry backoff, in milliseconds. Doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Object class identifying group entries.
    #[serde(default = "default_group_object_class")]
    pub group_object_class: String,

    /// Multi-valued attribute holding member uids on group entries.
    #[serde(default = "default_member_attribute")]
    pub member_attribute: String,

    /// Object classes identifying person entries (matched as an OR).
    #[serde(default = "default_person_object_classes")]
    pub person_object_classes: Vec<String>,

    /// Naming attribute used to derive person write DNs.
    #[serde(default = "default_name_attribute")]
    pub name_attribute: String,

    /// Unique identifier attribute on person entries.
    #[serde(default = "default_uid_attribute")]
    pub uid_attribute: String,

    /// Auxiliary object class required before the membership attribute is valid.
    #[serde(default = "default_marker_object_class")]
    pub marker_object_class: String,

    /// Multi-valued attribute caching the group DNs a person belongs to.
    #[serde(default = "default_membership_attribute")]
    pub membership_attribute: String,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("uri", &self.uri)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("base_dn", &self.base_dn)
            .field("persons_ou", &self.persons_ou)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .field("discovery_retries", &self.discovery_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("group_object_class", &self.group_object_class)
            .field("member_attribute", &self.member_attribute)
            .field("person_object_classes", &self.person_object_classes)
            .field("name_attribute", &self.name_attribute)
            .field("uid_attribute", &self.uid_attribute)
            .field("marker_object_class", &self.marker_object_class)
            .field("membership_attribute", &self.membership_attribute)
            .finish()
    }
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_discovery_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_group_object_class() -> String {
    "posixGroup".to_string()
}

fn default_member_attribute() -> String {
    "memberUid".to_string()
}

fn default_person_object_classes() -> Vec<String> {
    vec!["inetOrgPerson".to_string(), "posixAccount".to_string()]
}

fn default_name_attribute() -> String {
    "cn".to_string()
}

fn default_uid_attribute() -> String {
    "uid".to_string()
}

fn default_marker_object_class() -> String {
    "posixGrpFlt".to_string()
}

fn default_membership_attribute() -> String {
    "pgMemberOf".to_string()
}

impl SyncConfig {
    /// Create a new config with required fields and default schema names.
    pub fn new(
        uri: impl Into<String>,
        bind_dn: impl Into<String>,
        base_dn: impl Into<String>,
        persons_ou: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            bind_dn: bind_dn.into(),
            bind_password: None,
            base_dn: base_dn.into(),
            persons_ou: persons_ou.into(),
            operation_timeout_secs: default_operation_timeout_secs(),
            discovery_retries: default_discovery_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            group_object_class: default_group_object_class(),
            member_attribute: default_member_attribute(),
            person_object_classes: default_person_object_classes(),
            name_attribute: default_name_attribute(),
            uid_attribute: default_uid_attribute(),
            marker_object_class: default_marker_object_class(),
            membership_attribute: default_membership_attribute(),
        }
    }

    /// Set the bind password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.bind_password = Some(password.into());
        self
    }

    /// Set the per-operation timeout.
    #[must_use]
    pub fn with_operation_timeout_secs(mut self, secs: u64) -> Self {
        self.operation_timeout_secs = secs;
        self
    }

    /// Set the discovery retry budget.
    #[must_use]
    pub fn with_discovery_retries(mut self, retries: u32) -> Self {
        self.discovery_retries = retries;
        self
    }

    /// Get the search base for person entries.
    #[must_use]
    pub fn persons_base(&self) -> String {
        format!("{},{}", self.persons_ou, self.base_dn)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.uri.is_empty() {
            return Err(SyncError::invalid_configuration("uri is required"));
        }

        if !self.uri.starts_with("ldap://") && !self.uri.starts_with("ldaps://") {
            return Err(SyncError::invalid_configuration(format!(
                "uri must start with ldap:// or ldaps://, got '{}'",
                self.uri
            )));
        }

        if self.bind_dn.is_empty() {
            return Err(SyncError::invalid_configuration("bind_dn is required"));
        }

        if self.base_dn.is_empty() {
            return Err(SyncError::invalid_configuration("base_dn is required"));
        }

        if self.persons_ou.is_empty() {
            return Err(SyncError::invalid_configuration("persons_ou is required"));
        }

        if self.operation_timeout_secs == 0 {
            return Err(SyncError::invalid_configuration(
                "operation_timeout_secs must be greater than zero",
            ));
        }

        if self.person_object_classes.is_empty() {
            return Err(SyncError::invalid_configuration(
                "at least one person object class is required",
            ));
        }

        Ok(())
    }

    /// Copy of this config with the password redacted, safe for logging.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.bind_password.is_some() {
            config.bind_password = Some("***REDACTED***".to_string());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SyncConfig {
        SyncConfig::new(
            "ldap://ldap.example.com:389",
            "cn=admin,dc=example,dc=com",
            "dc=example,dc=com",
            "ou=people",
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = base_config();

        assert_eq!(config.group_object_class, "posixGroup");
        assert_eq!(config.member_attribute, "memberUid");
        assert_eq!(
            config.person_object_classes,
            vec!["inetOrgPerson", "posixAccount"]
        );
        assert_eq!(config.marker_object_class, "posixGrpFlt");
        assert_eq!(config.membership_attribute, "pgMemberOf");
        assert_eq!(config.operation_timeout_secs, 30);
    }

    #[test]
    fn test_persons_base() {
        let config = base_config();
        assert_eq!(config.persons_base(), "ou=people,dc=example,dc=com");
    }

    #[test]
    fn test_validation() {
        assert!(base_config().validate().is_ok());

        let empty_uri = SyncConfig::new("", "cn=admin,dc=x", "dc=x", "ou=people");
        assert!(empty_uri.validate().is_err());

        let bad_scheme = SyncConfig::new("http://x", "cn=admin,dc=x", "dc=x", "ou=people");
        assert!(bad_scheme.validate().is_err());

        let empty_bind = SyncConfig::new("ldap://x", "", "dc=x", "ou=people");
        assert!(empty_bind.validate().is_err());

        let zero_timeout = base_config().with_operation_timeout_secs(0);
        assert!(zero_timeout.validate().is_err());

        let mut no_classes = base_config();
        no_classes.person_object_classes.clear();
        assert!(no_classes.validate().is_err());
    }

    #[test]
    fn test_redacted() {
        let config = base_config().with_password("super-secret");
        let redacted = config.redacted();
        assert_eq!(redacted.bind_password, Some("***REDACTED***".to_string()));

        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***REDACTED***"));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = base_config().with_password("secret");

        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.uri, "ldap://ldap.example.com:389");
        assert_eq!(parsed.persons_ou, "ou=people");
        assert_eq!(parsed.membership_attribute, "pgMemberOf");
    }

    #[test]
    fn test_deserialize_defaults_applied() {
        let json = r#"{
            "uri": "ldap://localhost:389",
            "bind_dn": "cn=admin,dc=example,dc=com",
            "base_dn": "dc=example,dc=com",
            "persons_ou": "ou=people"
        }"#;

        let parsed: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.group_object_class, "posixGroup");
        assert_eq!(parsed.discovery_retries, 3);
        assert!(parsed.bind_password.is_none());
    }
}
