//! Directory session abstraction
//!
//! A thin seam over `ldap3` so the reconciler can be exercised against an
//! in-memory directory in tests. One session owns one bound connection and
//! is used strictly sequentially.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope, SearchEntry};
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// LDAP result codes this client distinguishes.
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_INSUFFICIENT_ACCESS: u32 = 50;

/// A directory entry: DN plus string-valued attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name.
    pub dn: String,
    /// Attribute name to values. Multi-valued attributes keep all values.
    pub attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Create an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: HashMap::new(),
        }
    }

    /// First value of an attribute, if present.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attrs
            .get(attr)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of an attribute; empty when the attribute is absent.
    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs.get(attr).map_or(&[], Vec::as_slice)
    }

    /// Whether the attribute carries the given value.
    ///
    /// Comparison is ASCII case-insensitive, matching how directories treat
    /// objectClass values.
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.values(attr)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
    }
}

/// A single attribute-level change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Add values to an attribute.
    Add(String, Vec<String>),
    /// Replace all values of an attribute. An empty value list clears it.
    Replace(String, Vec<String>),
    /// Delete values from an attribute. An empty value list removes it entirely.
    Delete(String, Vec<String>),
}

impl Modification {
    fn into_mod(self) -> Mod<String> {
        match self {
            Modification::Add(attr, values) => Mod::Add(attr, values.into_iter().collect()),
            Modification::Replace(attr, values) => Mod::Replace(attr, values.into_iter().collect()),
            Modification::Delete(attr, values) => Mod::Delete(attr, values.into_iter().collect()),
        }
    }
}

/// Sequential session against a directory.
///
/// Implemented by [`LdapSession`] for real directories and by mocks in tests.
#[async_trait]
pub trait DirectorySession: Send {
    /// Subtree search under `base`. No matches is an empty vec, not an error.
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> SyncResult<Vec<DirectoryEntry>>;

    /// Apply attribute changes to the entry at `dn`.
    async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> SyncResult<()>;

    /// Release the session. Must be called exactly once at end of run.
    async fn unbind(&mut self) -> SyncResult<()>;
}

/// Escape special characters in LDAP filter values (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Escape special characters in DN attribute values (RFC 4514).
///
/// DN escaping differs from filter escaping: `, + " \ < > ; =` always take a
/// backslash prefix, NUL is hex-escaped, and space/`#` need escaping only in
/// leading or trailing position.
pub fn escape_dn_value(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let char_count = value.chars().count();
    let mut result = String::with_capacity(value.len() * 2);

    for (i, ch) in value.chars().enumerate() {
        let is_first = i == 0;
        let is_last = i == char_count - 1;

        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }

    result
}

/// Directory session backed by `ldap3`.
pub struct LdapSession {
    ldap: Ldap,
    timeout: Duration,
}

impl LdapSession {
    /// Connect and bind using the given configuration.
    #[instrument(skip(config), fields(uri = %config.uri, bind_dn = %config.bind_dn))]
    pub async fn connect(config: &SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let timeout = Duration::from_secs(config.operation_timeout_secs);

        debug!("connecting to directory");

        let settings = LdapConnSettings::new().set_conn_timeout(timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &config.uri)
            .await
            .map_err(|e| {
                SyncError::unavailable_with_source(
                    format!("failed to connect to {}", config.uri),
                    e,
                )
            })?;

        // Drive the connection in the background for the lifetime of the session.
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let password = config.bind_password.as_deref().unwrap_or("");
        let result = tokio::time::timeout(timeout, ldap.simple_bind(&config.bind_dn, password))
            .await
            .map_err(|_| SyncError::OperationTimeout {
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|e| {
                SyncError::unavailable_with_source(
                    format!("bind failed for {}", config.bind_dn),
                    e,
                )
            })?;

        if result.rc == RC_INVALID_CREDENTIALS {
            return Err(SyncError::AuthenticationFailed);
        }
        if result.rc != 0 {
            return Err(SyncError::operation_failed(format!(
                "bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        info!("directory session established");

        Ok(Self { ldap, timeout })
    }

    fn map_result_code(operation: &str, dn: &str, rc: u32, text: &str) -> SyncError {
        match rc {
            RC_NO_SUCH_OBJECT => SyncError::ObjectNotFound { dn: dn.to_string() },
            RC_INVALID_CREDENTIALS => SyncError::AuthenticationFailed,
            RC_INSUFFICIENT_ACCESS => SyncError::PermissionDenied {
                operation: operation.to_string(),
                dn: dn.to_string(),
            },
            _ => SyncError::operation_failed(format!(
                "{operation} on '{dn}' failed with code {rc}: {text}"
            )),
        }
    }

    fn map_ldap_error(operation: &str, dn: &str, err: LdapError) -> SyncError {
        match err {
            LdapError::LdapResult { result } => {
                Self::map_result_code(operation, dn, result.rc, &result.text)
            }
            e => SyncError::unavailable_with_source(format!("{operation} on '{dn}' failed"), e),
        }
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    #[instrument(skip(self, attrs))]
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> SyncResult<Vec<DirectoryEntry>> {
        let timeout = self.timeout;

        let result = tokio::time::timeout(
            timeout,
            self.ldap.search(base, Scope::Subtree, filter, attrs.to_vec()),
        )
        .await
        .map_err(|_| SyncError::OperationTimeout {
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|e| Self::map_ldap_error("search", base, e))?;

        let (entries, _res) = result
            .success()
            .map_err(|e| Self::map_ldap_error("search", base, e))?;

        let entries: Vec<DirectoryEntry> = entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|e| DirectoryEntry {
                dn: e.dn,
                attrs: e.attrs,
            })
            .collect();

        debug!(base, filter, count = entries.len(), "search completed");

        Ok(entries)
    }

    #[instrument(skip(self, changes))]
    async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> SyncResult<()> {
        let timeout = self.timeout;

        let mods: Vec<Mod<String>> = changes.into_iter().map(Modification::into_mod).collect();

        let result = tokio::time::timeout(timeout, self.ldap.modify(dn, mods))
            .await
            .map_err(|_| SyncError::OperationTimeout {
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|e| Self::map_ldap_error("modify", dn, e))?;

        if result.rc != 0 {
            return Err(Self::map_result_code("modify", dn, result.rc, &result.text));
        }

        debug!(dn, "modify applied");

        Ok(())
    }

    async fn unbind(&mut self) -> SyncResult<()> {
        self.ldap
            .unbind()
            .await
            .map_err(|e| SyncError::unavailable_with_source("unbind failed", e))?;
        debug!("directory session released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("alice"), "alice");
        assert_eq!(escape_filter_value("ali*ce"), "ali\\2ace");
        assert_eq!(escape_filter_value("(admin)"), "\\28admin\\29");
        assert_eq!(escape_filter_value("a\\b"), "a\\5cb");
        assert_eq!(escape_filter_value("a\0b"), "a\\00b");
    }

    #[test]
    fn test_escape_dn_value_simple() {
        assert_eq!(escape_dn_value("Alice Example"), "Alice Example");
        assert_eq!(escape_dn_value(""), "");
    }

    #[test]
    fn test_escape_dn_value_special_chars() {
        assert_eq!(escape_dn_value("a,b"), "a\\,b");
        assert_eq!(escape_dn_value("a+b"), "a\\+b");
        assert_eq!(escape_dn_value("a\"b"), "a\\\"b");
        assert_eq!(escape_dn_value("a\\b"), "a\\\\b");
        assert_eq!(escape_dn_value("a<b>c"), "a\\<b\\>c");
        assert_eq!(escape_dn_value("a;b=c"), "a\\;b\\=c");
    }

    #[test]
    fn test_escape_dn_value_positional() {
        assert_eq!(escape_dn_value(" alice"), "\\20alice");
        assert_eq!(escape_dn_value("alice "), "alice\\20");
        assert_eq!(escape_dn_value("#alice"), "\\23alice");
        assert_eq!(escape_dn_value("ali ce#1"), "ali ce#1");
    }

    #[test]
    fn test_escape_dn_value_injection_attempt() {
        assert_eq!(
            escape_dn_value("alice,dc=evil,dc=com"),
            "alice\\,dc\\=evil\\,dc\\=com"
        );
    }

    #[test]
    fn test_entry_accessors() {
        let mut entry = DirectoryEntry::new("cn=eng,ou=groups,dc=example,dc=com");
        entry.attrs.insert(
            "memberUid".to_string(),
            vec!["alice".to_string(), "bob".to_string()],
        );
        entry
            .attrs
            .insert("objectClass".to_string(), vec!["posixGroup".to_string()]);

        assert_eq!(entry.first("memberUid"), Some("alice"));
        assert_eq!(entry.values("memberUid").len(), 2);
        assert!(entry.values("description").is_empty());
        assert_eq!(entry.first("description"), None);
    }

    #[test]
    fn test_has_value_case_insensitive() {
        let mut entry = DirectoryEntry::new("cn=alice,ou=people,dc=example,dc=com");
        entry.attrs.insert(
            "objectClass".to_string(),
            vec!["inetOrgPerson".to_string(), "posixGrpFlt".to_string()],
        );

        assert!(entry.has_value("objectClass", "posixGrpFlt"));
        assert!(entry.has_value("objectClass", "POSIXGRPFLT"));
        assert!(entry.has_value("objectClass", "inetorgperson"));
        assert!(!entry.has_value("objectClass", "posixAccount"));
    }

    #[test]
    fn test_modification_into_mod() {
        let m = Modification::Replace(
            "pgMemberOf".to_string(),
            vec!["cn=eng,ou=groups,dc=x".to_string()],
        );
        match m.into_mod() {
            Mod::Replace(attr, values) => {
                assert_eq!(attr, "pgMemberOf");
                assert!(values.contains("cn=eng,ou=groups,dc=x"));
            }
            _ => panic!("expected Replace"),
        }

        // Clearing an attribute is a replace with no values.
        let clear = Modification::Replace("pgMemberOf".to_string(), vec![]);
        match clear.into_mod() {
            Mod::Replace(_, values) => assert!(values.is_empty()),
            _ => panic!("expected Replace"),
        }
    }
}
