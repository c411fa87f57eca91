//! # grpflt-sync
//!
//! Reconciles the `pgMemberOf` attribute on LDAP person entries against the
//! authoritative `memberUid` lists of `posixGroup` entries, so that OpenLDAP
//! deployments can filter person searches by group membership.
//!
//! A run is a single sequential pass over one bound directory session:
//!
//! 1. Discover all POSIX groups under the base DN and their member uids.
//! 2. Invert that into a per-uid index of group DNs.
//! 3. For each uid: fetch the person entry, add the `posixGrpFlt` object
//!    class if missing, and replace `pgMemberOf` only when the stored set
//!    differs from the computed set.
//! 4. Clear `pgMemberOf` on persons that no longer appear in any group.
//!
//! Writes are addressed by the entry's cn-derived DN first, falling back to
//! the uid-derived DN when the directory disagrees about naming.
//!
//! ## Example
//!
//! ```ignore
//! use grpflt_sync::{LdapSession, Reconciler, SyncConfig};
//!
//! let config = SyncConfig::new(
//!     "ldap://ldap.example.com:389",
//!     "cn=admin,dc=example,dc=com",
//!     "dc=example,dc=com",
//!     "ou=people",
//! )
//! .with_password("secret");
//!
//! let session = LdapSession::connect(&config).await?;
//! let mut reconciler = Reconciler::new(session, config);
//! let report = reconciler.run().await?;
//! reconciler.close().await?;
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod reconciler;

// Re-exports
pub use config::SyncConfig;
pub use directory::{DirectoryEntry, DirectorySession, LdapSession, Modification};
pub use error::{SyncError, SyncResult};
pub use reconciler::{AddressingMode, Reconciler, RunReport, UserOutcome, UserState};
