//! Group membership reconciliation
//!
//! One-shot pass that makes every person's `pgMemberOf` attribute equal, as
//! a set, to the DNs of the POSIX groups listing that person's uid. Writes
//! happen only when the stored value differs from the computed value, to
//! avoid churn on a shared multi-writer directory.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::directory::{escape_dn_value, escape_filter_value, DirectorySession, Modification};
use crate::error::{SyncError, SyncResult};

/// How a person entry was addressed for a write.
///
/// Directories sometimes disagree between name-based and identifier-based
/// addressing due to naming inconsistencies. Writes try the cn-derived DN
/// first; a no-such-object response triggers one retry via the uid-derived
/// DN, and the mode that succeeded is reused for later writes on the same
/// person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// DN derived from the naming attribute (`cn=<name>,<persons base>`).
    CanonicalName,
    /// DN derived from the identifier attribute (`uid=<uid>,<persons base>`).
    Identifier,
}

/// State of one person entry as read from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    /// Value of the naming attribute, used to derive the write DN.
    pub canonical_name: String,
    /// Whether the marker object class is already present.
    pub has_marker_class: bool,
    /// Currently stored membership attribute values.
    pub current_groups: BTreeSet<String>,
}

/// Outcome of reconciling one uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutcome {
    /// The membership attribute was rewritten.
    Synced,
    /// Stored membership already matched the computed set; no write.
    UpToDate,
    /// No matching person entry exists for the uid.
    NotFound,
    /// Reconciliation of this uid failed; the run continued.
    Failed { reason: String },
}

/// Per-uid outcomes of a full run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Outcomes in processing order.
    pub outcomes: Vec<(String, UserOutcome)>,
    /// Set when the stale-membership scan failed after the primary pass;
    /// the outcomes above are still complete for every indexed uid.
    pub stale_scan_error: Option<String>,
}

impl RunReport {
    fn count(&self, f: impl Fn(&UserOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }

    /// Number of users whose membership attribute was rewritten.
    pub fn synced(&self) -> usize {
        self.count(|o| *o == UserOutcome::Synced)
    }

    /// Number of users that required no write.
    pub fn up_to_date(&self) -> usize {
        self.count(|o| *o == UserOutcome::UpToDate)
    }

    /// Number of uids with no matching person entry.
    pub fn not_found(&self) -> usize {
        self.count(|o| *o == UserOutcome::NotFound)
    }

    /// Number of uids whose reconciliation failed.
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UserOutcome::Failed { .. }))
    }
}

/// Reconciles person membership attributes against group member lists.
///
/// Owns the directory session for the duration of the run; the session is
/// released by [`Reconciler::close`], which must be called on every exit
/// path.
pub struct Reconciler<S: DirectorySession> {
    session: S,
    config: SyncConfig,
}

impl<S: DirectorySession> Reconciler<S> {
    /// Create a reconciler over an already-bound session.
    pub fn new(session: S, config: SyncConfig) -> Self {
        Self { session, config }
    }

    /// Release the directory session.
    pub async fn close(mut self) -> SyncResult<()> {
        self.session.unbind().await
    }

    /// Discover POSIX groups under the base DN and their member uids.
    ///
    /// Groups without the member attribute are omitted. Transient failures
    /// are retried with bounded exponential backoff; exhausting the retry
    /// budget is fatal to the run.
    #[instrument(skip(self))]
    pub async fn discover_groups(&mut self) -> SyncResult<BTreeMap<String, Vec<String>>> {
        let base = self.config.base_dn.clone();
        let filter = format!(
            "(objectClass={})",
            escape_filter_value(&self.config.group_object_class)
        );
        let member_attr = self.config.member_attribute.clone();

        let entries = self
            .search_with_retry(&base, &filter, &[member_attr.as_str()])
            .await?;

        let mut groups = BTreeMap::new();
        for entry in entries {
            let members = entry.values(&member_attr).to_vec();
            if members.is_empty() {
                debug!(dn = %entry.dn, "group has no members, skipping");
                continue;
            }
            groups.insert(entry.dn, members);
        }

        info!(count = groups.len(), "discovered groups with members");

        Ok(groups)
    }

    /// Invert group member lists into a uid → group DNs index.
    ///
    /// Group order within a uid's set is not significant; downstream
    /// comparison is set equality.
    pub fn build_membership_index(
        groups: &BTreeMap<String, Vec<String>>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (group_dn, member_uids) in groups {
            for uid in member_uids {
                index
                    .entry(uid.clone())
                    .or_default()
                    .insert(group_dn.clone());
            }
        }
        index
    }

    /// Fetch the current state of the person entry for `uid`.
    ///
    /// Returns `None` when no entry matches. More than one match is an
    /// [`SyncError::AmbiguousUser`] error rather than an arbitrary pick.
    #[instrument(skip(self))]
    pub async fn fetch_user_state(&mut self, uid: &str) -> SyncResult<Option<UserState>> {
        let base = self.config.persons_base();
        let filter = format!(
            "(&{}({}={}))",
            self.person_class_filter(),
            self.config.uid_attribute,
            escape_filter_value(uid)
        );
        let name_attr = self.config.name_attribute.clone();
        let membership_attr = self.config.membership_attribute.clone();
        let attrs = [name_attr.as_str(), "objectClass", membership_attr.as_str()];

        let entries = self.session.search(&base, &filter, &attrs).await?;

        let entry = match entries.len() {
            0 => return Ok(None),
            1 => &entries[0],
            n => {
                return Err(SyncError::AmbiguousUser {
                    uid: uid.to_string(),
                    matches: n,
                })
            }
        };

        let canonical_name = entry
            .first(&name_attr)
            .ok_or_else(|| {
                SyncError::operation_failed(format!(
                    "entry '{}' has no {} attribute",
                    entry.dn, name_attr
                ))
            })?
            .to_string();

        Ok(Some(UserState {
            canonical_name,
            has_marker_class: entry.has_value("objectClass", &self.config.marker_object_class),
            current_groups: entry.values(&membership_attr).iter().cloned().collect(),
        }))
    }

    /// Add the marker object class when absent.
    ///
    /// The membership attribute is only valid on entries carrying the marker
    /// class, so this runs before any membership write.
    pub async fn ensure_marker_class(
        &mut self,
        uid: &str,
        state: &UserState,
        mode: &mut Option<AddressingMode>,
    ) -> SyncResult<bool> {
        if state.has_marker_class {
            return Ok(false);
        }

        let changes = vec![Modification::Add(
            "objectClass".to_string(),
            vec![self.config.marker_object_class.clone()],
        )];
        self.modify_user(uid, state, mode, changes).await?;

        debug!(uid, "added marker object class");

        Ok(true)
    }

    /// Replace the membership attribute when the stored set differs from the
    /// computed set. Equal sets produce no write.
    pub async fn sync_membership(
        &mut self,
        uid: &str,
        state: &UserState,
        computed: &BTreeSet<String>,
        mode: &mut Option<AddressingMode>,
    ) -> SyncResult<bool> {
        if state.current_groups == *computed {
            return Ok(false);
        }

        let changes = vec![Modification::Replace(
            self.config.membership_attribute.clone(),
            computed.iter().cloned().collect(),
        )];
        self.modify_user(uid, state, mode, changes).await?;

        debug!(uid, groups = computed.len(), "membership attribute replaced");

        Ok(true)
    }

    /// Reconcile a single uid against its computed group set.
    pub async fn reconcile_user(
        &mut self,
        uid: &str,
        computed: &BTreeSet<String>,
    ) -> SyncResult<UserOutcome> {
        let Some(state) = self.fetch_user_state(uid).await? else {
            return Ok(UserOutcome::NotFound);
        };

        let mut mode = None;
        self.ensure_marker_class(uid, &state, &mut mode).await?;
        let wrote = self
            .sync_membership(uid, &state, computed, &mut mode)
            .await?;

        Ok(if wrote {
            UserOutcome::Synced
        } else {
            UserOutcome::UpToDate
        })
    }

    /// Run one full reconciliation pass.
    ///
    /// Discovery failure is fatal. Per-user failures are recorded in the
    /// report and the run continues with the remaining users.
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> SyncResult<RunReport> {
        let groups = self.discover_groups().await?;
        let index = Self::build_membership_index(&groups);

        info!(
            groups = groups.len(),
            users = index.len(),
            "membership index built"
        );

        let mut report = RunReport::default();

        for (uid, group_dns) in &index {
            let outcome = self.reconcile_one(uid, group_dns).await;
            report.outcomes.push((uid.clone(), outcome));
        }

        // Persons that dropped out of every group still cache a stale value;
        // reconcile them against the empty set. Writes from the primary pass
        // are already applied, so a failed scan degrades to a partial report
        // instead of discarding those outcomes.
        match self.discover_stale_uids(&index).await {
            Ok(stale_uids) => {
                let empty = BTreeSet::new();
                for uid in stale_uids {
                    let outcome = self.reconcile_one(&uid, &empty).await;
                    report.outcomes.push((uid, outcome));
                }
            }
            Err(e) => {
                warn!(error = %e, "stale membership scan failed, report is partial");
                report.stale_scan_error = Some(e.to_string());
            }
        }

        info!(
            synced = report.synced(),
            up_to_date = report.up_to_date(),
            not_found = report.not_found(),
            failed = report.failed(),
            "run complete"
        );

        Ok(report)
    }

    async fn reconcile_one(&mut self, uid: &str, computed: &BTreeSet<String>) -> UserOutcome {
        match self.reconcile_user(uid, computed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(uid, error = %e, "reconciliation failed for user");
                UserOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Find uids that carry a membership value but appear in no group.
    async fn discover_stale_uids(
        &mut self,
        index: &BTreeMap<String, BTreeSet<String>>,
    ) -> SyncResult<Vec<String>> {
        let base = self.config.persons_base();
        let filter = format!(
            "(&{}({}=*))",
            self.person_class_filter(),
            self.config.membership_attribute
        );
        let uid_attr = self.config.uid_attribute.clone();

        let entries = self
            .search_with_retry(&base, &filter, &[uid_attr.as_str()])
            .await?;

        let mut stale = Vec::new();
        for entry in entries {
            match entry.first(&uid_attr) {
                Some(uid) if !index.contains_key(uid) => stale.push(uid.to_string()),
                Some(_) => {}
                None => warn!(dn = %entry.dn, "entry has no {} attribute, skipping", uid_attr),
            }
        }

        debug!(count = stale.len(), "found users with stale membership");

        Ok(stale)
    }

    /// Apply changes to a person entry, resolving the write DN.
    ///
    /// An unresolved mode tries the name-derived DN first and falls back to
    /// the uid-derived DN on no-such-object, recording which mode succeeded
    /// so each user pays for at most one failed location attempt.
    async fn modify_user(
        &mut self,
        uid: &str,
        state: &UserState,
        mode: &mut Option<AddressingMode>,
        changes: Vec<Modification>,
    ) -> SyncResult<()> {
        match *mode {
            Some(AddressingMode::CanonicalName) => {
                let dn = self.name_dn(state);
                self.session.modify(&dn, changes).await
            }
            Some(AddressingMode::Identifier) => {
                let dn = self.uid_dn(uid);
                self.session.modify(&dn, changes).await
            }
            None => {
                let name_dn = self.name_dn(state);
                match self.session.modify(&name_dn, changes.clone()).await {
                    Ok(()) => {
                        *mode = Some(AddressingMode::CanonicalName);
                        Ok(())
                    }
                    Err(SyncError::ObjectNotFound { .. }) => {
                        debug!(uid, "entry not at name-derived DN, retrying by identifier");
                        let uid_dn = self.uid_dn(uid);
                        self.session.modify(&uid_dn, changes).await?;
                        *mode = Some(AddressingMode::Identifier);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn search_with_retry(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> SyncResult<Vec<crate::directory::DirectoryEntry>> {
        let mut attempt: u32 = 0;
        loop {
            match self.session.search(base, filter, attrs).await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_transient() && attempt < self.config.discovery_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(
                        self.config
                            .retry_backoff_ms
                            .saturating_mul(1u64 << (attempt - 1).min(16)),
                    );
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient discovery failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn person_class_filter(&self) -> String {
        let classes = &self.config.person_object_classes;
        if classes.len() == 1 {
            format!("(objectClass={})", escape_filter_value(&classes[0]))
        } else {
            let inner: String = classes
                .iter()
                .map(|c| format!("(objectClass={})", escape_filter_value(c)))
                .collect();
            format!("(|{inner})")
        }
    }

    fn name_dn(&self, state: &UserState) -> String {
        format!(
            "{}={},{}",
            self.config.name_attribute,
            escape_dn_value(&state.canonical_name),
            self.config.persons_base()
        )
    }

    fn uid_dn(&self, uid: &str) -> String {
        format!(
            "{}={},{}",
            self.config.uid_attribute,
            escape_dn_value(uid),
            self.config.persons_base()
        )
    }
}
