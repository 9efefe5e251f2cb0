//! Per-plugin version lifecycle.
//!
//! A plugin has at most one current and one pending update. Finalization
//! moves pending to current only when everything the plugin offers is
//! consistent; otherwise the pending update stays Ongoing and is retried by
//! the next run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, VersionError};
use crate::store::{Store, StoreState, UpdateModel, UpdateStatus};

/// Opaque version string reported by a source, e.g. `2024-01-01` or `v37`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory-safe form of the version.
    pub fn clean(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect()
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote source of truth for the newest available version.
pub trait VersionResolver: Send + Sync {
    /// `None` when the remote cannot tell.
    fn latest_version(&self, plugin: &str) -> anyhow::Result<Option<Version>>;
}

/// What finalization did to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First version became current.
    Installed(Version),
    /// A newer version replaced the current one.
    Upgraded { from: Version, to: Version },
    /// Install or upgrade left inconsistent resources; pending stays Ongoing.
    Retry(Version),
    /// The current version was confirmed installed.
    Fixed(Version),
    /// The current version has inconsistent resources and needs repair.
    Broken(Version),
    /// Nothing to do.
    Unchanged,
}

/// Handle on the lifecycle of a single plugin.
#[derive(Clone)]
pub struct Lifecycle {
    plugin: String,
    store: Arc<Store>,
}

impl Lifecycle {
    pub fn new(plugin: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            plugin: plugin.into(),
            store,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Create the plugin model if the store has never seen this plugin.
    pub fn ensure_model(&self) -> Result<(), StoreError> {
        if self.store.query(|s| s.plugin(&self.plugin).is_some()) {
            return Ok(());
        }

        self.store.transaction(|state| -> Result<_, StoreError> {
            state.ensure_plugin(&self.plugin);
            Ok(())
        })
    }

    pub fn add_version(&self, version: &Version) -> Result<(), StoreError> {
        if self
            .store
            .query(|s| s.version_id(&self.plugin, version).is_some())
        {
            return Ok(());
        }

        self.store.transaction(|state| -> Result<_, StoreError> {
            state.add_version(&self.plugin, version);
            Ok(())
        })
    }

    pub fn current(&self) -> Option<Version> {
        self.store
            .query(|s| s.current_update(&self.plugin).map(|u| u.version.clone()))
    }

    pub fn pending(&self) -> Option<Version> {
        self.store
            .query(|s| s.pending_update(&self.plugin).map(|u| u.version.clone()))
    }

    pub fn current_status(&self) -> Option<UpdateStatus> {
        self.store
            .query(|s| s.current_update(&self.plugin).map(|u| u.status))
    }

    pub fn pending_status(&self) -> Option<UpdateStatus> {
        self.store
            .query(|s| s.pending_update(&self.plugin).map(|u| u.status))
    }

    /// Pending if present, else current.
    pub fn working(&self) -> Option<Version> {
        self.store
            .query(|s| s.working_update(&self.plugin).map(|u| u.version.clone()))
    }

    pub fn local_latest(&self) -> Option<Version> {
        self.store
            .query(|s| s.local_latest(&self.plugin).map(|v| v.version.clone()))
    }

    /// The pending update still targets the newest known version.
    pub fn check_upgrade(&self) -> bool {
        match (self.pending(), self.local_latest()) {
            (Some(pending), Some(latest)) => pending == latest,
            _ => false,
        }
    }

    pub fn is_uptodate(&self) -> bool {
        match (self.current(), self.local_latest()) {
            (Some(current), Some(latest)) => current == latest,
            _ => false,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.current_status() == Some(UpdateStatus::Installed)
    }

    pub fn is_frozen(&self) -> bool {
        self.store
            .query(|s| s.plugin(&self.plugin).is_some_and(|p| p.frozen))
    }

    pub fn freeze(&self, frozen: bool) -> Result<(), StoreError> {
        self.store.transaction(|state| -> Result<_, StoreError> {
            state.ensure_plugin(&self.plugin).frozen = frozen;
            Ok(())
        })
    }

    /// Choose `version` as the next build target.
    ///
    /// A different pending update is abandoned as Failed. Choosing the
    /// pending or the current version again is refused.
    pub fn create_update(&self, version: &Version) -> Result<(), VersionError> {
        self.store
            .transaction(|state| create_update(state, &self.plugin, version))
    }

    /// Advance the state machine after all of the plugin's tasks ran.
    pub fn finalize(&self, consistent: bool, tasks_done: bool) -> Result<Transition, VersionError> {
        self.store
            .transaction(|state| finalize(state, &self.plugin, consistent, tasks_done))
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("plugin", &self.plugin)
            .field("current", &self.current())
            .field("pending", &self.pending())
            .finish()
    }
}

fn create_update(state: &mut StoreState, plugin: &str, version: &Version) -> Result<(), VersionError> {
    let refuse = || VersionError::CannotOverwriteUpdate {
        plugin: plugin.to_string(),
        version: version.to_string(),
    };

    if state.current_update(plugin).is_some_and(|u| &u.version == version) {
        return Err(refuse());
    }

    if let Some(pending) = state.pending_update(plugin) {
        if &pending.version == version {
            return Err(refuse());
        }
        let id = pending.id;
        state.update_mut(id)?.status = UpdateStatus::Failed;
    }

    let id = state.add_version(plugin, version);
    match state.update_mut(id) {
        Ok(update) => {
            update.status = UpdateStatus::Ongoing;
            update.resources.clear();
        }
        Err(_) => state.insert_update(UpdateModel {
            id,
            plugin: plugin.to_string(),
            version: version.clone(),
            status: UpdateStatus::Ongoing,
            resources: BTreeMap::new(),
        }),
    }

    state.ensure_plugin(plugin).pending_update = Some(id);
    Ok(())
}

fn finalize(
    state: &mut StoreState,
    plugin: &str,
    consistent: bool,
    tasks_done: bool,
) -> Result<Transition, VersionError> {
    let model = state.plugin_mut(plugin)?;
    let (current, pending) = (model.current_update, model.pending_update);

    match (current, pending) {
        (None, Some(pending)) => promote(state, plugin, pending, consistent, None),
        (Some(current), Some(pending)) => {
            let previous = state.update_mut(current)?;
            if previous.status == UpdateStatus::Ongoing {
                previous.status = UpdateStatus::Failed;
            }
            let from = previous.version.clone();
            promote(state, plugin, pending, consistent, Some(from))
        }
        (Some(current), None) => {
            let update = state.update_mut(current)?;
            let version = update.version.clone();

            if !consistent {
                update.status = UpdateStatus::Ongoing;
                Ok(Transition::Broken(version))
            } else if tasks_done || update.status != UpdateStatus::Installed {
                update.status = UpdateStatus::Installed;
                Ok(Transition::Fixed(version))
            } else {
                Ok(Transition::Unchanged)
            }
        }
        (None, None) => Ok(Transition::Unchanged),
    }
}

fn promote(
    state: &mut StoreState,
    plugin: &str,
    pending: u64,
    consistent: bool,
    from: Option<Version>,
) -> Result<Transition, VersionError> {
    let update = state.update_mut(pending)?;
    let to = update.version.clone();

    if !consistent {
        update.status = UpdateStatus::Ongoing;
        return Ok(Transition::Retry(to));
    }

    update.status = UpdateStatus::Installed;
    let model = state.plugin_mut(plugin)?;
    model.current_update = Some(pending);
    model.pending_update = None;

    Ok(match from {
        Some(from) => Transition::Upgraded { from, to },
        None => Transition::Installed(to),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> Lifecycle {
        let lifecycle = Lifecycle::new("p", Arc::new(Store::memory()));
        lifecycle.ensure_model().unwrap();
        lifecycle
    }

    #[test]
    fn test_clean_version() {
        assert_eq!(Version::from("2024/01 01").clean(), "2024_01_01");
        assert_eq!(Version::from("v1.2-rc_3").clean(), "v1.2-rc_3");
    }

    #[test]
    fn test_install() {
        let lifecycle = lifecycle();
        lifecycle.create_update(&"2024-01-01".into()).unwrap();
        assert_eq!(lifecycle.working(), Some("2024-01-01".into()));

        let transition = lifecycle.finalize(true, true).unwrap();
        assert_eq!(transition, Transition::Installed("2024-01-01".into()));
        assert_eq!(lifecycle.current(), Some("2024-01-01".into()));
        assert_eq!(lifecycle.pending(), None);
        assert!(lifecycle.is_installed());
    }

    #[test]
    fn test_install_retry_keeps_pending() {
        let lifecycle = lifecycle();
        lifecycle.create_update(&"1.0".into()).unwrap();

        let transition = lifecycle.finalize(false, false).unwrap();
        assert_eq!(transition, Transition::Retry("1.0".into()));
        assert_eq!(lifecycle.current(), None);
        assert_eq!(lifecycle.pending(), Some("1.0".into()));
        assert_eq!(lifecycle.pending_status(), Some(UpdateStatus::Ongoing));
    }

    #[test]
    fn test_upgrade() {
        let lifecycle = lifecycle();
        lifecycle.create_update(&"1.0".into()).unwrap();
        lifecycle.finalize(true, true).unwrap();

        lifecycle.create_update(&"1.1".into()).unwrap();
        assert_eq!(lifecycle.working(), Some("1.1".into()));

        let transition = lifecycle.finalize(true, true).unwrap();
        assert_eq!(
            transition,
            Transition::Upgraded {
                from: "1.0".into(),
                to: "1.1".into()
            }
        );
        assert_eq!(lifecycle.current(), Some("1.1".into()));
        assert!(lifecycle.is_installed());
    }

    #[test]
    fn test_upgrade_fails_stuck_current() {
        let lifecycle = lifecycle();
        lifecycle.create_update(&"1.0".into()).unwrap();
        lifecycle.finalize(true, true).unwrap();
        lifecycle.finalize(false, false).unwrap();
        assert_eq!(lifecycle.current_status(), Some(UpdateStatus::Ongoing));

        lifecycle.create_update(&"1.1".into()).unwrap();
        lifecycle.finalize(false, true).unwrap();

        assert_eq!(lifecycle.current(), Some("1.0".into()));
        assert_eq!(lifecycle.current_status(), Some(UpdateStatus::Failed));
        assert_eq!(lifecycle.pending_status(), Some(UpdateStatus::Ongoing));
    }

    #[test]
    fn test_fix() {
        let lifecycle = lifecycle();
        lifecycle.create_update(&"1.0".into()).unwrap();
        lifecycle.finalize(true, true).unwrap();

        assert_eq!(
            lifecycle.finalize(false, true).unwrap(),
            Transition::Broken("1.0".into())
        );
        assert!(!lifecycle.is_installed());

        assert_eq!(
            lifecycle.finalize(true, false).unwrap(),
            Transition::Fixed("1.0".into())
        );
        assert!(lifecycle.is_installed());

        assert_eq!(lifecycle.finalize(true, false).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn test_create_update_rules() {
        let lifecycle = lifecycle();
        lifecycle.create_update(&"1.0".into()).unwrap();

        assert!(matches!(
            lifecycle.create_update(&"1.0".into()),
            Err(VersionError::CannotOverwriteUpdate { .. })
        ));

        lifecycle.create_update(&"1.1".into()).unwrap();
        let failed = lifecycle
            .store
            .query(|s| {
                let id = s.version_id("p", &"1.0".into())?;
                s.update(id).map(|u| u.status)
            });
        assert_eq!(failed, Some(UpdateStatus::Failed));
        assert_eq!(lifecycle.pending(), Some("1.1".into()));

        lifecycle.finalize(true, true).unwrap();
        assert!(matches!(
            lifecycle.create_update(&"1.1".into()),
            Err(VersionError::CannotOverwriteUpdate { .. })
        ));
    }

    #[test]
    fn test_check_upgrade_and_uptodate() {
        let lifecycle = lifecycle();
        lifecycle.add_version(&"1.0".into()).unwrap();
        lifecycle.create_update(&"1.0".into()).unwrap();
        assert!(lifecycle.check_upgrade());

        lifecycle.add_version(&"1.1".into()).unwrap();
        assert!(!lifecycle.check_upgrade());
        assert_eq!(lifecycle.local_latest(), Some("1.1".into()));

        lifecycle.finalize(true, true).unwrap();
        assert!(!lifecycle.is_uptodate());
    }

    #[test]
    fn test_freeze() {
        let lifecycle = lifecycle();
        assert!(!lifecycle.is_frozen());
        lifecycle.freeze(true).unwrap();
        assert!(lifecycle.is_frozen());
    }
}
