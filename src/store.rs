//! Persistent metadata shared by every task of every run.
//!
//! The [`Store`] is the only cross-task mutable state. Each transaction works
//! on a private copy that replaces the live state only when the closure
//! succeeds, so a concurrent reader never sees half of a commit.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::resource::ResourceId;
use crate::snapshot::Snapshot;
use crate::version::Version;

/// Lifecycle status of one attempt to build a plugin version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateStatus {
    Ongoing,
    Failed,
    Installed,
    Archived,
    Deleted,
    Temporary,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStatus::Ongoing => "ongoing",
            UpdateStatus::Failed => "failed",
            UpdateStatus::Installed => "installed",
            UpdateStatus::Archived => "archived",
            UpdateStatus::Deleted => "deleted",
            UpdateStatus::Temporary => "temporary",
        };
        f.write_str(name)
    }
}

/// Snapshot of a resource at its last successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub snapshot: Snapshot,
    /// Clock tick at which the recorded content last changed.
    pub changed_at: u64,
    /// Clock tick at which the producer last wrote or verified it.
    pub built_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginModel {
    pub name: String,
    pub frozen: bool,
    pub current_update: Option<u64>,
    pub pending_update: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionModel {
    pub id: u64,
    pub plugin: String,
    pub version: Version,
    pub created_at: u64,
    pub installable: bool,
}

/// An update shares its id with the version it builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateModel {
    pub id: u64,
    pub plugin: String,
    pub version: Version,
    pub status: UpdateStatus,
    pub resources: BTreeMap<String, ResourceRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    plugins: BTreeMap<String, PluginModel>,
    versions: BTreeMap<u64, VersionModel>,
    updates: BTreeMap<u64, UpdateModel>,
    next_id: u64,
    clock: u64,
}

impl StoreState {
    /// Advance the logical clock.
    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginModel> {
        self.plugins.get(name)
    }

    pub(crate) fn plugin_mut(&mut self, name: &str) -> Result<&mut PluginModel, StoreError> {
        self.plugins
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingPlugin(name.to_string()))
    }

    pub(crate) fn ensure_plugin(&mut self, name: &str) -> &mut PluginModel {
        self.plugins
            .entry(name.to_string())
            .or_insert_with(|| PluginModel {
                name: name.to_string(),
                frozen: false,
                current_update: None,
                pending_update: None,
            })
    }

    pub fn update(&self, id: u64) -> Option<&UpdateModel> {
        self.updates.get(&id)
    }

    pub(crate) fn update_mut(&mut self, id: u64) -> Result<&mut UpdateModel, StoreError> {
        self.updates
            .get_mut(&id)
            .ok_or(StoreError::MissingUpdate(id))
    }

    pub(crate) fn insert_update(&mut self, update: UpdateModel) {
        self.updates.insert(update.id, update);
    }

    pub fn current_update(&self, plugin: &str) -> Option<&UpdateModel> {
        self.plugin(plugin)
            .and_then(|p| p.current_update)
            .and_then(|id| self.update(id))
    }

    pub fn pending_update(&self, plugin: &str) -> Option<&UpdateModel> {
        self.plugin(plugin)
            .and_then(|p| p.pending_update)
            .and_then(|id| self.update(id))
    }

    /// The update resources are written to: pending if there is one, else current.
    pub fn working_update(&self, plugin: &str) -> Option<&UpdateModel> {
        self.pending_update(plugin)
            .or_else(|| self.current_update(plugin))
    }

    fn working_update_mut(&mut self, plugin: &str) -> Option<&mut UpdateModel> {
        let model = self.plugins.get(plugin)?;
        let id = model.pending_update.or(model.current_update)?;
        self.updates.get_mut(&id)
    }

    pub fn versions(&self, plugin: &str) -> impl Iterator<Item = &VersionModel> {
        self.versions.values().filter(move |v| v.plugin == plugin)
    }

    pub fn version_id(&self, plugin: &str, version: &Version) -> Option<u64> {
        self.versions(plugin)
            .find(|v| &v.version == version)
            .map(|v| v.id)
    }

    /// Record a version, returning the id of the existing one if already known.
    pub(crate) fn add_version(&mut self, plugin: &str, version: &Version) -> u64 {
        if let Some(id) = self.version_id(plugin, version) {
            return id;
        }

        self.next_id += 1;
        let id = self.next_id;
        let created_at = self.tick();
        self.versions.insert(
            id,
            VersionModel {
                id,
                plugin: plugin.to_string(),
                version: version.clone(),
                created_at,
                installable: true,
            },
        );
        id
    }

    /// The most recently recorded version of a plugin.
    pub fn local_latest(&self, plugin: &str) -> Option<&VersionModel> {
        self.versions(plugin).max_by_key(|v| (v.created_at, v.id))
    }

    pub fn record(&self, id: &ResourceId) -> Option<&ResourceRecord> {
        self.working_update(&id.plugin)?
            .resources
            .get(&id.to_string())
    }

    /// Store a snapshot in the working update of the owning plugin.
    ///
    /// Identical content keeps its `changed_at` tick. Returns `None` when the
    /// plugin has no working update, otherwise whether the content changed.
    pub(crate) fn put_record(&mut self, id: &ResourceId, snapshot: Snapshot) -> Option<bool> {
        let now = self.tick();
        let update = self.working_update_mut(&id.plugin)?;
        let key = id.to_string();

        match update.resources.get_mut(&key) {
            Some(record) if record.snapshot.same_content(&snapshot) => {
                record.snapshot = snapshot;
                record.built_at = now;
                Some(false)
            }
            _ => {
                update.resources.insert(
                    key,
                    ResourceRecord {
                        snapshot,
                        changed_at: now,
                        built_at: now,
                    },
                );
                Some(true)
            }
        }
    }

    pub(crate) fn drop_record(&mut self, id: &ResourceId) {
        if let Some(update) = self.working_update_mut(&id.plugin) {
            update.resources.remove(&id.to_string());
        }
    }

    /// Number of resource records across all updates.
    pub fn record_count(&self) -> usize {
        self.updates.values().map(|u| u.resources.len()).sum()
    }
}

/// Transactional metadata store, optionally persisted to a CBOR file.
pub struct Store {
    state: Mutex<StoreState>,
    path: Option<Utf8PathBuf>,
    commits: AtomicU64,
}

impl Store {
    /// A store that lives only as long as the process.
    pub fn memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
            commits: AtomicU64::new(0),
        }
    }

    /// Open a store file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let state = if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            ciborium::from_reader(reader).map_err(|e| StoreError::Decode(e.to_string()))?
        } else {
            StoreState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            commits: AtomicU64::new(0),
        })
    }

    pub fn query<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    /// Run `f` against a copy of the state and commit it only on success.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&mut StoreState) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut state = self.state.lock().unwrap();
        let mut draft = state.clone();

        let result = f(&mut draft)?;
        self.persist(&draft)?;

        *state = draft;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Successful commits since this handle was opened.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&temp)?);
            ciborium::into_writer(state, &mut writer)
                .map_err(|e| StoreError::Encode(e.to_string()))?;
            writer.flush()?;
        }
        fs::rename(&temp, path)?;

        Ok(())
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("commits", &self.commits())
            .finish_non_exhaustive()
    }
}
