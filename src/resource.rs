//! Named artifacts and their state.
//!
//! A [`Resource`] is a cheap handle: every clone shares the same `dirty` flag,
//! so a task marking its output dirty is immediately visible to every
//! consumer holding the same id through the [`ResourceRegistry`].

mod registry;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::Environment;
use crate::error::{ResourceError, TaskError};
use crate::snapshot::Snapshot;
use crate::store::ResourceRecord;

pub use registry::{ResourceIds, ResourceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A single file.
    File,
    /// A directory of JSON-lines chunks.
    Dataset,
    /// A table in the table backend.
    Table,
}

impl ResourceKind {
    fn as_str(self) -> &'static str {
        match self {
            ResourceKind::File => "File",
            ResourceKind::Dataset => "Dataset",
            ResourceKind::Table => "Table",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Globally unique, immutable identity of a resource.
///
/// Ordered by its string form `Kind::plugin::name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub plugin: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, plugin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            plugin: plugin.into(),
            name: name.into(),
        }
    }

    pub fn file(plugin: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::File, plugin, name)
    }

    pub fn dataset(plugin: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Dataset, plugin, name)
    }

    pub fn table(plugin: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Table, plugin, name)
    }

    /// Backend name of a table, qualified by its plugin.
    pub fn table_name(&self) -> String {
        format!("{}.{}", self.plugin, self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.kind, self.plugin, self.name)
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl FromStr for ResourceId {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, "::");
        let (Some(kind), Some(plugin), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ResourceError::Parse(s.to_string()));
        };

        let kind = match kind {
            "File" => ResourceKind::File,
            "Dataset" => ResourceKind::Dataset,
            "Table" => ResourceKind::Table,
            _ => return Err(ResourceError::Parse(s.to_string())),
        };

        if plugin.is_empty() || name.is_empty() {
            return Err(ResourceError::Parse(s.to_string()));
        }

        Ok(ResourceId::new(kind, plugin, name))
    }
}

struct ResourceInner {
    id: ResourceId,
    tags: BTreeSet<String>,
    dirty: AtomicBool,
}

/// Shared handle to a resource.
#[derive(Clone)]
pub struct Resource(Arc<ResourceInner>);

impl Resource {
    pub fn new(id: ResourceId) -> Self {
        Self::with_tags(id, [] as [&str; 0])
    }

    pub fn with_tags<I, S>(id: ResourceId, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(ResourceInner {
            id,
            tags: tags.into_iter().map(Into::into).collect(),
            dirty: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &ResourceId {
        &self.0.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.0.id.kind
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.0.tags.contains(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.tags.iter().map(String::as_str)
    }

    /// Changed during the current run.
    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(AtomicOrdering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.0.dirty.store(true, AtomicOrdering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.0.dirty.store(false, AtomicOrdering::Release);
    }

    /// Location on disk, or the qualified table name for tables.
    pub fn path(&self, env: &Environment) -> Result<Utf8PathBuf, ResourceError> {
        resource_path(env, self.id())
    }

    /// Current physical state, `None` if the artifact does not exist.
    pub fn probe(&self, env: &Environment) -> Result<Option<Snapshot>, TaskError> {
        match self.kind() {
            ResourceKind::File => Ok(Snapshot::probe_file(&self.path(env)?)?),
            ResourceKind::Dataset => Snapshot::probe_dataset(&self.path(env)?),
            ResourceKind::Table => Ok(env
                .tables
                .row_count(&self.id().table_name())?
                .map(|rows| Snapshot::Table { rows })),
        }
    }

    /// Whether the artifact is there at all, without hashing it.
    pub fn exists(&self, env: &Environment) -> Result<bool, TaskError> {
        Ok(match self.kind() {
            ResourceKind::File => self.path(env)?.is_file(),
            ResourceKind::Dataset => self.path(env)?.is_dir(),
            ResourceKind::Table => env.tables.row_count(&self.id().table_name())?.is_some(),
        })
    }

    /// The last recorded snapshot, taken from the working update of the owning plugin.
    pub fn record(&self, env: &Environment) -> Option<ResourceRecord> {
        env.store.query(|state| state.record(self.id()).cloned())
    }

    /// Does the physical artifact still match its record.
    pub fn is_consistent(&self, env: &Environment) -> Result<bool, TaskError> {
        let Some(record) = self.record(env) else {
            return Ok(false);
        };

        let Some(actual) = self.probe(env)? else {
            return Ok(false);
        };

        if let Snapshot::Table { rows } = actual {
            if rows == 0 && !env.settings.allow_empty_tables {
                return Ok(false);
            }
            if !env.settings.perform_table_check {
                return Ok(true);
            }
        }

        Ok(actual.same_content(&record.snapshot))
    }

    /// Record the current physical state in the working update.
    ///
    /// Returns whether the content differs from the previous record.
    pub fn update_record(&self, env: &Environment) -> Result<bool, TaskError> {
        let snapshot = self
            .probe(env)?
            .ok_or_else(|| TaskError::MissingOutput(self.id().clone()))?;

        env.store.transaction(|state| {
            state
                .put_record(self.id(), snapshot)
                .ok_or_else(|| ResourceError::NoWorkingUpdate(self.id().plugin.clone()).into())
        })
    }

    /// Delete the artifact and forget its record.
    pub fn remove(&self, env: &Environment) -> Result<(), TaskError> {
        match self.kind() {
            ResourceKind::File => {
                let path = self.path(env)?;
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
            ResourceKind::Dataset => {
                let path = self.path(env)?;
                if path.exists() {
                    fs::remove_dir_all(path)?;
                }
            }
            ResourceKind::Table => env.tables.drop_table(&self.id().table_name())?,
        }

        env.store.transaction(|state| -> Result<_, TaskError> {
            state.drop_record(self.id());
            Ok(())
        })
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", self.id())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Resolve where an id lives: `<data_dir>/<plugin>/<version>/<name>`.
///
/// The version is the plugin's working update, pending before current.
pub fn resource_path(env: &Environment, id: &ResourceId) -> Result<Utf8PathBuf, ResourceError> {
    if id.kind == ResourceKind::Table {
        return Ok(Utf8PathBuf::from(id.table_name()));
    }

    let version = env
        .store
        .query(|state| state.working_update(&id.plugin).map(|u| u.version.clean()))
        .ok_or_else(|| ResourceError::NoWorkingUpdate(id.plugin.clone()))?;

    Ok(env
        .settings
        .data_dir
        .join(&id.plugin)
        .join(version)
        .join(&id.name))
}

/// A set of resource handles keyed by id, as returned by a run.
#[derive(Clone, Default)]
pub struct Resources(BTreeMap<ResourceId, Resource>);

impl Resources {
    pub fn insert(&mut self, resource: Resource) {
        self.0.insert(resource.id().clone(), resource);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.0.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ids of every resource that changed during the run.
    pub fn dirty(&self) -> Vec<ResourceId> {
        self.0
            .values()
            .filter(|res| res.is_dirty())
            .map(|res| res.id().clone())
            .collect()
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<T: IntoIterator<Item = Resource>>(iter: T) -> Self {
        let mut resources = Resources::default();
        for resource in iter {
            resources.insert(resource);
        }
        resources
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.values()).finish()
    }
}
