use std::sync::mpsc::RecvError;

use thiserror::Error;

use crate::resource::ResourceId;
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Plugin '{0}' is disabled")]
    Disabled(String),

    #[error("Couldn't start the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't set progress bar template.\n{0}")]
    Template(#[from] indicatif::style::TemplateError),

    #[error("Scheduler lost contact with its workers.\n{0}")]
    Scheduler(#[from] RecvError),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Resource {0} is already offered by another task")]
    Duplicate(ResourceId),

    #[error("Resource {0} is not registered")]
    Missing(ResourceId),

    #[error("Cannot add {0}, the set of resource ids is closed")]
    Closed(ResourceId),

    #[error("Malformed resource id '{0}', expected 'Kind::plugin::name'")]
    Parse(String),

    #[error("Plugin '{0}' has neither a pending nor a current update")]
    NoWorkingUpdate(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid ETL specification for '{plugin}': {reason}")]
    InvalidSpec { plugin: String, reason: String },

    #[error("Plugin '{plugin}' cannot offer {resource}")]
    WrongPlugin { plugin: String, resource: ResourceId },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Task {task} requires {target} which no task offers{hint}")]
    MissingDependency {
        task: TaskId,
        target: ResourceId,
        hint: String,
    },

    #[error("Dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Plugin '{0}' is already known")]
    DuplicatePlugin(String),

    #[error("Tasks of plugin '{0}' are already registered")]
    AlreadyRegistered(String),

    #[error("Tasks of plugin '{0}' are not registered")]
    NotRegistered(String),
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Plugin '{0}' has neither a current nor a pending version")]
    MissingAnyVersion(String),

    #[error("Plugin '{0}' has no current version")]
    MissingCurrentVersion(String),

    #[error("Plugin '{0}' has no pending version")]
    MissingPendingVersion(String),

    #[error("Plugin '{plugin}': pending version {pending} is no longer the latest ({latest})")]
    NewPluginVersion {
        plugin: String,
        pending: String,
        latest: String,
    },

    #[error("Plugin '{plugin}': cannot overwrite update for version {version}")]
    CannotOverwriteUpdate { plugin: String, version: String },

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Couldn't resolve the latest version.\n{0}")]
    Resolver(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't access the store file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode the store.\n{0}")]
    Encode(String),

    #[error("Couldn't decode the store.\n{0}")]
    Decode(String),

    #[error("No store model for plugin '{0}'")]
    MissingPlugin(String),

    #[error("No update with id {0}")]
    MissingUpdate(u64),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Required resource {0} is missing")]
    MissingInput(ResourceId),

    #[error("Task finished without producing {0}")]
    MissingOutput(ResourceId),

    #[error("Task {task} skipped, upstream failed for: {}", fmt_ids(.inputs))]
    UpstreamFailed {
        task: TaskId,
        inputs: Vec<ResourceId>,
    },

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Couldn't access data on disk.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't process JSON.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("An error occured while running task.\n{0}")]
    Userland(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read settings.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse settings.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {key}")]
    Override { key: String, value: String },
}

fn fmt_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
