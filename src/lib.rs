#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
mod context;
mod core;
pub mod dataset;
mod error;
pub mod etl;
mod finalize;
mod graph;
pub mod plugin;
pub mod resource;
mod snapshot;
pub mod store;
pub mod task;
mod utils;
pub mod version;

#[cfg(test)]
mod testing;

pub use crate::config::Settings;
pub use crate::context::Context;
pub use crate::core::{Environment, RunMode};
pub use crate::error::*;
pub use crate::finalize::{FinishWorkflow, PLUGIN_INFO, UpdatePlugin};
pub use crate::graph::{
    Builder, Diagnostics, GraphFormat, ROOT_PLUGIN, RunReport, Target, TaskExecution, TaskReport,
    Value, Workflow,
};
pub use crate::plugin::{CoreTypePlugin, EtlPlugin, Plugin, PluginKind, PluginStatus, StatusFlag};
pub use crate::resource::{Resource, ResourceId, ResourceKind, ResourceRegistry};
pub use crate::snapshot::Snapshot;
pub use crate::task::builder::{Services, TaskBuilder};
pub use crate::task::{Evaluation, Status, Task, TaskContext, TaskId, TaskKind, Work};
pub use crate::version::{Lifecycle, Transition, Version, VersionResolver};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
