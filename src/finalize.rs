//! Tasks that close a plugin and a whole run.

use std::fs;

use anyhow::Context as _;
use serde::Serialize;

use crate::error::TaskError;
use crate::store::UpdateStatus;
use crate::task::{TaskContext, TaskKind, Work};
use crate::version::{Lifecycle, Transition};

/// Name of the file every plugin's finalizer writes.
pub const PLUGIN_INFO: &str = "plugin_info.json";

#[derive(Serialize)]
struct PluginInfo<'a> {
    plugin: &'a str,
    version: Option<String>,
    status: Option<UpdateStatus>,
}

/// Advances the plugin's version lifecycle after all of its other tasks.
///
/// Requires every resource the plugin offers, so it always runs last for the
/// plugin, and it runs even when some of them failed.
pub struct UpdatePlugin {
    plugin: String,
}

impl UpdatePlugin {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
        }
    }

    fn consistent(&self, ctx: &TaskContext) -> Result<bool, TaskError> {
        for id in ctx.requires() {
            let res = ctx.registry.lookup(id)?;
            if !res.is_consistent(ctx.env)? {
                tracing::warn!("{} is inconsistent", id);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Work for UpdatePlugin {
    fn kind(&self) -> TaskKind {
        TaskKind::Update
    }

    fn name(&self) -> String {
        String::from("update")
    }

    fn tolerates_failed_inputs(&self) -> bool {
        true
    }

    fn requires_work(&self, ctx: &TaskContext) -> Result<bool, TaskError> {
        let lifecycle = Lifecycle::new(&self.plugin, ctx.env.store.clone());
        if lifecycle.pending().is_some() || !lifecycle.is_installed() {
            return Ok(true);
        }
        Ok(!self.consistent(ctx)?)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let lifecycle = Lifecycle::new(&self.plugin, ctx.env.store.clone());

        let consistent = self.consistent(ctx)?;
        let tasks_done = ctx.failed().is_empty();

        match lifecycle.finalize(consistent, tasks_done)? {
            Transition::Installed(version) => {
                tracing::info!("Installed {} {version}", self.plugin)
            }
            Transition::Upgraded { from, to } => {
                tracing::info!("Upgraded {} from {from} to {to}", self.plugin)
            }
            Transition::Fixed(version) => {
                tracing::info!("Confirmed {} {version}", self.plugin)
            }
            Transition::Retry(version) => {
                tracing::error!("Couldn't finish {} {version}, retrying next run", self.plugin)
            }
            Transition::Broken(version) => {
                tracing::error!("{} {version} needs repair", self.plugin)
            }
            Transition::Unchanged => {}
        }

        let info = PluginInfo {
            plugin: &self.plugin,
            version: lifecycle.working().map(|v| v.to_string()),
            status: lifecycle.pending_status().or(lifecycle.current_status()),
        };

        let path = ctx.output_path(0)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(&info)?)
            .with_context(|| format!("Couldn't write {path}"))?;

        Ok(())
    }
}

/// Root of every workflow, reports what changed.
pub struct FinishWorkflow;

impl Work for FinishWorkflow {
    fn kind(&self) -> TaskKind {
        TaskKind::Finish
    }

    fn name(&self) -> String {
        String::from("finish")
    }

    fn tolerates_failed_inputs(&self) -> bool {
        true
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let dirty = ctx
            .requires()
            .iter()
            .filter(|id| ctx.registry.lookup(id).is_ok_and(|res| res.is_dirty()))
            .count();

        match dirty {
            0 => tracing::info!("Nothing changed"),
            n => tracing::info!("{n} resources changed"),
        }

        if !ctx.failed().is_empty() {
            tracing::warn!("{} resources could not be produced", ctx.failed().len());
        }

        Ok(())
    }
}
