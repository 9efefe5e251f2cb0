//! The explicit context every run goes through.
//!
//! It owns the plugins, their registered tasks and the resource registry.
//! Several independent contexts may live in one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::Environment;
use crate::error::{BuildError, HarvestError, VersionError};
use crate::plugin::{Plugin, PluginStatus, StatusFlag};
use crate::resource::ResourceRegistry;
use crate::task::Task;
use crate::task::builder::{Services, TaskBuilder};
use crate::version::{Lifecycle, Version};

struct Entry {
    plugin: Arc<dyn Plugin>,
    tasks: Option<Vec<Arc<Task>>>,
}

pub struct Context {
    env: Arc<Environment>,
    registry: Arc<ResourceRegistry>,
    services: Services,
    plugins: BTreeMap<String, Entry>,
}

impl Context {
    pub fn new(env: Environment, services: Services) -> Self {
        Self {
            env: Arc::new(env),
            registry: Arc::new(ResourceRegistry::new()),
            services,
            plugins: BTreeMap::new(),
        }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn add_plugin(&mut self, plugin: impl Plugin + 'static) -> Result<(), HarvestError> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(BuildError::DuplicatePlugin(name).into());
        }

        Lifecycle::new(&name, self.env.store.clone()).ensure_model()?;
        self.plugins.insert(
            name,
            Entry {
                plugin: Arc::new(plugin),
                tasks: None,
            },
        );
        Ok(())
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.env.settings.is_disabled(name)
    }

    pub fn lifecycle(&self, name: &str) -> Result<Lifecycle, VersionError> {
        if !self.has_plugin(name) {
            return Err(VersionError::UnknownPlugin(name.to_string()));
        }
        Ok(Lifecycle::new(name, self.env.store.clone()))
    }

    /// Ask the remote for its latest version and remember it locally.
    fn refresh_latest(&self, name: &str) -> Result<Option<Version>, VersionError> {
        let entry = self
            .plugins
            .get(name)
            .ok_or_else(|| VersionError::UnknownPlugin(name.to_string()))?;

        let latest = entry
            .plugin
            .latest_version()
            .map_err(VersionError::Resolver)?;

        if let Some(version) = &latest {
            self.lifecycle(name)?.add_version(version)?;
        }
        Ok(latest)
    }

    /// Fail if the pending update no longer targets the newest version.
    fn guard_upgrade(&self, name: &str) -> Result<(), VersionError> {
        self.refresh_latest(name)?;
        let lifecycle = self.lifecycle(name)?;

        if lifecycle.check_upgrade() {
            return Ok(());
        }

        Err(VersionError::NewPluginVersion {
            plugin: name.to_string(),
            pending: lifecycle.pending().map(|v| v.to_string()).unwrap_or_default(),
            latest: lifecycle
                .local_latest()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        })
    }

    /// Choose the newest known version as the next build target.
    ///
    /// Returns the version when a new pending update was created.
    pub fn update_version(&self, name: &str) -> Result<Option<Version>, HarvestError> {
        let lifecycle = self.lifecycle(name)?;
        if lifecycle.is_frozen() {
            tracing::info!("{name} is frozen, not looking for updates");
            return Ok(None);
        }

        self.refresh_latest(name)?;
        let Some(latest) = lifecycle.local_latest() else {
            return Ok(None);
        };

        if lifecycle.current().as_ref() == Some(&latest) || lifecycle.pending().as_ref() == Some(&latest) {
            return Ok(None);
        }

        lifecycle.create_update(&latest)?;
        tracing::info!("{name} will be built at version {latest}");
        Ok(Some(latest))
    }

    /// Register whatever the plugin's state calls for: install, upgrade or fix.
    pub fn register_tasks(&mut self, name: &str, check_upgrade: bool) -> Result<&[Arc<Task>], HarvestError> {
        let lifecycle = self.lifecycle(name)?;

        match (lifecycle.current(), lifecycle.pending()) {
            (None, None) => return Err(VersionError::MissingAnyVersion(name.to_string()).into()),
            (_, Some(_)) if check_upgrade => self.guard_upgrade(name)?,
            _ => {}
        }

        self.register(name)
    }

    /// Register tasks building the pending version.
    pub fn register_upgrade_tasks(&mut self, name: &str, check_upgrade: bool) -> Result<&[Arc<Task>], HarvestError> {
        let lifecycle = self.lifecycle(name)?;
        if lifecycle.pending().is_none() {
            return Err(VersionError::MissingPendingVersion(name.to_string()).into());
        }

        if check_upgrade {
            self.guard_upgrade(name)?;
        }

        self.register(name)
    }

    /// Register tasks repairing the current version.
    pub fn register_update_tasks(&mut self, name: &str) -> Result<&[Arc<Task>], HarvestError> {
        let lifecycle = self.lifecycle(name)?;
        if lifecycle.current().is_none() {
            return Err(VersionError::MissingCurrentVersion(name.to_string()).into());
        }

        self.register(name)
    }

    fn register(&mut self, name: &str) -> Result<&[Arc<Task>], HarvestError> {
        if !self.is_enabled(name) {
            return Err(HarvestError::Disabled(name.to_string()));
        }

        let entry = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| BuildError::UnknownPlugin(name.to_string()))?;

        if entry.tasks.is_some() {
            return Err(BuildError::AlreadyRegistered(name.to_string()).into());
        }

        let mut builder = TaskBuilder::new(name, &self.registry, &self.services);
        if let Err(err) = entry.plugin.register(&mut builder) {
            builder.rollback();
            return Err(err.into());
        }

        let tasks = builder.into_tasks();
        tracing::debug!("Registered {} tasks for {name}", tasks.len());

        let tasks = entry.tasks.insert(tasks);
        Ok(tasks.as_slice())
    }

    /// Resolve late requirements and freeze the registry.
    ///
    /// Runs once, later calls do nothing.
    pub fn post_register(&self) -> Result<(), BuildError> {
        if self.registry.is_closed() {
            return Ok(());
        }

        for task in self.plugins.values().flat_map(|e| e.tasks.iter().flatten()) {
            task.post_register(&self.registry)?;
        }

        self.registry.close();
        Ok(())
    }

    /// Registered tasks of a plugin, `None` if not registered yet.
    pub fn tasks(&self, name: &str) -> Option<&[Arc<Task>]> {
        self.plugins.get(name)?.tasks.as_deref()
    }

    pub fn status(&self, name: &str) -> Result<PluginStatus, HarvestError> {
        let entry = self
            .plugins
            .get(name)
            .ok_or_else(|| BuildError::UnknownPlugin(name.to_string()))?;
        let lifecycle = self.lifecycle(name)?;

        let current = lifecycle.current().zip(lifecycle.current_status());
        let pending = lifecycle.pending().zip(lifecycle.pending_status());
        let latest = lifecycle.local_latest();

        let mut flags = Vec::new();
        if !self.is_enabled(name) {
            flags.push(StatusFlag::Disabled);
        }
        if lifecycle.is_frozen() {
            flags.push(StatusFlag::Frozen);
        }
        if latest.is_some() && !lifecycle.is_uptodate() {
            flags.push(StatusFlag::NewLatest);
        }

        let inconsistent = entry
            .tasks
            .iter()
            .flatten()
            .flat_map(|task| task.offers())
            .filter(|res| !res.is_consistent(&self.env).unwrap_or(false))
            .count();
        if inconsistent > 0 {
            flags.push(StatusFlag::Inconsistent(inconsistent));
        }

        Ok(PluginStatus {
            name: name.to_string(),
            kind: entry.plugin.kind(),
            current,
            pending,
            latest,
            flags,
        })
    }
}
