//! Per-plugin assembly of task chains.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::BuildError;
use crate::etl::{EtlPart, EtlSpec};
use crate::finalize::{PLUGIN_INFO, UpdatePlugin};
use crate::resource::{Resource, ResourceId, ResourceKind, ResourceRegistry};
use crate::task::extract::{Download, Fetcher, LocalFetcher};
use crate::task::load::Load;
use crate::task::transform::{
    AssignIds, Collect, Harmonize, Harmonizer, Merge, ModifyColumns, Modifier, Unpack, Unpacker,
};
use crate::task::{Task, Work};

/// Collaborators the built-in steps call into.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn Fetcher>,
    pub unpacker: Option<Arc<dyn Unpacker>>,
    /// Keyed by core type.
    pub harmonizers: BTreeMap<String, Arc<dyn Harmonizer>>,
    pub modifiers: BTreeMap<String, Arc<dyn Modifier>>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            fetcher: Arc::new(LocalFetcher),
            unpacker: None,
            harmonizers: BTreeMap::new(),
            modifiers: BTreeMap::new(),
        }
    }
}

impl Services {
    pub fn with_fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    pub fn with_unpacker(mut self, unpacker: impl Unpacker + 'static) -> Self {
        self.unpacker = Some(Arc::new(unpacker));
        self
    }

    pub fn with_harmonizer(mut self, core_type: &str, harmonizer: impl Harmonizer + 'static) -> Self {
        self.harmonizers
            .insert(core_type.to_string(), Arc::new(harmonizer));
        self
    }

    pub fn with_modifier(mut self, name: &str, modifier: impl Modifier + 'static) -> Self {
        self.modifiers.insert(name.to_string(), Arc::new(modifier));
        self
    }
}

/// Builds the tasks of a single plugin, registering every offer as it goes.
pub struct TaskBuilder<'a> {
    plugin: String,
    registry: &'a ResourceRegistry,
    services: &'a Services,
    tasks: Vec<Arc<Task>>,
    /// Ids registered so far, and whether each was reserved before.
    registered: Vec<(ResourceId, bool)>,
}

impl<'a> TaskBuilder<'a> {
    pub fn new(plugin: impl Into<String>, registry: &'a ResourceRegistry, services: &'a Services) -> Self {
        Self {
            plugin: plugin.into(),
            registry,
            services,
            tasks: Vec::new(),
            registered: Vec::new(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn services(&self) -> &Services {
        self.services
    }

    /// Id of a resource owned by this plugin.
    pub fn resource(&self, kind: ResourceKind, name: impl Into<String>) -> ResourceId {
        ResourceId::new(kind, self.plugin.clone(), name)
    }

    /// Register `offers` and add a task producing them.
    ///
    /// Nothing is registered when any offer belongs to another plugin or is
    /// already offered.
    pub fn add_task(
        &mut self,
        offers: Vec<Resource>,
        requires: Vec<ResourceId>,
        work: impl Work + 'static,
    ) -> Result<&Arc<Task>, BuildError> {
        for res in &offers {
            if res.id().plugin != self.plugin {
                return Err(BuildError::WrongPlugin {
                    plugin: self.plugin.clone(),
                    resource: res.id().clone(),
                });
            }
            if self.registry.is_offered(res.id()) {
                return Err(crate::error::ResourceError::Duplicate(res.id().clone()).into());
            }
        }

        let mut registered = Vec::with_capacity(offers.len());
        for res in offers {
            let reserved = self.registry.lookup(res.id()).is_ok();
            let res = self.registry.register(res)?;
            self.registered.push((res.id().clone(), reserved));
            registered.push(res);
        }
        let offers = registered;

        let task = Arc::new(Task::new(self.plugin.clone(), offers, requires, work));
        tracing::debug!("Added task {}", task.id());
        self.tasks.push(task);

        Ok(&self.tasks[self.tasks.len() - 1])
    }

    /// Build the Extract, Transform and Load chain of every part.
    pub fn init_etl(&mut self, spec: &EtlSpec) -> Result<(), BuildError> {
        spec.validate(&self.plugin)?;
        for part in &spec.parts {
            self.init_part(part)?;
        }
        Ok(())
    }

    fn init_part(&mut self, part: &EtlPart) -> Result<(), BuildError> {
        let name = &part.part;
        let extract = &part.extract;

        let mut current = match (&extract.url, &extract.rid) {
            (Some(url), _) => {
                let out = extract
                    .out
                    .clone()
                    .unwrap_or_else(|| format!("{name}.download"));
                let id = self.resource(ResourceKind::File, out);
                let download = Download::new(url, self.services.fetcher.clone());
                self.add_task(vec![Resource::new(id.clone())], vec![], download)?;
                id
            }
            (None, Some(rid)) => rid.parse::<ResourceId>()?,
            (None, None) => {
                return Err(BuildError::InvalidSpec {
                    plugin: self.plugin.clone(),
                    reason: format!("part '{name}' has nothing to extract"),
                });
            }
        };

        if let Some(member) = &extract.unpack {
            let unpacker = self
                .services
                .unpacker
                .clone()
                .ok_or_else(|| BuildError::UnknownOption(format!("unpack '{member}'")))?;
            let id = self.resource(ResourceKind::File, format!("{name}_{member}"));
            let unpack = Unpack::new(current.clone(), member, unpacker);
            self.add_task(vec![Resource::new(id.clone())], vec![current], unpack)?;
            current = id;
        }

        if let Some(add_id) = &extract.add_id {
            let id = self.resource(ResourceKind::Dataset, format!("{name}_ids"));
            let work = AssignIds::new(current.clone(), &add_id.column, add_id.chunk_size);
            self.add_task(vec![Resource::new(id.clone())], vec![current], work)?;
            current = id;
        }

        if let Some(modifier) = &part.transform.modifier {
            let found = self
                .services
                .modifiers
                .get(modifier)
                .cloned()
                .ok_or_else(|| BuildError::UnknownOption(format!("modifier '{modifier}'")))?;
            let id = self.resource(ResourceKind::Dataset, format!("{name}_modified"));
            let work = ModifyColumns::new(current.clone(), modifier, found);
            self.add_task(vec![Resource::new(id.clone())], vec![current], work)?;
            current = id;
        }

        let raw = self.resource(ResourceKind::File, format!("{name}.jsonl"));
        let mut harmonized = Vec::new();
        let mut merged = Vec::new();
        let many = part.transform.harmonize.len() > 1;

        for (core_type, opts) in &part.transform.harmonize {
            let harmonizer = self
                .services
                .harmonizers
                .get(core_type)
                .cloned()
                .ok_or_else(|| BuildError::UnknownOption(format!("core type '{core_type}'")))?;

            let all = if many {
                self.resource(ResourceKind::Dataset, format!("_{name}_{core_type}"))
            } else {
                raw.clone()
            };
            let matched = self.resource(
                ResourceKind::File,
                format!("{name}_harmonized_{core_type}.jsonl"),
            );
            let unmatched = self.resource(
                ResourceKind::File,
                format!("{name}_not_harmonized_{core_type}.jsonl"),
            );

            let offers = vec![
                Resource::new(all.clone()),
                Resource::with_tags(matched.clone(), [format!("harmonized:{core_type}")]),
                Resource::new(unmatched),
            ];
            let work = Harmonize::new(
                current.clone(),
                core_type,
                opts.columns.clone(),
                &opts.target,
                harmonizer,
            );
            self.add_task(offers, vec![current.clone()], work)?;

            harmonized.push((core_type.clone(), matched));
            merged.push(all);
        }

        if many {
            let column = extract
                .add_id
                .as_ref()
                .map(|opts| opts.column.clone())
                .unwrap_or_else(|| String::from("id"));
            let work = Merge::new(merged.clone(), column);
            self.add_task(vec![Resource::new(raw.clone())], merged, work)?;
        }

        let raw = if part.transform.harmonize.is_empty() {
            current
        } else {
            raw
        };

        if !part.load.create_table {
            return Ok(());
        }

        let references = part
            .load
            .references
            .iter()
            .map(|rid| rid.parse::<ResourceId>())
            .collect::<Result<Vec<_>, _>>()?;

        let table = part
            .load
            .table
            .clone()
            .unwrap_or_else(|| format!("{}_{name}", self.plugin));
        let table = self.resource(ResourceKind::Table, table);
        self.add_task(
            vec![Resource::new(table)],
            vec![raw.clone()],
            Load::new(raw, references),
        )?;

        for (core_type, matched) in harmonized {
            let table = self.resource(
                ResourceKind::Table,
                format!("{}_{name}_{core_type}", self.plugin),
            );
            self.add_task(
                vec![Resource::new(table)],
                vec![matched.clone()],
                Load::new(matched, vec![]),
            )?;
        }

        Ok(())
    }

    /// Gather every resource tagged `tag` into the file `name`.
    pub fn collect(&mut self, tag: &str, name: &str) -> Result<(), BuildError> {
        let id = self.resource(ResourceKind::File, name);
        self.add_task(vec![Resource::new(id)], vec![], Collect::new(tag))?;
        Ok(())
    }

    /// Add the finalizer, requiring everything offered so far.
    pub fn finish(&mut self) -> Result<(), BuildError> {
        let requires = self
            .tasks
            .iter()
            .flat_map(|task| task.offers().iter().map(|res| res.id().clone()))
            .collect();

        let info = self.resource(ResourceKind::File, PLUGIN_INFO);
        self.add_task(
            vec![Resource::new(info)],
            requires,
            UpdatePlugin::new(&self.plugin),
        )?;
        Ok(())
    }

    pub fn build(&mut self, spec: &EtlSpec) -> Result<(), BuildError> {
        self.init_etl(spec)?;
        self.finish()
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Arc<Task>> {
        self.tasks
    }

    /// Drop everything registered so far, leaving the registry as it was.
    pub fn rollback(self) {
        for (id, reserved) in self.registered.iter().rev() {
            self.registry.unregister(id, *reserved);
        }
        tracing::debug!("Rolled back {} resources of {}", self.registered.len(), self.plugin);
    }
}
