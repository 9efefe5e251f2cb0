//! Assembly of the global dependency graph.
//!
//! The [`Builder`] merges the tasks of every added plugin into one set of
//! rules, each rule mapping a task to the targets it requires. A target is
//! either another task or a read-only value: the run mode, the ambient
//! configuration, or an external resource nobody in the graph produces.
//!
//! Validation happens entirely before anything runs: a missing producer or a
//! dependency cycle aborts [`Builder::build`].

mod diagnostics;
mod workflow;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::context::Context;
use crate::error::BuildError;
use crate::finalize::FinishWorkflow;
use crate::resource::ResourceId;
use crate::task::{Task, TaskId, TaskKind};

pub use diagnostics::{Diagnostics, RunReport, TaskExecution, TaskReport};
pub use workflow::{GraphFormat, Workflow};

/// Plugin name of the root task.
pub const ROOT_PLUGIN: &str = "workflow";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    RunMode,
    Config,
    /// Required but produced outside of this graph.
    External(ResourceId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Task(TaskId),
    Value(Value),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Task(id) => write!(f, "{id}"),
            Target::Value(Value::RunMode) => f.write_str("value::run"),
            Target::Value(Value::Config) => f.write_str("value::config"),
            Target::Value(Value::External(id)) => write!(f, "value::{id}"),
        }
    }
}

pub struct Builder<'c> {
    ctx: &'c Context,
    /// Producer of every offered resource.
    producers: BTreeMap<ResourceId, TaskId>,
    tasks: BTreeMap<TaskId, Arc<Task>>,
    /// Tasks the root depends on directly.
    roots: Vec<TaskId>,
    plugins: BTreeSet<String>,
}

impl<'c> Builder<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self {
            ctx,
            producers: BTreeMap::new(),
            tasks: BTreeMap::new(),
            roots: Vec::new(),
            plugins: BTreeSet::new(),
        }
    }

    /// Add the registered tasks of a plugin, optionally only some kinds.
    ///
    /// The plugin's finalizer links it to the root. When the filter leaves
    /// the finalizer out, every added task links to the root instead.
    pub fn add_plugin(&mut self, name: &str, filter: Option<&[TaskKind]>) -> Result<&mut Self, BuildError> {
        if !self.ctx.has_plugin(name) {
            return Err(BuildError::UnknownPlugin(name.to_string()));
        }

        let tasks = self
            .ctx
            .tasks(name)
            .ok_or_else(|| BuildError::NotRegistered(name.to_string()))?;

        let included: Vec<_> = tasks
            .iter()
            .filter(|task| filter.is_none_or(|kinds| kinds.contains(&task.kind())))
            .cloned()
            .collect();

        let finalizers: Vec<_> = included
            .iter()
            .filter(|task| task.kind() == TaskKind::Update)
            .map(|task| task.id().clone())
            .collect();

        if finalizers.is_empty() {
            self.roots
                .extend(included.iter().map(|task| task.id().clone()));
        } else {
            self.roots.extend(finalizers);
        }

        for task in included {
            for res in task.offers() {
                self.producers.insert(res.id().clone(), task.id().clone());
            }
            self.tasks.insert(task.id().clone(), task);
        }

        self.plugins.insert(name.to_string());
        tracing::debug!("Added plugin {name} to the workflow");
        Ok(self)
    }

    /// Validate the rules and compile them into an executable workflow.
    ///
    /// With `add_missing` a requirement nobody produces becomes an external
    /// value instead of an error.
    pub fn build(self, add_missing: bool) -> Result<Workflow, BuildError> {
        self.ctx.post_register()?;

        let requires: Vec<ResourceId> = self
            .roots
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .flat_map(|task| task.offers().iter().map(|res| res.id().clone()))
            .collect();
        let root = Arc::new(Task::new(ROOT_PLUGIN, vec![], requires, FinishWorkflow));
        let root_id = root.id().clone();

        let mut tasks = self.tasks.clone();
        tasks.insert(root_id.clone(), root);

        let mut rules: BTreeMap<TaskId, BTreeSet<Target>> = BTreeMap::new();
        for (id, task) in &tasks {
            let mut targets = BTreeSet::new();
            for required in task.requires() {
                match self.producers.get(&required) {
                    Some(producer) => {
                        targets.insert(Target::Task(producer.clone()));
                    }
                    None if add_missing => {
                        tracing::debug!("{id} uses {required} as an external value");
                        targets.insert(Target::Value(Value::External(required)));
                    }
                    None => {
                        let hint = self.hint(&required);
                        return Err(BuildError::MissingDependency {
                            task: id.clone(),
                            target: required,
                            hint,
                        });
                    }
                }
            }
            rules.insert(id.clone(), targets);
        }

        check_cycles(&root_id, &rules)?;

        let graph = compile(&rules);
        let tasks = tasks.into_iter().collect();
        Ok(Workflow::new(self.ctx, graph, tasks, root_id))
    }

    /// Why nobody offers `id`.
    fn hint(&self, id: &ResourceId) -> String {
        let plugin = &id.plugin;
        if !self.ctx.has_plugin(plugin) {
            format!(" (unknown plugin '{plugin}')")
        } else if !self.ctx.is_enabled(plugin) {
            format!(" (plugin '{plugin}' is disabled)")
        } else if !self.plugins.contains(plugin) {
            format!(" (plugin '{plugin}' was not added to the workflow)")
        } else if self.ctx.registry().is_offered(id) {
            String::from(" (its producer was filtered out)")
        } else {
            String::new()
        }
    }
}

/// Iterative depth-first search over task dependencies.
///
/// Starts from the root, then from anything the root does not reach.
fn check_cycles(root: &TaskId, rules: &BTreeMap<TaskId, BTreeSet<Target>>) -> Result<(), BuildError> {
    let deps: BTreeMap<&TaskId, Vec<&TaskId>> = rules
        .iter()
        .map(|(id, targets)| {
            let tasks = targets
                .iter()
                .filter_map(|target| match target {
                    Target::Task(dep) => Some(dep),
                    Target::Value(_) => None,
                })
                .collect();
            (id, tasks)
        })
        .collect();

    let mut done: HashSet<&TaskId> = HashSet::new();
    let starts = std::iter::once(root).chain(rules.keys());

    for start in starts {
        if done.contains(start) {
            continue;
        }

        let mut stack: Vec<(&TaskId, usize)> = vec![(start, 0)];
        let mut on_stack: HashSet<&TaskId> = HashSet::from([start]);

        while let Some(&(node, next)) = stack.last() {
            let edges = deps.get(node).map(Vec::as_slice).unwrap_or_default();

            let Some(&dep) = edges.get(next) else {
                on_stack.remove(node);
                done.insert(node);
                stack.pop();
                continue;
            };

            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            if on_stack.contains(dep) {
                let from = stack.iter().position(|(id, _)| *id == dep).unwrap_or(0);
                let mut path: Vec<String> = stack[from..].iter().map(|(id, _)| id.to_string()).collect();
                path.push(dep.to_string());
                return Err(BuildError::Cycle { path });
            }

            if !done.contains(dep) {
                on_stack.insert(dep);
                stack.push((dep, 0));
            }
        }
    }

    Ok(())
}

/// Edges point from a dependency to its dependent.
fn compile(rules: &BTreeMap<TaskId, BTreeSet<Target>>) -> Graph<Target, ()> {
    let mut graph = Graph::new();
    let mut nodes: BTreeMap<Target, NodeIndex> = BTreeMap::new();

    let mut node = |graph: &mut Graph<Target, ()>, target: Target| {
        *nodes
            .entry(target.clone())
            .or_insert_with(|| graph.add_node(target))
    };

    let run = node(&mut graph, Target::Value(Value::RunMode));
    let config = node(&mut graph, Target::Value(Value::Config));

    for (id, targets) in rules {
        let this = node(&mut graph, Target::Task(id.clone()));
        graph.add_edge(run, this, ());
        graph.add_edge(config, this, ());

        for target in targets {
            let dep = node(&mut graph, target.clone());
            graph.add_edge(dep, this, ());
        }
    }

    graph
}
