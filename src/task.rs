//! Units of work and the rules deciding whether they have to run.
//!
//! A [`Task`] offers resources and requires resource ids. What the task
//! actually does is supplied through the [`Work`] trait; the engine owns the
//! lifecycle around it:
//!
//! * the staleness check ([`Task::requires_work`]),
//! * status transitions and timestamps,
//! * recording of every offered resource after a successful run,
//! * containment of errors and panics, which never cross the task boundary.

pub mod builder;
pub mod extract;
pub mod load;
pub mod transform;

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::anyhow;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::{Environment, RunMode};
use crate::error::{ResourceError, TaskError};
use crate::resource::{Resource, ResourceId, ResourceIds, ResourceRegistry, resource_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    Extract,
    Transform,
    Load,
    Update,
    Finish,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Extract => "Extract",
            TaskKind::Transform => "Transform",
            TaskKind::Load => "Load",
            TaskKind::Update => "Update",
            TaskKind::Finish => "Finish",
        };
        f.write_str(name)
    }
}

/// Structured identity of a task, compared by value.
///
/// Offered ids are kept sorted, so two tasks with the same name but
/// different outputs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub kind: TaskKind,
    pub plugin: String,
    pub name: String,
    pub offers: Vec<ResourceId>,
}

impl TaskId {
    pub fn new(
        kind: TaskKind,
        plugin: impl Into<String>,
        name: impl Into<String>,
        offers: impl IntoIterator<Item = ResourceId>,
    ) -> Self {
        let mut offers: Vec<_> = offers.into_iter().collect();
        offers.sort();

        Self {
            kind,
            plugin: plugin.into(),
            name: name.into(),
            offers,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.kind, self.plugin, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Init,
    Working,
    Done,
    Error,
}

/// Outcome of evaluating a task once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Nothing to do, outputs are up to date.
    Skipped,
    /// Would have run; outputs marked dirty, nothing written.
    Pretended,
    Executed,
    Failed(String),
}

impl Evaluation {
    pub fn is_failed(&self) -> bool {
        matches!(self, Evaluation::Failed(_))
    }
}

/// Read-only view handed to [`Work`] while a task is evaluated.
pub struct TaskContext<'a> {
    pub env: &'a Environment,
    pub registry: &'a ResourceRegistry,
    pub mode: RunMode,
    /// Cores the task may use for its own parallelism.
    pub cores: usize,
    pub id: &'a TaskId,
    offers: &'a [Resource],
    requires: &'a [ResourceId],
    failed: &'a [ResourceId],
    pub(crate) span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub fn offers(&self) -> &'a [Resource] {
        self.offers
    }

    pub fn requires(&self) -> &'a [ResourceId] {
        self.requires
    }

    /// Required ids whose producer failed during this run.
    pub fn failed(&self) -> &'a [ResourceId] {
        self.failed
    }

    pub fn output(&self, index: usize) -> anyhow::Result<&'a Resource> {
        self.offers
            .get(index)
            .ok_or_else(|| anyhow!("task {} has no output #{index}", self.id))
    }

    pub fn output_path(&self, index: usize) -> anyhow::Result<Utf8PathBuf> {
        Ok(self.output(index)?.path(self.env)?)
    }

    pub fn path(&self, id: &ResourceId) -> Result<Utf8PathBuf, ResourceError> {
        resource_path(self.env, id)
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// What a task does. Implemented by the built-in ETL steps and by plugins.
pub trait Work: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn name(&self) -> String;

    /// Extra requirements discovered once every task is registered.
    fn post_register(&self, _registry: &ResourceRegistry) -> Vec<ResourceId> {
        Vec::new()
    }

    /// Additional reasons to run on top of the generic staleness rules.
    fn requires_work(&self, _ctx: &TaskContext) -> Result<bool, TaskError> {
        Ok(false)
    }

    /// Run even when some inputs failed upstream.
    fn tolerates_failed_inputs(&self) -> bool {
        false
    }

    /// Produce every offered resource. Must not touch anything else.
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
struct TaskState {
    status: Status,
    started: Option<SystemTime>,
    finished: Option<SystemTime>,
    error: Option<String>,
}

pub struct Task {
    id: TaskId,
    offers: Vec<Resource>,
    requires: ResourceIds,
    work: Box<dyn Work>,
    state: Mutex<TaskState>,
}

impl Task {
    pub fn new(
        plugin: impl Into<String>,
        offers: Vec<Resource>,
        requires: impl IntoIterator<Item = ResourceId>,
        work: impl Work + 'static,
    ) -> Self {
        let id = TaskId::new(
            work.kind(),
            plugin,
            work.name(),
            offers.iter().map(|res| res.id().clone()),
        );

        Self {
            id,
            offers,
            requires: ResourceIds::new(requires),
            work: Box::new(work),
            state: Mutex::new(TaskState::default()),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.id.kind
    }

    pub fn plugin(&self) -> &str {
        &self.id.plugin
    }

    pub fn offers(&self) -> &[Resource] {
        &self.offers
    }

    pub fn requires(&self) -> Vec<ResourceId> {
        self.requires.to_vec()
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn started(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().started
    }

    pub fn finished(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().finished
    }

    /// Add requirements discovered after registration, then freeze them.
    pub(crate) fn post_register(&self, registry: &ResourceRegistry) -> Result<(), ResourceError> {
        self.requires.extend(self.work.post_register(registry))?;
        self.requires.close();
        Ok(())
    }

    /// Whether the task has to run against the current state.
    pub fn requires_work(
        &self,
        env: &Environment,
        registry: &ResourceRegistry,
        mode: RunMode,
    ) -> Result<bool, TaskError> {
        let requires = self.requires();
        let ctx = self.context(env, registry, mode, 1, &requires, &[]);
        self.check(&ctx)
    }

    fn context<'a>(
        &'a self,
        env: &'a Environment,
        registry: &'a ResourceRegistry,
        mode: RunMode,
        cores: usize,
        requires: &'a [ResourceId],
        failed: &'a [ResourceId],
    ) -> TaskContext<'a> {
        TaskContext {
            env,
            registry,
            mode,
            cores,
            id: &self.id,
            offers: &self.offers,
            requires,
            failed,
            span: tracing::Span::current(),
        }
    }

    fn check(&self, ctx: &TaskContext) -> Result<bool, TaskError> {
        let env = ctx.env;

        for id in ctx.requires {
            match ctx.registry.lookup(id) {
                Ok(res) if res.is_dirty() => {
                    tracing::debug!("{} requires work, {id} is dirty", self.id);
                    return Ok(true);
                }
                Ok(_) => {}
                Err(_) => {
                    if !Resource::new(id.clone()).exists(env)? {
                        return Err(TaskError::MissingInput(id.clone()));
                    }
                    tracing::warn!("{} requires {id}, which no registered task offers", self.id);
                }
            }
        }

        let mut inconsistent = false;
        for res in &self.offers {
            if res.is_consistent(env)? {
                continue;
            }

            if env.settings.trust_local && res.probe(env)?.is_some() {
                if ctx.mode != RunMode::Pretend {
                    res.update_record(env)?;
                }
                res.mark_dirty();
                tracing::info!("Trusting existing {}", res.id());
                continue;
            }

            tracing::debug!("{} requires work, {} is inconsistent", self.id, res.id());
            inconsistent = true;
        }

        if inconsistent {
            return Ok(true);
        }

        if self.is_obsolete(ctx) {
            tracing::debug!("{} requires work, an input changed after it ran", self.id);
            return Ok(true);
        }

        self.work.requires_work(ctx)
    }

    /// An input's content changed after an output was last built.
    fn is_obsolete(&self, ctx: &TaskContext) -> bool {
        ctx.env.store.query(|state| {
            let Some(latest) = ctx
                .requires
                .iter()
                .filter_map(|id| state.record(id))
                .map(|record| record.changed_at)
                .max()
            else {
                return false;
            };

            self.offers.iter().any(|res| {
                state
                    .record(res.id())
                    .is_none_or(|record| record.built_at < latest)
            })
        })
    }

    /// Evaluate the task once for a run.
    ///
    /// Every error or panic raised on the way, by the staleness check as much
    /// as by the work itself, ends up as [`Evaluation::Failed`].
    pub(crate) fn evaluate(
        &self,
        env: &Environment,
        registry: &ResourceRegistry,
        mode: RunMode,
        cores: usize,
        failed: &[ResourceId],
    ) -> Evaluation {
        self.requires.close();
        *self.state.lock().unwrap() = TaskState::default();

        let requires = self.requires();
        let ctx = self.context(env, registry, mode, cores, &requires, failed);

        match catch_unwind(AssertUnwindSafe(|| self.evaluate_in(&ctx))) {
            Ok(Ok(evaluation)) => evaluation,
            Ok(Err(err)) => self.fail(err),
            Err(panic) => self.fail(TaskError::Panic(panic_message(panic.as_ref()))),
        }
    }

    fn evaluate_in(&self, ctx: &TaskContext) -> Result<Evaluation, TaskError> {
        if !ctx.failed.is_empty() && !self.work.tolerates_failed_inputs() {
            return Err(TaskError::UpstreamFailed {
                task: self.id.clone(),
                inputs: ctx.failed.to_vec(),
            });
        }

        if !ctx.mode.is_unconditional() && !self.check(ctx)? {
            tracing::debug!("{} is up to date", self.id);
            return Ok(Evaluation::Skipped);
        }

        if ctx.mode == RunMode::Pretend {
            for res in &self.offers {
                res.mark_dirty();
            }
            tracing::info!("Would run {}", self.id);
            return Ok(Evaluation::Pretended);
        }

        self.check_inputs(ctx)?;

        {
            let mut state = self.state.lock().unwrap();
            state.status = Status::Working;
            state.started = Some(SystemTime::now());
        }

        self.work.execute(ctx)?;
        self.record_outputs(ctx)?;

        let mut state = self.state.lock().unwrap();
        state.status = Status::Done;
        state.finished = Some(SystemTime::now());
        tracing::info!("Finished {}", self.id);
        Ok(Evaluation::Executed)
    }

    /// Every input not lost to an upstream failure has to be there.
    fn check_inputs(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        for id in ctx.requires.iter().filter(|id| !ctx.failed.contains(id)) {
            let res = ctx
                .registry
                .lookup(id)
                .unwrap_or_else(|_| Resource::new(id.clone()));

            if !res.exists(ctx.env)? {
                return Err(TaskError::MissingInput(id.clone()));
            }
        }
        Ok(())
    }

    /// Record every output in one transaction, then flag the changed ones.
    ///
    /// A missing output aborts before anything is committed.
    fn record_outputs(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let snapshots = self
            .offers
            .iter()
            .map(|res| {
                res.probe(ctx.env)?
                    .ok_or_else(|| TaskError::MissingOutput(res.id().clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let changed = ctx.env.store.transaction(|state| {
            self.offers
                .iter()
                .zip(snapshots)
                .map(|(res, snapshot)| {
                    state.put_record(res.id(), snapshot).ok_or_else(|| {
                        TaskError::from(ResourceError::NoWorkingUpdate(res.id().plugin.clone()))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        for (res, changed) in self.offers.iter().zip(changed) {
            if changed || ctx.mode == RunMode::Force {
                res.mark_dirty();
            }
        }
        Ok(())
    }

    fn fail(&self, err: TaskError) -> Evaluation {
        tracing::error!("Task {} failed: {err}", self.id);

        let msg = err.to_string();
        let mut state = self.state.lock().unwrap();
        state.status = Status::Error;
        state.finished = Some(SystemTime::now());
        state.error = Some(msg.clone());

        Evaluation::Failed(msg)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("requires", &self.requires)
            .field("status", &self.status())
            .finish()
    }
}
