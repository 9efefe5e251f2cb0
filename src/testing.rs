//! Fixtures shared by the unit tests.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::config::Settings;
use crate::core::Environment;
use crate::dataset::Record;
use crate::error::{BuildError, TaskError};
use crate::plugin::{Plugin, PluginKind};
use crate::resource::{Resource, ResourceId, ResourceKind};
use crate::task::builder::{Services, TaskBuilder};
use crate::task::transform::{Harmonizer, Modifier, Unpacker};
use crate::task::{TaskContext, TaskKind, Work};
use crate::version::{Lifecycle, Version, VersionResolver};

/// An in-memory environment whose data directory is a fresh temp dir.
pub(crate) fn environment() -> (TempDir, Environment) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        data_dir: utf8(dir.path()),
        ..Settings::default()
    };
    (dir, Environment::memory(settings))
}

pub(crate) fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

pub(crate) fn write(path: &Utf8Path, content: &str) {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    fs::write(path, content).unwrap();
}

pub(crate) fn record(id: u64, name: &str) -> Record {
    let Value::Object(map) = json!({ "id": id, "name": name }) else {
        unreachable!()
    };
    map
}

pub(crate) fn pending(env: &Environment, plugin: &str, version: &str) {
    let lifecycle = Lifecycle::new(plugin, env.store.clone());
    lifecycle.ensure_model().unwrap();
    lifecycle.create_update(&Version::from(version)).unwrap();
}

pub(crate) fn install(env: &Environment, plugin: &str, version: &str) {
    pending(env, plugin, version);
    Lifecycle::new(plugin, env.store.clone())
        .finalize(true, true)
        .unwrap();
}

/// Copies the archive itself, whatever the member.
struct CopyArchive;

impl Unpacker for CopyArchive {
    fn unpack(&self, archive: &Utf8Path, _member: &str, dest: &Utf8Path) -> anyhow::Result<()> {
        fs::copy(archive, dest)?;
        Ok(())
    }
}

/// Matches everything except `unknown`, upper-casing the first column.
struct Upper;

impl Harmonizer for Upper {
    fn harmonize(&self, records: Vec<Record>, columns: &[String], target: &str) -> anyhow::Result<Vec<Record>> {
        let column = columns.first().ok_or_else(|| anyhow!("no columns"))?;

        Ok(records
            .into_iter()
            .map(|mut record| {
                let term = match record.get(column).and_then(Value::as_str) {
                    Some("unknown") | None => Value::Null,
                    Some(name) => Value::from(name.to_uppercase()),
                };
                record.insert(target.to_string(), term);
                record
            })
            .collect())
    }
}

/// Drops records without a name.
struct DropNameless;

impl Modifier for DropNameless {
    fn modify(&self, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(records
            .into_iter()
            .filter(|record| record.contains_key("name"))
            .collect())
    }
}

pub(crate) fn services() -> Services {
    Services::default()
        .with_unpacker(CopyArchive)
        .with_harmonizer("genes", Upper)
        .with_harmonizer("drugs", Upper)
        .with_modifier("drop_nameless", DropNameless)
}

enum Action {
    Text(String),
    Copy(ResourceId),
    Fail,
    Panic,
    Nothing,
}

/// Minimal work writing its first output.
pub(crate) struct Emit {
    name: String,
    kind: TaskKind,
    action: Action,
    check_panics: bool,
    runs: Arc<AtomicUsize>,
}

impl Emit {
    fn new(name: &str, action: Action) -> Self {
        Self {
            name: name.to_string(),
            kind: TaskKind::Transform,
            action,
            check_panics: false,
            runs: Arc::default(),
        }
    }

    pub(crate) fn text(name: &str, content: &str) -> Self {
        Self::new(name, Action::Text(content.to_string()))
    }

    pub(crate) fn copy(name: &str, from: ResourceId) -> Self {
        Self::new(name, Action::Copy(from))
    }

    pub(crate) fn fail(name: &str) -> Self {
        Self::new(name, Action::Fail)
    }

    pub(crate) fn panic(name: &str) -> Self {
        Self::new(name, Action::Panic)
    }

    pub(crate) fn nothing(name: &str) -> Self {
        Self::new(name, Action::Nothing)
    }

    pub(crate) fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn counting(mut self, runs: &Arc<AtomicUsize>) -> Self {
        self.runs = runs.clone();
        self
    }

    /// Panic whenever asked for extra reasons to run.
    pub(crate) fn panicking_check(mut self) -> Self {
        self.check_panics = true;
        self
    }
}

impl Work for Emit {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn requires_work(&self, _ctx: &TaskContext) -> Result<bool, TaskError> {
        if self.check_panics {
            panic!("check exploded");
        }
        Ok(false)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        match &self.action {
            Action::Text(content) => write(&ctx.output_path(0)?, content),
            Action::Copy(from) => {
                let content = fs::read_to_string(ctx.path(from)?)?;
                write(&ctx.output_path(0)?, &content);
            }
            Action::Fail => bail!("failed on purpose"),
            Action::Panic => panic!("boom"),
            Action::Nothing => {}
        }
        Ok(())
    }
}

/// Remote version the tests can move forward.
#[derive(Clone, Default)]
pub(crate) struct Remote(Arc<Mutex<Option<Version>>>);

impl Remote {
    pub(crate) fn set(&self, version: &str) {
        *self.0.lock().unwrap() = Some(Version::from(version));
    }
}

impl VersionResolver for Remote {
    fn latest_version(&self, _plugin: &str) -> anyhow::Result<Option<Version>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// A linear chain `step0 -> step1 -> ...` plus the finalizer.
pub(crate) struct Chain {
    name: String,
    steps: usize,
    failing: bool,
    panicking_check: bool,
    remote: Option<Remote>,
    runs: Arc<AtomicUsize>,
}

impl Chain {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: 2,
            failing: false,
            panicking_check: false,
            remote: None,
            runs: Arc::default(),
        }
    }

    pub(crate) fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub(crate) fn with_remote(mut self, remote: Remote) -> Self {
        self.remote = Some(remote);
        self
    }

    /// The first step fails.
    pub(crate) fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// The last step panics while checking whether it has to run.
    pub(crate) fn panicking_check(mut self) -> Self {
        self.panicking_check = true;
        self
    }

    pub(crate) fn runs(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

impl Plugin for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::DataSource
    }

    fn latest_version(&self) -> anyhow::Result<Option<Version>> {
        match &self.remote {
            Some(remote) => remote.latest_version(&self.name),
            None => Ok(None),
        }
    }

    fn register(&self, builder: &mut TaskBuilder) -> Result<(), BuildError> {
        let mut previous: Option<ResourceId> = None;

        for i in 0..self.steps {
            let name = format!("step{i}");
            let id = builder.resource(ResourceKind::File, format!("{name}.txt"));

            let (work, requires) = match previous.take() {
                None if self.failing => (Emit::fail(&name).with_kind(TaskKind::Extract), vec![]),
                None => (
                    Emit::text(&name, &self.name).with_kind(TaskKind::Extract),
                    vec![],
                ),
                Some(prev) => (Emit::copy(&name, prev.clone()), vec![prev]),
            };

            let work = if self.panicking_check && i + 1 == self.steps {
                work.panicking_check()
            } else {
                work
            };

            builder.add_task(
                vec![Resource::new(id.clone())],
                requires,
                work.counting(&self.runs),
            )?;
            previous = Some(id);
        }

        builder.finish()
    }
}

/// Two tasks requiring each other's output.
pub(crate) struct Cycle {
    name: String,
    runs: Arc<AtomicUsize>,
}

impl Cycle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runs: Arc::default(),
        }
    }

    pub(crate) fn runs(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

impl Plugin for Cycle {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::DataSource
    }

    fn register(&self, builder: &mut TaskBuilder) -> Result<(), BuildError> {
        let x = builder.resource(ResourceKind::File, "x.txt");
        let y = builder.resource(ResourceKind::File, "y.txt");

        builder.add_task(
            vec![Resource::new(x.clone())],
            vec![y.clone()],
            Emit::copy("x", y.clone()).counting(&self.runs),
        )?;
        builder.add_task(
            vec![Resource::new(y)],
            vec![x.clone()],
            Emit::copy("y", x).counting(&self.runs),
        )?;
        builder.finish()
    }
}

/// One task requiring a resource of somebody else.
pub(crate) struct Needs {
    name: String,
    target: ResourceId,
}

impl Needs {
    pub(crate) fn new(name: &str, target: ResourceId) -> Self {
        Self {
            name: name.to_string(),
            target,
        }
    }
}

impl Plugin for Needs {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::DataSource
    }

    fn register(&self, builder: &mut TaskBuilder) -> Result<(), BuildError> {
        let out = builder.resource(ResourceKind::File, "needed.txt");
        builder.add_task(
            vec![Resource::new(out)],
            vec![self.target.clone()],
            Emit::copy("need", self.target.clone()),
        )?;
        builder.finish()
    }
}
