use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Instant;

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::Context;
use crate::core::{Environment, RunMode};
use crate::error::{BuildError, HarvestError};
use crate::graph::{Diagnostics, RunReport, Target, TaskExecution, TaskReport, Value};
use crate::resource::{ResourceId, ResourceRegistry, Resources};
use crate::task::{Evaluation, Task, TaskId};
use crate::utils::as_overhead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Make,
    Dot,
}

/// The compiled, executable graph of a run.
pub struct Workflow {
    env: Arc<Environment>,
    registry: Arc<ResourceRegistry>,
    graph: Graph<Target, ()>,
    /// Workers get a task id and look the task up here.
    tasks: HashMap<TaskId, Arc<Task>>,
    root: TaskId,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("root", &self.root)
            .field("tasks", &self.tasks.len())
            .field("targets", &self.graph.node_count())
            .finish()
    }
}

impl Workflow {
    pub(crate) fn new(
        ctx: &Context,
        graph: Graph<Target, ()>,
        tasks: HashMap<TaskId, Arc<Task>>,
        root: TaskId,
    ) -> Self {
        Self {
            env: ctx.env().clone(),
            registry: ctx.registry().clone(),
            graph,
            tasks,
            root,
        }
    }

    pub fn root(&self) -> &TaskId {
        &self.root
    }

    pub fn task(&self, id: &TaskId) -> Option<&Arc<Task>> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values()
    }

    /// Number of tasks, the root included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn task_at(&self, index: NodeIndex) -> Option<&Arc<Task>> {
        match &self.graph[index] {
            Target::Task(id) => self.tasks.get(id),
            Target::Value(_) => None,
        }
    }

    fn task_nodes(&self) -> HashSet<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&i| matches!(self.graph[i], Target::Task(_)))
            .collect()
    }

    /// Required ids whose producer failed in this run.
    fn failed_inputs(&self, index: NodeIndex, failed: &HashSet<NodeIndex>) -> Vec<ResourceId> {
        let Some(task) = self.task_at(index) else {
            return Vec::new();
        };
        let requires = task.requires();

        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .filter(|dep| failed.contains(dep))
            .filter_map(|dep| self.task_at(dep))
            .flat_map(|dep| dep.offers().iter().map(|res| res.id().clone()))
            .filter(|id| requires.binary_search(id).is_ok())
            .collect()
    }

    /// Evaluate every task in dependency order.
    ///
    /// A single worker runs in place and in a fixed order. More workers run
    /// independent tasks concurrently; each task still starts only after all
    /// of its producers finished, successfully or not.
    pub fn run(&self, mode: RunMode, workers: usize, cores: usize) -> Result<RunReport, HarvestError> {
        let start = Instant::now();
        self.registry.clear();

        tracing::info!("Running {} tasks in {mode} mode", self.tasks.len());

        let total = self.task_nodes().len() as u64;
        let root_span = tracing::span!(Level::INFO, "workflow");
        root_span.pb_set_length(total);
        root_span.pb_set_style(&crate::utils::get_style_run()?);
        root_span.pb_set_message(&format!("Running {total} tasks..."));
        let _enter = root_span.enter();

        let task_style = crate::utils::get_style_task()?;

        let (evaluations, diagnostics) = if workers <= 1 {
            self.run_sequential(mode, cores, &root_span, &task_style)?
        } else {
            self.run_parallel(mode, workers, cores, &root_span, &task_style)?
        };

        let tasks = evaluations
            .into_iter()
            .filter_map(|(index, evaluation)| {
                let task = self.task_at(index)?;
                Some(TaskReport {
                    id: task.id().clone(),
                    evaluation,
                    status: task.status(),
                })
            })
            .collect();

        let resources: Resources = self
            .tasks
            .values()
            .flat_map(|task| task.offers().iter().cloned())
            .collect();

        let report = RunReport {
            mode,
            resources,
            tasks,
            diagnostics,
        };

        tracing::info!(
            "Finished run, {} executed, {} failed, {} dirty {}",
            report.executed().len(),
            report.failed().len(),
            report.dirty().len(),
            as_overhead(start)
        );

        Ok(report)
    }

    /// Evaluate one task inside its own progress span.
    ///
    /// Always yields an evaluation for a task node, even if evaluating it
    /// unwinds.
    fn evaluate(
        &self,
        index: NodeIndex,
        mode: RunMode,
        cores: usize,
        failed: &[ResourceId],
        parent: &Span,
        style: &ProgressStyle,
    ) -> Option<(Evaluation, TaskExecution)> {
        let task = self.task_at(index)?;

        let span = tracing::span!(parent: parent, Level::INFO, "task", name = %task.id());
        span.pb_set_style(style);
        span.pb_set_message(&format!("{}", task.id()));
        let _enter = span.enter();

        let start = Instant::now();
        let evaluation = catch_unwind(AssertUnwindSafe(|| {
            task.evaluate(&self.env, &self.registry, mode, cores, failed)
        }))
        .unwrap_or_else(|_| Evaluation::Failed(format!("Evaluating {} panicked", task.id())));

        Some((
            evaluation,
            TaskExecution {
                start,
                duration: start.elapsed(),
            },
        ))
    }

    fn run_sequential(
        &self,
        mode: RunMode,
        cores: usize,
        root_span: &Span,
        task_style: &ProgressStyle,
    ) -> Result<(Vec<(NodeIndex, Evaluation)>, Diagnostics), HarvestError> {
        let order = petgraph::algo::toposort(&self.graph, None).map_err(|cycle| BuildError::Cycle {
            path: vec![self.graph[cycle.node_id()].to_string()],
        })?;

        let mut failed = HashSet::new();
        let mut evaluations = Vec::new();
        let mut execution_times = HashMap::new();

        for index in order {
            let inputs = self.failed_inputs(index, &failed);
            let Some((evaluation, execution)) = self.evaluate(index, mode, cores, &inputs, root_span, task_style) else {
                continue;
            };
            root_span.pb_inc(1);

            if evaluation.is_failed() {
                failed.insert(index);
            }
            if let (Evaluation::Executed | Evaluation::Failed(_), Target::Task(id)) = (&evaluation, &self.graph[index]) {
                execution_times.insert(id.clone(), execution);
            }
            evaluations.push((index, evaluation));
        }

        Ok((evaluations, Diagnostics { execution_times }))
    }

    /// Dependency counting scheduler over a dedicated rayon pool.
    ///
    /// Ready tasks are spawned on the pool; the scheduling loop waits for
    /// results and releases dependents whose count drops to zero. Every
    /// spawned job sends exactly one result.
    fn run_parallel(
        &self,
        mode: RunMode,
        workers: usize,
        cores: usize,
        root_span: &Span,
        task_style: &ProgressStyle,
    ) -> Result<(Vec<(NodeIndex, Evaluation)>, Diagnostics), HarvestError> {
        let nodes = self.task_nodes();

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in self.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut dependency_counts: HashMap<NodeIndex, usize> = nodes
            .iter()
            .map(|&i| {
                let count = self
                    .graph
                    .neighbors_directed(i, Direction::Incoming)
                    .filter(|dep| nodes.contains(dep))
                    .count();
                (i, count)
            })
            .collect();

        let total = nodes.len();
        let mut completed = 0;

        // One extra thread for the scheduling loop, which blocks on results.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers + 1)
            .build()?;

        let mut evaluations = Vec::new();
        let mut execution_times = HashMap::new();
        let mut failed: HashSet<NodeIndex> = HashSet::new();

        pool.scope(|s| -> Result<(), HarvestError> {
            let (sender, receiver) = channel::<(NodeIndex, Evaluation, TaskExecution)>();

            let spawn_task = |index: NodeIndex, failed: &HashSet<NodeIndex>| {
                let inputs = self.failed_inputs(index, failed);
                let sender = sender.clone();
                let style = task_style.clone();
                let parent = root_span.clone();

                s.spawn(move |_| {
                    let start = Instant::now();
                    let (evaluation, execution) = self
                        .evaluate(index, mode, cores, &inputs, &parent, &style)
                        .unwrap_or_else(|| {
                            let lost = Evaluation::Failed(format!("No task at node {}", index.index()));
                            (lost, TaskExecution { start, duration: start.elapsed() })
                        });

                    // The receiver only goes away once the scheduler gave up.
                    let _ = sender.send((index, evaluation, execution));
                });
            };

            for &index in &nodes {
                if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                    spawn_task(index, &failed);
                }
            }

            while completed < total {
                let (index, evaluation, execution) = receiver.recv()?;
                completed += 1;
                root_span.pb_inc(1);

                if evaluation.is_failed() {
                    failed.insert(index);
                }
                if let (Evaluation::Executed | Evaluation::Failed(_), Target::Task(id)) = (&evaluation, &self.graph[index]) {
                    execution_times.insert(id.clone(), execution);
                }
                evaluations.push((index, evaluation));

                for &dependent in dependents.get(&index).into_iter().flatten() {
                    if let Some(count) = dependency_counts.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_task(dependent, &failed);
                        }
                    }
                }
            }

            Ok(())
        })?;

        Ok((evaluations, Diagnostics { execution_times }))
    }

    /// Render the dependency graph for inspection.
    pub fn export(&self, format: GraphFormat) -> String {
        let mut out = String::new();
        let _ = match format {
            GraphFormat::Make => self.write_make(&mut out),
            GraphFormat::Dot => self.write_dot(&mut out),
        };
        out
    }

    fn dependencies(&self, index: NodeIndex) -> Vec<&Target> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| &self.graph[dep])
            .filter(|target| !matches!(target, Target::Value(Value::RunMode | Value::Config)))
            .collect();
        deps.sort();
        deps
    }

    fn sorted_tasks(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<_> = self.task_nodes().into_iter().collect();
        nodes.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        nodes
    }

    fn write_make(&self, out: &mut String) -> std::fmt::Result {
        let escape = |target: &Target| target.to_string().replace(' ', "\\ ");

        writeln!(out, ".PHONY: all")?;
        writeln!(out, "all: {}", escape(&Target::Task(self.root.clone())))?;

        for index in self.sorted_tasks() {
            let deps: Vec<_> = self.dependencies(index).into_iter().map(escape).collect();
            writeln!(out)?;
            writeln!(out, "{}: {}", escape(&self.graph[index]), deps.join(" "))?;
        }
        Ok(())
    }

    fn write_dot(&self, out: &mut String) -> std::fmt::Result {
        let quote = |target: &Target| format!("{:?}", target.to_string());

        writeln!(out, "digraph workflow {{")?;
        writeln!(out, "    rankdir=LR;")?;

        for index in self.graph.node_indices() {
            let target = &self.graph[index];
            let shape = match target {
                Target::Task(_) => "box",
                Target::Value(Value::External(_)) => "ellipse",
                Target::Value(_) => continue,
            };
            writeln!(out, "    {} [shape={shape}];", quote(target))?;
        }

        for index in self.sorted_tasks() {
            for dep in self.dependencies(index) {
                writeln!(out, "    {} -> {};", quote(dep), quote(&self.graph[index]))?;
            }
        }

        writeln!(out, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::Ordering;

    use crate::graph::Builder;
    use crate::plugin::{CoreTypePlugin, EtlPlugin};
    use crate::resource::{ResourceKind, resource_path};
    use crate::store::UpdateStatus;
    use crate::task::load::MemoryTables;
    use crate::task::{Status, TaskKind};
    use crate::testing::{self, Chain, Needs};
    use crate::version::Version;

    const GENES: &str = r#"{ "parts": [{
        "part": "genes",
        "extract": { "url": "SOURCE", "add_id": {} },
        "transform": { "harmonize": { "genes": { "columns": ["name"], "target": "gene" } } }
    }] }"#;

    struct Setup {
        _dir: tempfile::TempDir,
        ctx: Context,
        tables: Arc<MemoryTables>,
        source: camino::Utf8PathBuf,
    }

    /// One ETL plugin reading a local source file, pending at 2024-01-01.
    fn setup(trust_local: bool) -> Setup {
        let (dir, mut env) = testing::environment();
        env.settings.trust_local = trust_local;
        let tables = Arc::new(MemoryTables::default());
        env.tables = tables.clone();

        let source = testing::utf8(dir.path()).join("source/genes.jsonl");
        testing::write(&source, "{\"name\":\"brca1\"}\n{\"name\":\"unknown\"}\n");

        let spec = GENES.replace("SOURCE", source.as_str());
        let spec = crate::etl::EtlSpec::from_json("civic", &spec).unwrap();

        let mut ctx = Context::new(env, testing::services());
        ctx.add_plugin(EtlPlugin::new("civic", spec)).unwrap();
        testing::pending(ctx.env(), "civic", "2024-01-01");
        ctx.register_tasks("civic", false).unwrap();

        Setup {
            _dir: dir,
            ctx,
            tables,
            source,
        }
    }

    fn workflow(ctx: &Context, plugins: &[&str]) -> Workflow {
        let mut builder = Builder::new(ctx);
        for name in plugins {
            builder.add_plugin(name, None).unwrap();
        }
        builder.build(false).unwrap()
    }

    /// Kind and outputs of every executed task, free of per-run paths.
    fn executed_names(report: &RunReport) -> Vec<String> {
        let mut names: Vec<_> = report
            .executed()
            .iter()
            .map(|id| {
                let offers: Vec<_> = id.offers.iter().map(ToString::to_string).collect();
                format!("{} {}", id.kind, offers.join(","))
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_install() {
        let setup = setup(false);
        let workflow = workflow(&setup.ctx, &["civic"]);

        let report = workflow.run(RunMode::Default, 1, 1).unwrap();
        assert!(report.failed().is_empty(), "{:?}", report.failed());

        let lifecycle = setup.ctx.lifecycle("civic").unwrap();
        assert_eq!(lifecycle.current(), Some(Version::from("2024-01-01")));
        assert_eq!(lifecycle.pending(), None);
        assert_eq!(lifecycle.current_status(), Some(UpdateStatus::Installed));

        let rows = setup.tables.rows("civic.civic_genes").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(setup.tables.rows("civic.civic_genes_genes").unwrap().len(), 1);

        let info = workflow
            .tasks()
            .find(|task| task.kind() == TaskKind::Update)
            .unwrap();
        assert_eq!(info.status(), Status::Done);
        let path = info.offers()[0].path(setup.ctx.env()).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("\"installed\"") || text.contains("\"Installed\""));
    }

    #[test]
    fn test_second_run_is_idle() {
        let setup = setup(false);
        let workflow = workflow(&setup.ctx, &["civic"]);

        let first = workflow.run(RunMode::Default, 1, 1).unwrap();
        assert!(!first.dirty().is_empty());

        let second = workflow.run(RunMode::Default, 1, 1).unwrap();
        assert!(second.executed().is_empty(), "{:?}", second.executed());
        assert!(second.dirty().is_empty());
        assert!(second.would_run().is_empty());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let sequential = setup(false);
        let report = workflow(&sequential.ctx, &["civic"])
            .run(RunMode::Default, 1, 1)
            .unwrap();

        let parallel = setup(false);
        let workflow = workflow(&parallel.ctx, &["civic"]);
        let parallel_report = workflow.run(RunMode::Default, 4, 1).unwrap();

        assert_eq!(executed_names(&report), executed_names(&parallel_report));
        assert_eq!(report.dirty().len(), parallel_report.dirty().len());
        assert_eq!(
            sequential.tables.rows("civic.civic_genes"),
            parallel.tables.rows("civic.civic_genes")
        );
        assert!(workflow.run(RunMode::Default, 4, 1).unwrap().executed().is_empty());
        assert!(!parallel_report.diagnostics.execution_times.is_empty());
    }

    #[test]
    fn test_new_source_content_cascades() {
        let setup = setup(false);
        let workflow = workflow(&setup.ctx, &["civic"]);
        workflow.run(RunMode::Default, 1, 1).unwrap();

        // A fresh download with new content.
        testing::write(&setup.source, "{\"name\":\"tp53\"}\n");
        let download = workflow
            .tasks()
            .find(|task| task.kind() == TaskKind::Extract)
            .unwrap();
        fs::remove_file(download.offers()[0].path(setup.ctx.env()).unwrap()).unwrap();

        let report = workflow.run(RunMode::Default, 1, 1).unwrap();
        let executed = executed_names(&report);
        assert_eq!(executed.len(), 6, "{executed:?}");
        assert_eq!(setup.tables.rows("civic.civic_genes").unwrap().len(), 1);
    }

    #[test]
    fn test_same_download_stops_cascade() {
        let setup = setup(false);
        let workflow = workflow(&setup.ctx, &["civic"]);
        workflow.run(RunMode::Default, 1, 1).unwrap();

        let download = workflow
            .tasks()
            .find(|task| task.kind() == TaskKind::Extract)
            .unwrap();
        fs::remove_file(download.offers()[0].path(setup.ctx.env()).unwrap()).unwrap();

        let report = workflow.run(RunMode::Default, 1, 1).unwrap();
        assert_eq!(report.executed().len(), 1);
        assert!(report.dirty().is_empty());
    }

    #[test]
    fn test_trusted_local_edit_cascades() {
        let setup = setup(true);
        let workflow = workflow(&setup.ctx, &["civic"]);
        workflow.run(RunMode::Default, 1, 1).unwrap();

        let download = workflow
            .tasks()
            .find(|task| task.kind() == TaskKind::Extract)
            .unwrap();
        let path = download.offers()[0].path(setup.ctx.env()).unwrap();
        testing::write(&path, "{\"name\":\"egfr\"}\n{\"name\":\"kras\"}\n{\"name\":\"x\"}\n");

        let report = workflow.run(RunMode::Default, 1, 1).unwrap();
        assert!(report.dirty().contains(download.offers()[0].id()));
        assert_eq!(report.executed().len(), 5);
        assert_eq!(setup.tables.rows("civic.civic_genes").unwrap().len(), 3);
    }

    #[test]
    fn test_pretend_reports_without_writing() {
        let (_dir, env) = testing::environment();
        let mut ctx = Context::new(env, testing::services());
        let chain = Chain::new("p").with_steps(3);
        let runs = chain.runs();
        ctx.add_plugin(chain).unwrap();
        testing::pending(ctx.env(), "p", "1.0");
        ctx.register_tasks("p", false).unwrap();

        let mut builder = Builder::new(&ctx);
        builder
            .add_plugin("p", Some(&[TaskKind::Extract, TaskKind::Transform]))
            .unwrap();
        let workflow = builder.build(false).unwrap();

        let commits = ctx.env().store.commits();
        let records = ctx.env().store.query(|s| s.record_count());

        let report = workflow.run(RunMode::Pretend, 1, 1).unwrap();
        assert_eq!(report.would_run().len(), 3);
        assert!(report.executed().is_empty());
        assert_eq!(report.dirty().len(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.env().store.commits(), commits);
        assert_eq!(ctx.env().store.query(|s| s.record_count()), records);
    }

    #[test]
    fn test_upstream_failure_is_isolated() {
        let (_dir, env) = testing::environment();
        let mut ctx = Context::new(env, testing::services());
        ctx.add_plugin(Chain::new("bad").failing()).unwrap();
        ctx.add_plugin(Chain::new("good")).unwrap();
        for name in ["bad", "good"] {
            testing::pending(ctx.env(), name, "1.0");
            ctx.register_tasks(name, false).unwrap();
        }

        let workflow = workflow(&ctx, &["bad", "good"]);
        let report = workflow.run(RunMode::Default, 3, 1).unwrap();

        let failed: Vec<_> = report.failed().iter().map(|id| id.to_string()).collect();
        assert_eq!(failed.len(), 2, "{failed:?}");
        assert!(failed.iter().all(|id| id.contains("::bad::")));

        let bad = ctx.lifecycle("bad").unwrap();
        assert_eq!(bad.current(), None);
        assert_eq!(bad.pending_status(), Some(UpdateStatus::Ongoing));

        let good = ctx.lifecycle("good").unwrap();
        assert_eq!(good.current_status(), Some(UpdateStatus::Installed));

        let step1 = ctx.tasks("bad").unwrap()[1].clone();
        assert!(step1.error().unwrap().contains("upstream failed"));
    }

    #[test]
    fn test_panicking_check_in_both_modes() {
        let (_dir, env) = testing::environment();
        let mut ctx = Context::new(env, testing::services());
        ctx.add_plugin(Chain::new("p").panicking_check()).unwrap();
        testing::pending(ctx.env(), "p", "1.0");
        ctx.register_tasks("p", false).unwrap();
        let workflow = workflow(&ctx, &["p"]);

        let first = workflow.run(RunMode::Default, 1, 1).unwrap();
        assert!(first.failed().is_empty(), "{:?}", first.failed());

        for workers in [1, 2] {
            let report = workflow.run(RunMode::Default, workers, 1).unwrap();
            let failed: Vec<_> = report.failed().iter().map(|id| id.name.clone()).collect();
            assert_eq!(failed, ["step1"]);
            assert_eq!(report.tasks.len(), workflow.len());
        }
    }

    #[test]
    fn test_unproduced_external_input() {
        let (_dir, env) = testing::environment();
        let mut ctx = Context::new(env, testing::services());
        let external = ResourceId::file("ext", "input.txt");
        ctx.add_plugin(Needs::new("q", external.clone())).unwrap();
        testing::pending(ctx.env(), "q", "1.0");
        testing::pending(ctx.env(), "ext", "1.0");
        ctx.register_tasks("q", false).unwrap();

        let mut builder = Builder::new(&ctx);
        builder.add_plugin("q", None).unwrap();
        let workflow = builder.build(true).unwrap();

        let report = workflow.run(RunMode::Default, 1, 1).unwrap();
        let need = report.tasks.iter().find(|t| t.id.name == "need").unwrap();
        assert!(
            matches!(&need.evaluation, Evaluation::Failed(msg) if msg.contains("File::ext::input.txt is missing")),
            "{:?}",
            need.evaluation
        );

        testing::write(&resource_path(ctx.env(), &external).unwrap(), "hello");
        let report = workflow.run(RunMode::Default, 2, 1).unwrap();
        assert!(report.failed().is_empty(), "{:?}", report.failed());
        assert_eq!(ctx.lifecycle("q").unwrap().current(), Some(Version::from("1.0")));
    }

    #[test]
    fn test_core_type_collects_tagged() {
        let setup = setup(false);
        let mut ctx = setup.ctx;
        ctx.add_plugin(CoreTypePlugin::new("genes")).unwrap();
        testing::pending(ctx.env(), "genes", "v1");
        ctx.register_tasks("genes", false).unwrap();

        let workflow = workflow(&ctx, &["civic", "genes"]);
        let report = workflow.run(RunMode::Default, 2, 1).unwrap();
        assert!(report.failed().is_empty(), "{:?}", report.failed());

        let collect = &ctx.tasks("genes").unwrap()[0];
        assert_eq!(
            collect.requires(),
            [crate::resource::ResourceId::new(
                ResourceKind::File,
                "civic",
                "genes_harmonized_genes.jsonl"
            )]
        );

        let terms = crate::dataset::read_records(&collect.offers()[0].path(ctx.env()).unwrap()).unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0]["source"], "civic");
    }

    #[test]
    fn test_force_marks_everything_dirty() {
        let setup = setup(false);
        let workflow = workflow(&setup.ctx, &["civic"]);
        workflow.run(RunMode::Default, 1, 1).unwrap();

        let report = workflow.run(RunMode::Force, 1, 1).unwrap();
        assert_eq!(report.dirty().len(), report.resources.len());

        let report = workflow.run(RunMode::Unconditional, 1, 1).unwrap();
        assert!(report.dirty().is_empty());
        assert_eq!(report.executed().len(), workflow.len() - 1);
    }

    #[test]
    fn test_export() {
        let setup = setup(false);
        let workflow = workflow(&setup.ctx, &["civic"]);

        let make = workflow.export(GraphFormat::Make);
        assert!(make.starts_with(".PHONY: all\nall: Finish::workflow::finish"));
        assert!(make.contains("Update::civic::update: "));

        let dot = workflow.export(GraphFormat::Dot);
        assert!(dot.starts_with("digraph workflow {"));
        assert!(dot.contains("\"Update::civic::update\" -> \"Finish::workflow::finish\";"));
        assert!(!dot.contains("value::run"));

        let debug = format!("{workflow:?}");
        assert!(debug.starts_with("Workflow { root: TaskId"), "{debug}");
    }
}
