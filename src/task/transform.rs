//! Transform steps between extraction and loading.
//!
//! Each step reads its inputs by id and writes only its own offers. The
//! actual parsing and vocabulary matching are supplied by collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use camino::Utf8Path;
use rayon::prelude::*;
use serde_json::Value;

use crate::dataset::{self, Record};
use crate::resource::{ResourceId, ResourceKind, ResourceRegistry};
use crate::task::{TaskContext, TaskKind, Work};

/// Pulls one member out of an archive.
pub trait Unpacker: Send + Sync {
    fn unpack(&self, archive: &Utf8Path, member: &str, dest: &Utf8Path) -> anyhow::Result<()>;
}

/// Matches records against a controlled vocabulary.
///
/// Returned records carry the target column, `null` where nothing matched.
pub trait Harmonizer: Send + Sync {
    fn harmonize(&self, records: Vec<Record>, columns: &[String], target: &str) -> anyhow::Result<Vec<Record>>;
}

/// Source specific column rewrites.
pub trait Modifier: Send + Sync {
    fn modify(&self, records: Vec<Record>) -> anyhow::Result<Vec<Record>>;
}

fn chunk_size(ctx: &TaskContext, chunk_size: Option<usize>) -> usize {
    chunk_size.unwrap_or(ctx.env.settings.chunk_size)
}

/// Write to output `index`, as a dataset or a file depending on its kind.
fn write_output(ctx: &TaskContext, index: usize, records: &[Record]) -> anyhow::Result<()> {
    let output = ctx.output(index)?;
    let path = output.path(ctx.env)?;
    let as_dataset = output.kind() == ResourceKind::Dataset;

    dataset::write_to(&path, as_dataset, records, ctx.env.settings.chunk_size)?;
    Ok(())
}

pub struct Unpack {
    input: ResourceId,
    member: String,
    unpacker: Arc<dyn Unpacker>,
}

impl Unpack {
    pub fn new(input: ResourceId, member: impl Into<String>, unpacker: Arc<dyn Unpacker>) -> Self {
        Self {
            input,
            member: member.into(),
            unpacker,
        }
    }
}

impl Work for Unpack {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn name(&self) -> String {
        format!("unpack {}", self.member)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let archive = ctx.path(&self.input)?;
        let dest = ctx.output_path(0)?;
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.unpacker.unpack(&archive, &self.member, &dest)
    }
}

/// Number the records from 1 into a dataset.
pub struct AssignIds {
    input: ResourceId,
    column: String,
    chunk_size: Option<usize>,
}

impl AssignIds {
    pub fn new(input: ResourceId, column: impl Into<String>, chunk_size: Option<usize>) -> Self {
        Self {
            input,
            column: column.into(),
            chunk_size,
        }
    }
}

impl Work for AssignIds {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn name(&self) -> String {
        format!("add {}", self.column)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let mut records = dataset::read_records(&ctx.path(&self.input)?)?;
        for (i, record) in records.iter_mut().enumerate() {
            record.insert(self.column.clone(), Value::from(i as u64 + 1));
        }

        let parts = dataset::write_dataset(
            &ctx.output_path(0)?,
            &records,
            chunk_size(ctx, self.chunk_size),
        )?;
        tracing::debug!("Numbered {} records into {parts} parts", records.len());
        Ok(())
    }
}

pub struct ModifyColumns {
    input: ResourceId,
    name: String,
    modifier: Arc<dyn Modifier>,
}

impl ModifyColumns {
    pub fn new(input: ResourceId, name: impl Into<String>, modifier: Arc<dyn Modifier>) -> Self {
        Self {
            input,
            name: name.into(),
            modifier,
        }
    }
}

impl Work for ModifyColumns {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn name(&self) -> String {
        format!("modify {}", self.name)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let records = dataset::read_records(&ctx.path(&self.input)?)?;
        let records = self.modifier.modify(records)?;
        write_output(ctx, 0, &records)
    }
}

/// Split records by whether a core type matched.
///
/// Offers, in order: every record with the target column, the matched
/// records, the unmatched records.
pub struct Harmonize {
    input: ResourceId,
    core_type: String,
    columns: Vec<String>,
    target: String,
    harmonizer: Arc<dyn Harmonizer>,
}

impl Harmonize {
    pub fn new(
        input: ResourceId,
        core_type: impl Into<String>,
        columns: Vec<String>,
        target: impl Into<String>,
        harmonizer: Arc<dyn Harmonizer>,
    ) -> Self {
        Self {
            input,
            core_type: core_type.into(),
            columns,
            target: target.into(),
            harmonizer,
        }
    }
}

impl Work for Harmonize {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn name(&self) -> String {
        format!("harmonize {}", self.core_type)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let records = dataset::read_records(&ctx.path(&self.input)?)?;
        let records = self
            .harmonizer
            .harmonize(records, &self.columns, &self.target)?;

        let (matched, unmatched): (Vec<_>, Vec<_>) = records
            .iter()
            .cloned()
            .partition(|record| record.get(&self.target).is_some_and(|v| !v.is_null()));

        tracing::info!(
            "Harmonized {} of {} records against {}",
            matched.len(),
            records.len(),
            self.core_type
        );

        write_output(ctx, 0, &records)?;
        write_output(ctx, 1, &matched)?;
        write_output(ctx, 2, &unmatched)
    }
}

/// Join per core type datasets on an id column.
pub struct Merge {
    inputs: Vec<ResourceId>,
    id_column: String,
}

impl Merge {
    pub fn new(inputs: Vec<ResourceId>, id_column: impl Into<String>) -> Self {
        Self {
            inputs,
            id_column: id_column.into(),
        }
    }
}

impl Work for Merge {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn name(&self) -> String {
        String::from("merge")
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let mut merged: BTreeMap<String, Record> = BTreeMap::new();
        let mut order = Vec::new();

        for input in &self.inputs {
            for record in dataset::read_records(&ctx.path(input)?)? {
                let key = record
                    .get(&self.id_column)
                    .map(Value::to_string)
                    .ok_or_else(|| anyhow!("{input} has a record without '{}'", self.id_column))?;

                match merged.get_mut(&key) {
                    Some(existing) => existing.extend(record),
                    None => {
                        order.push(key.clone());
                        merged.insert(key, record);
                    }
                }
            }
        }

        let records: Vec<_> = order
            .iter()
            .filter_map(|key| merged.remove(key))
            .collect();
        write_output(ctx, 0, &records)
    }
}

/// Gather every resource carrying a tag into one file.
///
/// The inputs are only known once every plugin registered its tasks.
pub struct Collect {
    tag: String,
}

impl Collect {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Work for Collect {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn name(&self) -> String {
        format!("collect {}", self.tag)
    }

    fn post_register(&self, registry: &ResourceRegistry) -> Vec<ResourceId> {
        registry.tagged(&self.tag)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let batches = ctx
            .requires()
            .par_iter()
            .map(|id| -> anyhow::Result<Vec<Record>> {
                let mut records = dataset::read_records(&ctx.path(id)?)?;
                for record in &mut records {
                    record.insert("source".into(), Value::from(id.plugin.clone()));
                }
                Ok(records)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let records: Vec<_> = batches.into_iter().flatten().collect();
        tracing::info!("Collected {} records tagged {}", records.len(), self.tag);
        write_output(ctx, 0, &records)
    }
}
