//! Loading records into tables.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::dataset::{self, Record};
use crate::resource::{ResourceId, ResourceRegistry};
use crate::task::{TaskContext, TaskKind, Work};

/// Where `Table` resources live.
pub trait TableBackend: Send + Sync {
    /// Rows in `table`, `None` if the table does not exist.
    fn row_count(&self, table: &str) -> anyhow::Result<Option<u64>>;

    /// Replace the contents of `table`, creating it when needed.
    fn load(&self, table: &str, records: Vec<Record>) -> anyhow::Result<u64>;

    fn drop_table(&self, table: &str) -> anyhow::Result<()>;
}

/// Tables held in process memory.
#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: Mutex<BTreeMap<String, Vec<Record>>>,
}

impl MemoryTables {
    /// Copy of the rows of `table`.
    pub fn rows(&self, table: &str) -> Option<Vec<Record>> {
        self.tables.lock().unwrap().get(table).cloned()
    }
}

impl TableBackend for MemoryTables {
    fn row_count(&self, table: &str) -> anyhow::Result<Option<u64>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).map(|rows| rows.len() as u64))
    }

    fn load(&self, table: &str, records: Vec<Record>) -> anyhow::Result<u64> {
        let count = records.len() as u64;
        self.tables.lock().unwrap().insert(table.to_string(), records);
        Ok(count)
    }

    fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }
}

/// Load a file or dataset into the offered table.
pub struct Load {
    input: ResourceId,
    /// Tables this one refers to, loaded first.
    references: Vec<ResourceId>,
}

impl Load {
    pub fn new(input: ResourceId, references: Vec<ResourceId>) -> Self {
        Self { input, references }
    }
}

impl Work for Load {
    fn kind(&self) -> TaskKind {
        TaskKind::Load
    }

    fn name(&self) -> String {
        format!("load {}", self.input.name)
    }

    fn post_register(&self, _registry: &ResourceRegistry) -> Vec<ResourceId> {
        self.references.clone()
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let table = ctx.output(0)?;
        let records = dataset::read_records(&ctx.path(&self.input)?)?;

        let name = table.id().table_name();
        let rows = ctx.env.tables.load(&name, records)?;
        tracing::info!("Loaded {rows} rows into {name}");
        Ok(())
    }
}
