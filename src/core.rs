use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::store::Store;
use crate::task::load::{MemoryTables, TableBackend};

/// A 32-byte BLAKE3 hash used for content checksums.
///
/// Every file and dataset snapshot stores the hex form of this hash, which is
/// what decides whether a physical artifact still matches its record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    #[cfg(test)]
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental hasher for content spread over several files.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// How a workflow run treats the staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunMode {
    /// Run a task only when it requires work.
    #[default]
    Default,
    /// Decide which tasks would run and mark their outputs dirty, but do no work.
    Pretend,
    /// Run every task regardless of its state.
    Unconditional,
    /// Run every task and treat every output as changed.
    Force,
}

impl RunMode {
    /// Whether the staleness check is skipped altogether.
    pub fn is_unconditional(self) -> bool {
        matches!(self, RunMode::Unconditional | RunMode::Force)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Default => "default",
            RunMode::Pretend => "pretend",
            RunMode::Unconditional => "unconditional",
            RunMode::Force => "force",
        };
        f.write_str(name)
    }
}

/// Immutable ambient state shared by every task of a run.
///
/// Nothing in here is global: a process may hold several environments, each
/// with its own store and table backend.
#[derive(Clone)]
pub struct Environment {
    /// Settings loaded at startup.
    pub settings: Settings,
    /// Persistent metadata: plugins, versions, updates, resource records.
    pub store: Arc<Store>,
    /// Where `Table` resources live.
    pub tables: Arc<dyn TableBackend>,
}

impl Environment {
    pub fn new(settings: Settings, store: Arc<Store>, tables: Arc<dyn TableBackend>) -> Self {
        Self {
            settings,
            store,
            tables,
        }
    }

    /// An environment with an in-memory store and in-memory tables.
    pub fn memory(settings: Settings) -> Self {
        Self::new(
            settings,
            Arc::new(Store::memory()),
            Arc::new(MemoryTables::default()),
        )
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
