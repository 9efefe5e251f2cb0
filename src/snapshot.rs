use std::fs;
use std::hash::Hasher;
use std::io;
use std::time::UNIX_EPOCH;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::dataset;
use crate::error::TaskError;

/// Physical state of a resource at the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snapshot {
    File {
        size: u64,
        checksum: String,
        /// Seconds since the epoch; informational only.
        modified: u64,
    },
    Dataset {
        size: u64,
        files: u64,
        checksum: String,
        modified: u64,
    },
    Table {
        rows: u64,
    },
}

impl Snapshot {
    pub fn probe_file(path: &Utf8Path) -> io::Result<Option<Snapshot>> {
        let meta = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(Some(Snapshot::File {
            size: meta.len(),
            checksum: Hash32::hash_file(path)?.to_hex(),
            modified: modified_secs(&meta),
        }))
    }

    /// Hash every chunk of a dataset directory in name order.
    pub fn probe_dataset(dir: &Utf8Path) -> Result<Option<Snapshot>, TaskError> {
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut hasher = Blake3Hasher::default();
        let mut size = 0;
        let mut modified = 0;
        let parts = dataset::parts(dir)?;

        for part in &parts {
            let meta = fs::metadata(part)?;
            size += meta.len();
            modified = modified.max(modified_secs(&meta));

            if let Some(name) = part.file_name() {
                hasher.write(name.as_bytes());
            }
            hasher.write(Hash32::hash_file(part)?.to_hex().as_bytes());
        }

        Ok(Some(Snapshot::Dataset {
            size,
            files: parts.len() as u64,
            checksum: Hash32::from(hasher).to_hex(),
            modified,
        }))
    }

    /// Content equality: sizes first, then checksums. Modification times
    /// never count, a rewrite with identical bytes is the same content.
    pub fn same_content(&self, other: &Snapshot) -> bool {
        match (self, other) {
            (
                Snapshot::File { size, checksum, .. },
                Snapshot::File {
                    size: size2,
                    checksum: checksum2,
                    ..
                },
            ) => size == size2 && checksum == checksum2,
            (
                Snapshot::Dataset {
                    size,
                    files,
                    checksum,
                    ..
                },
                Snapshot::Dataset {
                    size: size2,
                    files: files2,
                    checksum: checksum2,
                    ..
                },
            ) => size == size2 && files == files2 && checksum == checksum2,
            (Snapshot::Table { rows }, Snapshot::Table { rows: rows2 }) => rows == rows2,
            _ => false,
        }
    }
}

fn modified_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|dur| dur.as_secs())
        .unwrap_or_default()
}
