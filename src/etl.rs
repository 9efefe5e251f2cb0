//! ETL specifications, the per-plugin description of what to build.
//!
//! ```json
//! { "parts": [{
//!     "part": "variants",
//!     "extract": { "url": "https://...", "unpack": "variants.tsv", "add_id": {} },
//!     "transform": { "harmonize": { "genes": { "columns": ["gene"], "target": "gene_id" } } },
//!     "load": { "references": ["Table::civic::civic_evidence"] }
//! }] }
//! ```

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::BuildError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EtlSpec {
    pub parts: Vec<EtlPart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EtlPart {
    pub part: String,
    pub extract: ExtractOpts,
    #[serde(default)]
    pub transform: TransformOpts,
    #[serde(default)]
    pub load: LoadOpts,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractOpts {
    /// Remote file to download.
    pub url: Option<String>,
    /// Existing resource to start from, given as `Kind::plugin::name`.
    pub rid: Option<String>,
    /// Name of the downloaded file, defaults to `<part>.download`.
    pub out: Option<String>,
    /// Archive member to extract.
    pub unpack: Option<String>,
    pub add_id: Option<AddIdOpts>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddIdOpts {
    #[serde(default = "default_id_column")]
    pub column: String,
    pub chunk_size: Option<usize>,
}

fn default_id_column() -> String {
    String::from("id")
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformOpts {
    pub modifier: Option<String>,
    #[serde(default)]
    pub harmonize: BTreeMap<String, HarmonizeOpts>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarmonizeOpts {
    pub columns: Vec<String>,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadOpts {
    #[serde(default = "default_true")]
    pub create_table: bool,
    pub table: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl Default for LoadOpts {
    fn default() -> Self {
        Self {
            create_table: true,
            table: None,
            references: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl EtlSpec {
    pub fn from_json(plugin: &str, text: &str) -> Result<Self, BuildError> {
        let spec: EtlSpec = serde_json::from_str(text).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("unknown field") {
                BuildError::UnknownOption(msg)
            } else {
                BuildError::InvalidSpec {
                    plugin: plugin.to_string(),
                    reason: msg,
                }
            }
        })?;

        spec.validate(plugin)?;
        Ok(spec)
    }

    pub fn validate(&self, plugin: &str) -> Result<(), BuildError> {
        let invalid = |reason: String| BuildError::InvalidSpec {
            plugin: plugin.to_string(),
            reason,
        };

        for part in &self.parts {
            match (&part.extract.url, &part.extract.rid) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(invalid(format!(
                        "part '{}' needs exactly one of 'url' or 'rid'",
                        part.part
                    )));
                }
            }

            if part.transform.harmonize.len() > 1 && part.extract.add_id.is_none() {
                return Err(invalid(format!(
                    "part '{}' harmonizes several core types and needs 'add_id'",
                    part.part
                )));
            }
        }

        Ok(())
    }
}

/// Source of ETL specifications.
pub trait SpecLoader: Send + Sync {
    fn load_spec(&self, plugin: &str) -> Result<EtlSpec, BuildError>;
}

/// Reads `<dir>/<plugin>.json`.
#[derive(Debug, Clone)]
pub struct JsonSpecLoader {
    dir: Utf8PathBuf,
}

impl JsonSpecLoader {
    pub fn new(dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }
}

impl SpecLoader for JsonSpecLoader {
    fn load_spec(&self, plugin: &str) -> Result<EtlSpec, BuildError> {
        let path = self.dir.join(format!("{plugin}.json"));
        let text = fs::read_to_string(&path).map_err(|e| BuildError::InvalidSpec {
            plugin: plugin.to_string(),
            reason: format!("couldn't read {path}: {e}"),
        })?;

        EtlSpec::from_json(plugin, &text)
    }
}
