use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const PREFIX: &str = "HARVEST_";

/// Engine settings.
///
/// Read from a JSON file and then overridden by `HARVEST_*` environment
/// variables, e.g. `HARVEST_DATA_DIR=/srv/data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root directory of every file and dataset resource.
    pub data_dir: Utf8PathBuf,
    /// Treat existing artifacts as authoritative and record them instead of
    /// rebuilding.
    pub trust_local: bool,
    /// Compare row counts of tables against their records.
    pub perform_table_check: bool,
    /// Whether a table with zero rows counts as consistent.
    pub allow_empty_tables: bool,
    /// Records per dataset chunk when a task does not ask for a size.
    pub chunk_size: usize,
    /// Plugins that are known but must not be registered.
    pub disabled_plugins: BTreeSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: Utf8PathBuf::from("data"),
            trust_local: false,
            perform_table_check: true,
            allow_empty_tables: false,
            chunk_size: 100_000,
            disabled_plugins: BTreeSet::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file, then apply the process environment.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        settings.with_overrides(std::env::vars())
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `HARVEST_*` overrides; other variables are ignored.
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(PREFIX) else {
                continue;
            };
            let value = value.as_ref();

            match name {
                "DATA_DIR" => self.data_dir = Utf8PathBuf::from(value),
                "TRUST_LOCAL" => self.trust_local = parse_flag(key.as_ref(), value)?,
                "PERFORM_TABLE_CHECK" => {
                    self.perform_table_check = parse_flag(key.as_ref(), value)?
                }
                "ALLOW_EMPTY_TABLES" => self.allow_empty_tables = parse_flag(key.as_ref(), value)?,
                "CHUNK_SIZE" => {
                    self.chunk_size = value
                        .parse()
                        .ok()
                        .filter(|&size: &usize| size > 0)
                        .ok_or_else(|| invalid(key.as_ref(), value))?
                }
                "DISABLED_PLUGINS" => {
                    self.disabled_plugins = value
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(String::from)
                        .collect()
                }
                _ => tracing::warn!("Ignoring unknown setting {}", key.as_ref()),
            }
        }

        Ok(self)
    }

    pub fn is_disabled(&self, plugin: &str) -> bool {
        self.disabled_plugins.contains(plugin)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Override {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.data_dir, "data");
        assert!(settings.perform_table_check);
        assert!(!settings.trust_local);
        assert!(!settings.allow_empty_tables);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("harvest.json")).unwrap();
        fs::write(&path, r#"{ "trust_local": true, "chunk_size": 10 }"#).unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert!(settings.trust_local);
        assert_eq!(settings.chunk_size, 10);
        assert_eq!(settings.data_dir, "data");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("harvest.json")).unwrap();
        fs::write(&path, r#"{ "trust_locals": true }"#).unwrap();

        assert!(matches!(
            Settings::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::default()
            .with_overrides([
                ("HARVEST_DATA_DIR", "/srv/data"),
                ("HARVEST_TRUST_LOCAL", "yes"),
                ("HARVEST_DISABLED_PLUGINS", "civic, oncokb,"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();

        assert_eq!(settings.data_dir, "/srv/data");
        assert!(settings.trust_local);
        assert!(settings.is_disabled("civic"));
        assert!(settings.is_disabled("oncokb"));
        assert_eq!(settings.disabled_plugins.len(), 2);
    }

    #[test]
    fn test_bad_override() {
        let result = Settings::default().with_overrides([("HARVEST_CHUNK_SIZE", "0")]);
        assert!(matches!(result, Err(ConfigError::Override { .. })));

        let result = Settings::default().with_overrides([("HARVEST_TRUST_LOCAL", "maybe")]);
        assert!(matches!(result, Err(ConfigError::Override { .. })));
    }
}
