//! Plugins: named sources of tasks.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::BuildError;
use crate::etl::{EtlSpec, SpecLoader};
use crate::store::UpdateStatus;
use crate::task::builder::TaskBuilder;
use crate::version::{Version, VersionResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginKind {
    /// Integrates an external data source.
    DataSource,
    /// Owns a controlled vocabulary that data sources harmonize against.
    CoreType,
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PluginKind;

    /// Newest version the remote offers, `None` when unknown.
    fn latest_version(&self) -> anyhow::Result<Option<Version>> {
        Ok(None)
    }

    /// Add every task of the plugin, the finalizer included.
    fn register(&self, builder: &mut TaskBuilder) -> Result<(), BuildError>;
}

/// A data source described entirely by its ETL specification.
pub struct EtlPlugin {
    name: String,
    spec: EtlSpec,
    resolver: Option<Arc<dyn VersionResolver>>,
}

impl EtlPlugin {
    pub fn new(name: impl Into<String>, spec: EtlSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            resolver: None,
        }
    }

    pub fn load(name: impl Into<String>, loader: &dyn SpecLoader) -> Result<Self, BuildError> {
        let name = name.into();
        let spec = loader.load_spec(&name)?;
        Ok(Self::new(name, spec))
    }

    pub fn with_resolver(mut self, resolver: impl VersionResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }
}

impl Plugin for EtlPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::DataSource
    }

    fn latest_version(&self) -> anyhow::Result<Option<Version>> {
        match &self.resolver {
            Some(resolver) => resolver.latest_version(&self.name),
            None => Ok(None),
        }
    }

    fn register(&self, builder: &mut TaskBuilder) -> Result<(), BuildError> {
        builder.build(&self.spec)
    }
}

/// Collects every resource harmonized against one core type.
pub struct CoreTypePlugin {
    name: String,
    resolver: Option<Arc<dyn VersionResolver>>,
}

impl CoreTypePlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: impl VersionResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }
}

impl Plugin for CoreTypePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::CoreType
    }

    fn latest_version(&self) -> anyhow::Result<Option<Version>> {
        match &self.resolver {
            Some(resolver) => resolver.latest_version(&self.name),
            None => Ok(None),
        }
    }

    fn register(&self, builder: &mut TaskBuilder) -> Result<(), BuildError> {
        builder.collect(
            &format!("harmonized:{}", self.name),
            &format!("{}_terms.jsonl", self.name),
        )?;
        builder.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatusFlag {
    Disabled,
    Frozen,
    /// A newer version than the current one is known.
    NewLatest,
    /// Offered resources not matching their records.
    Inconsistent(usize),
}

/// Summary of a plugin for status views.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub kind: PluginKind,
    pub current: Option<(Version, UpdateStatus)>,
    pub pending: Option<(Version, UpdateStatus)>,
    pub latest: Option<Version>,
    pub flags: Vec<StatusFlag>,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some((version, status)) = &self.current {
            write!(f, " current={version} ({status})")?;
        }
        if let Some((version, status)) = &self.pending {
            write!(f, " pending={version} ({status})")?;
        }
        if let Some(latest) = &self.latest {
            write!(f, " latest={latest}")?;
        }
        for flag in &self.flags {
            write!(f, " [{flag:?}]")?;
        }
        Ok(())
    }
}
