//! Fetching source files.

use std::fs;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use camino::Utf8Path;

use crate::task::{TaskContext, TaskKind, Work};

/// Brings a remote file to a local path.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Utf8Path) -> anyhow::Result<()>;
}

/// Copies local paths and `file://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFetcher;

impl Fetcher for LocalFetcher {
    fn fetch(&self, url: &str, dest: &Utf8Path) -> anyhow::Result<()> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        if source.contains("://") {
            bail!("Unsupported URL scheme: {url}");
        }

        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::copy(source, dest).with_context(|| format!("Couldn't fetch {url}"))?;
        Ok(())
    }
}

/// Download `url` into the single offered file.
pub struct Download {
    url: String,
    fetcher: Arc<dyn Fetcher>,
}

impl Download {
    pub fn new(url: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            url: url.into(),
            fetcher,
        }
    }
}

impl Work for Download {
    fn kind(&self) -> TaskKind {
        TaskKind::Extract
    }

    fn name(&self) -> String {
        format!("download {}", self.url)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let dest = ctx.output_path(0)?;
        tracing::info!("Fetching {} into {dest}", self.url);
        self.fetcher.fetch(&self.url, &dest)
    }
}
