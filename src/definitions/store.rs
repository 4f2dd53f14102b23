//! Loading and hot-reloading of the active definition set.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use super::{builtin_definitions, load_file, MetricDefinition};
use crate::Result;

/// Where definitions come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionSources {
    /// Replaces the embedded built-in definitions when set.
    pub default_file: Option<PathBuf>,
    /// Custom files, appended in order after the defaults.
    pub custom: Vec<PathBuf>,
}

/// Owns the active definition set and the content fingerprints of the
/// custom sources.
///
/// Only the scrape coordinator mutates the store, and only while it holds
/// the scrape lock before fanning out, so a cycle never observes a partial
/// reload.
#[derive(Debug)]
pub struct MetricStore {
    sources: DefinitionSources,
    fingerprints: HashMap<usize, Vec<u8>>,
    active: Vec<Arc<MetricDefinition>>,
}

impl MetricStore {
    /// Load every source once. Fails if any of them is unreadable or malformed.
    pub fn open(sources: DefinitionSources) -> Result<Self> {
        let mut store = Self {
            sources,
            fingerprints: HashMap::new(),
            active: Vec::new(),
        };
        store.active = store.load()?.into_iter().map(Arc::new).collect();
        Ok(store)
    }

    pub fn sources(&self) -> &DefinitionSources {
        &self.sources
    }

    /// Snapshot of the active set: defaults first, then custom sources in order.
    pub fn active(&self) -> Vec<Arc<MetricDefinition>> {
        self.active.clone()
    }

    /// Build a fresh set from the defaults plus every custom source.
    ///
    /// Definitions are never merged: a custom definition reusing a default
    /// context is an additional definition.
    pub fn load(&self) -> Result<Vec<MetricDefinition>> {
        let mut definitions = match &self.sources.default_file {
            Some(path) => {
                debug!(path = %path.display(), "Loading default metrics file");
                load_file(path)?
            }
            None => builtin_definitions()?,
        };

        if self.sources.custom.is_empty() {
            debug!("No custom metrics defined");
        }
        for path in &self.sources.custom {
            let custom = load_file(path)?;
            info!(
                path = %path.display(),
                count = custom.len(),
                "Successfully loaded custom metrics"
            );
            definitions.extend(custom);
        }

        Ok(definitions)
    }

    /// Replace the active set with a fresh [`load`](Self::load).
    pub fn reload(&mut self) -> Result<()> {
        let definitions = self.load()?;
        self.active = definitions.into_iter().map(Arc::new).collect();
        info!(count = self.active.len(), "Metric definitions reloaded");
        Ok(())
    }

    /// Whether a custom source changed since it was last fingerprinted.
    ///
    /// Stops at the first changed source after recording its new digest, so
    /// simultaneous edits to several sources are reported over consecutive
    /// calls. A source that cannot be read is logged and reported unchanged.
    pub fn changed(&mut self) -> bool {
        for (idx, path) in self.sources.custom.iter().enumerate() {
            debug!(path = %path.display(), "Checking metrics definition file for modifications");
            let digest = match fingerprint(path) {
                Ok(digest) => digest,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Unable to get file hash");
                    return false;
                }
            };

            if self.fingerprints.get(&idx) != Some(&digest) {
                info!(path = %path.display(), "Metrics file has been changed. Reloading metrics...");
                self.fingerprints.insert(idx, digest);
                return true;
            }
        }
        false
    }
}

fn fingerprint(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}
