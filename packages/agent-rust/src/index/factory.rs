//! Opening partition indexes by path.
//!
//! An [`IndexFactory`] knows whether a partition path is reachable and how
//! to open the engine that lives there. The index process probes
//! [`IndexFactory::path_accessible`] on every tick and terminates once the
//! path disappears.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::engine::IndexEngine;
use super::engines::MemoryIndexEngine;

/// Locates and opens partition index engines.
pub trait IndexFactory: Send + Sync {
    /// Whether the partition path can currently be reached.
    fn path_accessible(&self, path: &str) -> bool;

    /// Opens the engine stored at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is unreachable or the engine cannot be opened.
    fn open(&self, path: &str) -> anyhow::Result<Arc<dyn IndexEngine>>;
}

/// Factory for in-memory engines keyed by path.
///
/// Engines outlive the processes that open them, so a restarted index
/// process sees the same contents. Paths can be made unavailable to
/// simulate a lost or renamed volume.
#[derive(Default)]
pub struct MemoryIndexFactory {
    engines: DashMap<String, Arc<MemoryIndexEngine>>,
    unavailable: RwLock<HashSet<String>>,
}

impl MemoryIndexFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `path` reachable or unreachable.
    pub fn set_path_available(&self, path: &str, available: bool) {
        let mut unavailable = self.unavailable.write();
        if available {
            unavailable.remove(path);
        } else {
            unavailable.insert(path.to_string());
        }
    }

    /// Discards the engine stored at `path`, as if the volume were wiped.
    pub fn wipe(&self, path: &str) {
        self.engines.remove(path);
    }
}

impl IndexFactory for MemoryIndexFactory {
    fn path_accessible(&self, path: &str) -> bool {
        !self.unavailable.read().contains(path)
    }

    fn open(&self, path: &str) -> anyhow::Result<Arc<dyn IndexEngine>> {
        if !self.path_accessible(path) {
            anyhow::bail!("index path {path} is not accessible");
        }
        let engine = self
            .engines
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(MemoryIndexEngine::new()))
            .clone();
        Ok(engine)
    }
}

#[cfg(feature = "redb")]
pub use self::durable::RedbIndexFactory;

#[cfg(feature = "redb")]
mod durable {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::Context;
    use dashmap::DashMap;

    use super::IndexFactory;
    use crate::index::engine::IndexEngine;
    use crate::index::engines::RedbIndexEngine;

    /// File name of the index database inside a partition directory.
    pub const INDEX_FILE_NAME: &str = "ddb.redb";

    /// Factory for redb engines stored at `<partition path>/ddb.redb`.
    ///
    /// A redb file can only be opened once per process, so open databases
    /// are cached by path.
    #[derive(Default)]
    pub struct RedbIndexFactory {
        open: DashMap<String, Arc<RedbIndexEngine>>,
    }

    impl RedbIndexFactory {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl IndexFactory for RedbIndexFactory {
        fn path_accessible(&self, path: &str) -> bool {
            Path::new(path).is_dir()
        }

        fn open(&self, path: &str) -> anyhow::Result<Arc<dyn IndexEngine>> {
            if let Some(engine) = self.open.get(path) {
                return Ok(engine.clone());
            }
            if !self.path_accessible(path) {
                anyhow::bail!("index path {path} is not accessible");
            }
            let engine = Arc::new(
                RedbIndexEngine::open(&Path::new(path).join(INDEX_FILE_NAME))
                    .with_context(|| format!("opening partition index at {path}"))?,
            );
            self.open.insert(path.to_string(), engine.clone());
            Ok(engine)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn opens_existing_directories_only() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().to_string_lossy().into_owned();
            let factory = RedbIndexFactory::new();

            assert!(factory.path_accessible(&path));
            factory.open(&path).unwrap();
            assert!(dir.path().join(INDEX_FILE_NAME).exists());
            // Second open is served from the cache.
            factory.open(&path).unwrap();

            let missing = dir.path().join("gone").to_string_lossy().into_owned();
            assert!(!factory.path_accessible(&missing));
            assert!(factory.open(&missing).is_err());
        }
    }
}
