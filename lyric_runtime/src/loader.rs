use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use ahash::RandomState;
use parking_lot::RwLock;

use crate::{InterpreterCondition, InterpreterStatus, NativePlugin, ObjectFile, Result};

/// Where assemblies and plugins come from.
///
/// `Ok(None)` means the loader does not know the location; the segment
/// manager turns that into a `MissingAssembly` condition.
pub trait AbstractLoader: Send + Sync {
    fn load_assembly(&self, location: &str) -> Result<Option<Vec<u8>>>;

    fn load_plugin(&self, location: &str) -> Result<Option<Arc<dyn NativePlugin>>>;
}

type PluginMap = HashMap<String, Arc<dyn NativePlugin>, RandomState>;

/// Serves assemblies and plugins registered in memory.
#[derive(Default)]
pub struct MemoryLoader {
    assemblies: RwLock<HashMap<String, Arc<[u8]>, RandomState>>,
    plugins: RwLock<PluginMap>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_assembly(&self, location: &str, bytes: Vec<u8>) {
        self.assemblies
            .write()
            .insert(location.to_owned(), Arc::from(bytes));
    }

    pub fn insert_object(&self, location: &str, object: &ObjectFile) {
        self.insert_assembly(location, object.to_bytes());
    }

    pub fn insert_plugin(&self, plugin: Arc<dyn NativePlugin>) {
        self.plugins
            .write()
            .insert(plugin.location().to_owned(), plugin);
    }
}

impl AbstractLoader for MemoryLoader {
    fn load_assembly(&self, location: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.assemblies.read().get(location).map(|b| b.to_vec()))
    }

    fn load_plugin(&self, location: &str) -> Result<Option<Arc<dyn NativePlugin>>> {
        Ok(self.plugins.read().get(location).cloned())
    }
}

/// Reads `<root>/<location>.lyo` from disk. Plugins cannot be loaded from
/// disk and have to be registered up front.
pub struct DirectoryLoader {
    root: PathBuf,
    plugins: PluginMap,
}

impl DirectoryLoader {
    pub const EXTENSION: &'static str = "lyo";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            plugins: PluginMap::default(),
        }
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn NativePlugin>) -> Self {
        self.plugins.insert(plugin.location().to_owned(), plugin);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, location: &str) -> PathBuf {
        let relative = location.trim_start_matches('/');
        self.root.join(relative).with_extension(Self::EXTENSION)
    }
}

impl AbstractLoader for DirectoryLoader {
    fn load_assembly(&self, location: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(location);
        match fs::read(&path) {
            Ok(bytes) => {
                log::debug!("read {} bytes from {}", bytes.len(), path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(InterpreterStatus::for_condition(
                InterpreterCondition::MissingAssembly,
                format!("failed to read {}: {e}", path.display()),
            )),
        }
    }

    fn load_plugin(&self, location: &str) -> Result<Option<Arc<dyn NativePlugin>>> {
        Ok(self.plugins.get(location).cloned())
    }
}

/// Tries each loader in order and returns the first hit.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Arc<dyn AbstractLoader>>,
}

impl ChainLoader {
    pub fn new(loaders: Vec<Arc<dyn AbstractLoader>>) -> Self {
        Self { loaders }
    }

    pub fn push(&mut self, loader: Arc<dyn AbstractLoader>) {
        self.loaders.push(loader);
    }
}

impl AbstractLoader for ChainLoader {
    fn load_assembly(&self, location: &str) -> Result<Option<Vec<u8>>> {
        for loader in &self.loaders {
            if let Some(bytes) = loader.load_assembly(location)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    fn load_plugin(&self, location: &str) -> Result<Option<Arc<dyn NativePlugin>>> {
        for loader in &self.loaders {
            if let Some(plugin) = loader.load_plugin(location)? {
                return Ok(Some(plugin));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrapTable;

    #[test]
    fn memory_loader_serves_registered_assemblies() {
        let loader = MemoryLoader::new();
        loader.insert_assembly("/main", vec![1, 2, 3]);
        assert_eq!(loader.load_assembly("/main").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(loader.load_assembly("/other").unwrap(), None);
    }

    #[test]
    fn directory_loader_maps_locations_to_files() {
        let root = std::env::temp_dir().join(format!("lyric-loader-{}", std::process::id()));
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::write(root.join("pkg/main.lyo"), b"LYRO").unwrap();

        let loader = DirectoryLoader::new(&root);
        assert_eq!(
            loader.load_assembly("/pkg/main").unwrap(),
            Some(b"LYRO".to_vec())
        );
        assert_eq!(loader.load_assembly("/pkg/missing").unwrap(), None);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn chain_loader_falls_through() {
        let first = Arc::new(MemoryLoader::new());
        let second = Arc::new(MemoryLoader::new());
        second.insert_assembly("/lib", vec![9]);
        second.insert_plugin(Arc::new(TrapTable::new("core", &[])));

        let chain = ChainLoader::new(vec![
            first as Arc<dyn AbstractLoader>,
            second as Arc<dyn AbstractLoader>,
        ]);
        assert_eq!(chain.load_assembly("/lib").unwrap(), Some(vec![9]));
        assert!(chain.load_plugin("core").unwrap().is_some());
        assert!(chain.load_plugin("other").unwrap().is_none());
    }
}
