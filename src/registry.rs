//! Which file each loaded module came from, and how much of it a swap may touch.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use thiserror::Error;
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    config::Config,
    image::{ImageError, Markers, ModuleImage},
    vm::{ModuleId, Runtime},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadScope {
    /// Every non-excluded function of every type is a candidate.
    AllEligibleFunctions,
    /// Only types or functions carrying an include marker are candidates.
    #[default]
    MarkedOnly,
}

impl ReloadScope {
    /// A single include-all marker anywhere in the module widens the scope of the whole module.
    pub fn of_module(runtime: &Runtime, module: ModuleId) -> Self {
        let include_all = runtime
            .module(module)
            .types
            .iter()
            .any(|&ty| runtime.ty(ty).markers.contains(Markers::INCLUDE_ALL));

        if include_all {
            Self::AllEligibleFunctions
        } else {
            Self::MarkedOnly
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleFile {
    path: PathBuf,
    directory: PathBuf,
    modified: SystemTime,
}

impl ModuleFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = fs::canonicalize(path)?;
        let modified = fs::metadata(&path)?.modified()?;
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(io::ErrorKind::NotFound)?;

        Ok(Self {
            path,
            directory,
            modified,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Modification time as of the last [`refresh`](Self::refresh).
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn refresh(&mut self) -> io::Result<SystemTime> {
        self.modified = fs::metadata(&self.path)?.modified()?;
        Ok(self.modified)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("{path:?} holds {found:?}, but the loaded module is {expected:?}")]
    IdentityMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// A directory of content, together with the modules loaded from it.
#[derive(Debug, Clone)]
pub struct ContentRoot {
    pub dir: PathBuf,
    pub modules: Vec<ModuleId>,
}

/// Supplies content roots and the module files inside them.
pub trait ContentSource {
    fn roots(&self) -> Vec<ContentRoot>;

    /// Module files of `root`, in discovery order.
    fn module_files(&self, root: &ContentRoot, config: &Config) -> io::Result<Vec<PathBuf>>;
}

/// Content rooted in plain directories; module files live under `<root>/<module_subdir>`.
#[derive(Debug, Clone, Default)]
pub struct DirectoryContent {
    roots: Vec<ContentRoot>,
}

impl DirectoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, dir: impl Into<PathBuf>, modules: impl IntoIterator<Item = ModuleId>) -> &mut Self {
        self.roots.push(ContentRoot {
            dir: dir.into(),
            modules: modules.into_iter().collect(),
        });
        self
    }
}

impl ContentSource for DirectoryContent {
    fn roots(&self) -> Vec<ContentRoot> {
        self.roots.clone()
    }

    fn module_files(&self, root: &ContentRoot, config: &Config) -> io::Result<Vec<PathBuf>> {
        let dir = root.dir.join(&config.module_subdir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_file() && config.matches_extension(entry.path()) {
                files.push(entry.into_path());
            }
        }

        Ok(files)
    }
}

#[derive(Debug)]
struct Entry {
    module: ModuleId,
    file: ModuleFile,
    scope: ReloadScope,
    content_hash: Option<u64>,
}

/// Maps loaded modules to their backing files. Each module maps to at most one file.
#[derive(Debug, Default)]
pub struct ModuleFileRegistry {
    entries: Vec<Entry>,
    by_module: HashMap<ModuleId, usize>,
    by_path: HashMap<PathBuf, usize>,
    watch_dirs: Vec<PathBuf>,
}

impl ModuleFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `module` to `file` after checking that the file holds exactly that module.
    /// Registering an already mapped module does nothing.
    pub fn register(&mut self, runtime: &Runtime, module: ModuleId, file: ModuleFile) -> Result<(), RegistryError> {
        if self.by_module.contains_key(&module) {
            log::trace!("{} is already mapped", runtime.module(module).identity);
            return Ok(());
        }

        let expected = &runtime.module(module).identity;
        let found = ModuleImage::read_identity(file.path())?;
        if found != *expected {
            return Err(RegistryError::IdentityMismatch {
                path: file.path().to_path_buf(),
                expected: expected.clone(),
                found,
            });
        }

        let content_hash = xxh3_64(&fs::read(file.path())?);
        let scope = ReloadScope::of_module(runtime, module);

        log::debug!("mapped {expected} to {:?} ({scope:?})", file.path());

        if !self.watch_dirs.iter().any(|dir| dir == file.directory()) {
            self.watch_dirs.push(file.directory().to_path_buf());
        }

        let index = self.entries.len();
        self.by_module.insert(module, index);
        self.by_path.insert(file.path().to_path_buf(), index);
        self.entries.push(Entry {
            module,
            file,
            scope,
            content_hash: Some(content_hash),
        });

        Ok(())
    }

    /// Registers every module file found under the roots of `source`.
    ///
    /// Only roots directly inside a directory named [`Config::content_dir_name`] are
    /// considered. Files that cannot be read or whose identity matches none of the root's
    /// modules are skipped. Returns the number of mapped modules.
    pub fn discover(&mut self, runtime: &Runtime, source: &dyn ContentSource, config: &Config) -> usize {
        for root in source.roots() {
            if root.dir.parent().and_then(Path::file_name) != Some(OsStr::new(&config.content_dir_name)) {
                log::debug!("ignoring content outside of {}: {:?}", config.content_dir_name, root.dir);
                continue;
            }

            let files = match source.module_files(&root, config) {
                Ok(files) => files,
                Err(e) => {
                    log::debug!("error listing module files of {:?}: {e}", root.dir);
                    continue;
                }
            };

            for path in files {
                let identity = match ModuleImage::read_identity(&path) {
                    Ok(identity) => identity,
                    Err(e) => {
                        log::debug!("skipping {path:?}: {e}");
                        continue;
                    }
                };

                let Some(&module) = root
                    .modules
                    .iter()
                    .find(|&&module| runtime.module(module).identity == identity)
                else {
                    log::debug!("skipping {path:?}: {identity} is not loaded from this root");
                    continue;
                };

                let registered = ModuleFile::open(&path)
                    .map_err(RegistryError::from)
                    .and_then(|file| self.register(runtime, module, file));

                if let Err(e) = registered {
                    log::debug!("skipping {path:?}: {e}");
                }
            }
        }

        log::info!("mapped {} modules to their files", self.len());
        self.len()
    }

    pub fn lookup(&self, module: ModuleId) -> Option<&ModuleFile> {
        self.by_module.get(&module).map(|&index| &self.entries[index].file)
    }

    /// Scope of a registered file; unregistered files only get marked functions swapped.
    pub fn scope_of(&self, file: &ModuleFile) -> ReloadScope {
        self.by_path
            .get(file.path())
            .map(|&index| self.entries[index].scope)
            .unwrap_or_default()
    }

    /// The module backed by `path`, if any.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> Option<ModuleId> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        self.by_path
            .get(&canonical)
            .map(|&index| self.entries[index].module)
    }

    /// Registered modules and their files, in registration order.
    pub fn files(&self) -> impl Iterator<Item = (ModuleId, &ModuleFile)> {
        self.entries.iter().map(|entry| (entry.module, &entry.file))
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        self.entries.iter().map(|entry| entry.module).collect()
    }

    /// Distinct directories containing registered files.
    pub fn watch_dirs(&self) -> &[PathBuf] {
        &self.watch_dirs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn file_mut(&mut self, module: ModuleId) -> Option<&mut ModuleFile> {
        let index = *self.by_module.get(&module)?;
        Some(&mut self.entries[index].file)
    }

    /// Hash of the file contents last processed for `module`.
    pub fn content_hash(&self, module: ModuleId) -> Option<u64> {
        let index = *self.by_module.get(&module)?;
        self.entries[index].content_hash
    }

    pub(crate) fn set_content_hash(&mut self, module: ModuleId, hash: u64) {
        if let Some(&index) = self.by_module.get(&module) {
            self.entries[index].content_hash = Some(hash);
        }
    }
}
