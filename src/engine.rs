use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    config::Config,
    image::{ImageError, ModuleImage},
    redirect::RedirectManager,
    registry::{ContentSource, ModuleFile, ModuleFileRegistry, RegistryError},
    status::{LogSink, MessageKind, StatusSink},
    translate::{Outcome, translate},
    vm::{ModuleId, Runtime},
};

#[cfg(feature = "watch")]
use crate::watcher::Watcher;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("{0} is not mapped to a file")]
    NotRegistered(ModuleId),
    #[error("{path:?} holds module {found}, not {expected}")]
    ModuleMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[cfg(feature = "watch")]
    #[error(transparent)]
    Watch(#[from] notify::Error),
}

/// Result of one pass over one module file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapSummary {
    pub module: ModuleId,
    pub file: PathBuf,
    pub reloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// The file's bytes were identical to the last processed version, so nothing was parsed.
    pub unchanged_file: bool,
}

/// Engine state: the file registry, active redirects and trigger bookkeeping.
///
/// Everything here is meant to be used from the thread that drives the runtime.
pub struct HotSwap {
    pub(crate) config: Config,
    pub(crate) registry: ModuleFileRegistry,
    pub(crate) redirects: RedirectManager,
    pub(crate) start_time: SystemTime,
    pub(crate) deferred: Option<u32>,
    pub(crate) status: Box<dyn StatusSink>,
    stub_counter: u64,
    #[cfg(feature = "watch")]
    watcher: Option<Watcher>,
}

impl HotSwap {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: ModuleFileRegistry::new(),
            redirects: RedirectManager::new(),
            start_time: SystemTime::now(),
            deferred: None,
            status: Box::new(LogSink),
            stub_counter: 0,
            #[cfg(feature = "watch")]
            watcher: None,
        }
    }

    pub fn with_status_sink(mut self, sink: impl StatusSink + 'static) -> Self {
        self.status = Box::new(sink);
        self
    }

    /// Files last modified at or before `start_time` are left alone by full sweeps.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ModuleFileRegistry {
        &self.registry
    }

    pub fn redirects(&self) -> &RedirectManager {
        &self.redirects
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Maps loaded modules to their files. Returns the number of mapped modules.
    pub fn discover(&mut self, runtime: &Runtime, source: &dyn ContentSource) -> usize {
        self.registry.discover(runtime, source, &self.config)
    }

    pub fn register(&mut self, runtime: &Runtime, module: ModuleId, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let file = ModuleFile::open(path)?;
        self.registry.register(runtime, module, file)
    }

    /// Swaps every changed function of `module` for its version in the module's file.
    ///
    /// Individual functions that cannot be translated or redirected keep their current
    /// body; only a file that cannot be read or parsed fails the pass.
    pub fn hot_swap(&mut self, runtime: &Runtime, module: ModuleId) -> Result<SwapSummary, SwapError> {
        let file = self
            .registry
            .lookup(module)
            .ok_or(SwapError::NotRegistered(module))?
            .clone();
        let scope = self.registry.scope_of(&file);
        let live = runtime.module(module);

        let mut summary = SwapSummary {
            module,
            file: file.path().to_path_buf(),
            reloaded: 0,
            skipped: 0,
            failed: 0,
            unchanged_file: false,
        };

        let bytes = fs::read(file.path())?;
        let hash = xxh3_64(&bytes);

        if self.registry.content_hash(module) == Some(hash) {
            log::debug!("{:?} is unchanged, skipping", file.path());
            summary.unchanged_file = true;
            return Ok(summary);
        }

        log::debug!("hot-swapping {} from {:?} ({scope:?})", live.identity, file.path());

        let image = ModuleImage::parse(&bytes)?;

        if image.name != live.name {
            return Err(SwapError::ModuleMismatch {
                path: summary.file,
                expected: live.name.clone(),
                found: image.name,
            });
        }

        let report = translate(runtime, module, &image, scope, &mut self.stub_counter);

        for outcome in report.outcomes {
            match outcome {
                Outcome::Swapped(pair) => {
                    let name = runtime.describe(pair.original);
                    match self.redirects.install(runtime, pair.original, pair.translated) {
                        Ok(()) => {
                            summary.reloaded += 1;
                            if self.config.log_reloaded {
                                log::info!("reloaded {name}");
                            } else {
                                log::debug!("reloaded {name}");
                            }
                        }
                        Err(e) => {
                            summary.failed += 1;
                            log::error!("patching {name} failed: {e}");
                        }
                    }
                }
                Outcome::Skipped { function, reason } => {
                    summary.skipped += 1;
                    if self.config.log_reloaded {
                        log::info!("skipped {function}: {reason}");
                    } else {
                        log::debug!("skipped {function}: {reason}");
                    }
                }
                Outcome::Failed { function, error } => {
                    summary.failed += 1;
                    log::error!("patching {function} failed: {error}");
                }
            }
        }

        self.registry.set_content_hash(module, hash);

        let file_name = file
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = format!(
            "Reloaded {} functions in {} (from {file_name})",
            summary.reloaded, live.name
        );

        log::info!("{text}");
        if summary.reloaded > 0 {
            self.status.message(MessageKind::Event, &text);
        }

        Ok(summary)
    }

    /// Starts watching the directories of all registered files.
    #[cfg(feature = "watch")]
    pub fn watch(&mut self) -> Result<(), SwapError> {
        let watcher = Watcher::new(self.registry.watch_dirs(), &self.config.extension)
            .inspect_err(|e| log::error!("error initializing file watcher: {e}"))?;

        self.watcher = Some(watcher);
        Ok(())
    }

    #[cfg(feature = "watch")]
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    #[cfg(feature = "watch")]
    pub(crate) fn drain_changes(&mut self) -> Vec<PathBuf> {
        self.watcher
            .as_ref()
            .map(Watcher::drain)
            .unwrap_or_default()
    }

    #[cfg(not(feature = "watch"))]
    pub(crate) fn drain_changes(&mut self) -> Vec<PathBuf> {
        Vec::new()
    }
}
