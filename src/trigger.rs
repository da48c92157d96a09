use std::path::Path;

use crate::{
    engine::{HotSwap, SwapSummary},
    status::MessageKind,
    vm::Runtime,
};

/// What happened in the host since the last call to [`HotSwap::on_frame`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameEvents {
    pub repaint: bool,
    pub hotkey_pressed: bool,
    pub button_clicked: bool,
}

impl FrameEvents {
    pub const REPAINT: Self = Self {
        repaint: true,
        hotkey_pressed: false,
        button_clicked: false,
    };
}

impl HotSwap {
    /// Swaps the module backed by `path`, if there is one and auto reload is on.
    pub fn trigger_file(&mut self, runtime: &Runtime, path: impl AsRef<Path>) -> Option<SwapSummary> {
        let path = path.as_ref();

        if !self.config.auto_reload {
            log::trace!("auto reload is off, ignoring {path:?}");
            return None;
        }

        let module = self.registry.resolve_path(path)?;
        if !self.registry.lookup(module)?.exists() {
            log::debug!("{path:?} no longer exists");
            return None;
        }

        self.hot_swap(runtime, module)
            .inspect_err(|e| log::error!("error hot-swapping {path:?}: {e}"))
            .ok()
    }

    /// Swaps every registered file modified after the engine started.
    pub fn trigger_all(&mut self, runtime: &Runtime) -> Vec<SwapSummary> {
        log::info!("hot-swapping...");

        let mut summaries = Vec::new();

        for module in self.registry.modules() {
            let Some(file) = self.registry.file_mut(module) else {
                continue;
            };

            let modified = match file.refresh() {
                Ok(modified) => modified,
                Err(e) => {
                    log::debug!("skipping {:?}: {e}", file.path());
                    continue;
                }
            };

            if modified <= self.start_time {
                log::trace!("{:?} was not modified since startup", file.path());
                continue;
            }

            match self.hot_swap(runtime, module) {
                Ok(summary) => summaries.push(summary),
                Err(e) => log::error!("error hot-swapping {module}: {e}"),
            }
        }

        log::info!("hot-swapping done");
        summaries
    }

    /// Runs [`trigger_all`](Self::trigger_all) after the configured number of repaints,
    /// giving a compiler that is still writing the file time to finish.
    pub fn schedule_deferred(&mut self) {
        self.deferred = Some(self.config.deferred_frames.max(1));
        self.status.message(MessageKind::Silent, "Hotswapping...");
    }

    pub fn is_deferred_pending(&self) -> bool {
        self.deferred.is_some()
    }

    /// Per-frame hook for the host's update loop.
    pub fn on_frame(&mut self, runtime: &Runtime, events: FrameEvents) -> Vec<SwapSummary> {
        let mut summaries = Vec::new();

        for path in self.drain_changes() {
            summaries.extend(self.trigger_file(runtime, &path));
        }

        if events.repaint
            && let Some(frames) = self.deferred
        {
            if frames <= 1 {
                self.deferred = None;
                summaries.extend(self.trigger_all(runtime));
            } else {
                self.deferred = Some(frames - 1);
            }
        }

        if events.hotkey_pressed || events.button_clicked {
            self.schedule_deferred();
        }

        summaries
    }
}
