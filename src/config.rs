use std::{env, path::Path};

use serde::{Deserialize, Serialize};

/// Engine settings. Hosts can embed this in their own settings; missing keys take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Swap files as soon as the watcher reports them.
    pub auto_reload: bool,
    /// Log every considered function at info level instead of debug.
    pub log_reloaded: bool,
    /// Repaints to wait between a manual trigger and the sweep.
    pub deferred_frames: u32,
    /// Name of the directory content roots must live in.
    pub content_dir_name: String,
    /// Directory below a content root holding module files.
    pub module_subdir: String,
    /// Module file extension, without the dot.
    pub extension: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_reload: true,
            log_reloaded: false,
            deferred_frames: 2,
            content_dir_name: "Mods".into(),
            module_subdir: "Assemblies".into(),
            extension: "hsm".into(),
        }
    }
}

impl Config {
    pub const AUTO_RELOAD_VAR: &str = "HOTSWAP_AUTO_RELOAD";
    pub const LOG_RELOADED_VAR: &str = "HOTSWAP_LOG_RELOADED";

    /// Defaults, with the switches overridden from the environment.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(mut self) -> Self {
        if let Some(value) = env_flag(Self::AUTO_RELOAD_VAR) {
            self.auto_reload = value;
        }
        if let Some(value) = env_flag(Self::LOG_RELOADED_VAR) {
            self.log_reloaded = value;
        }
        self
    }

    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;

    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("ignoring {name}={value:?}, expected a boolean");
            None
        }
    }
}
