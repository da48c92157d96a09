#![doc = include_str!("../README.md")]

mod config;
mod engine;
pub mod image;
mod redirect;
mod registry;
mod status;
pub mod translate;
mod trigger;
pub mod vm;
#[cfg(feature = "watch")]
mod watcher;

pub use config::Config;
pub use engine::{HotSwap, SwapError, SwapSummary};
pub use redirect::{RedirectEntry, RedirectError, RedirectManager};
pub use registry::{
    ContentRoot, ContentSource, DirectoryContent, ModuleFile, ModuleFileRegistry, RegistryError,
    ReloadScope,
};
pub use status::{LogSink, MessageKind, StatusSink};
pub use trigger::FrameEvents;
#[cfg(feature = "watch")]
pub use watcher::Watcher;
