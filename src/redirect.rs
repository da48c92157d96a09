use std::{collections::HashMap, rc::Rc};

use thiserror::Error;

use crate::vm::{CodeBody, Detour, DetourError, FunctionId, Runtime};

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error(transparent)]
    Detour(#[from] DetourError),
}

/// The active redirect of one original function.
#[derive(Debug)]
pub struct RedirectEntry {
    target: Rc<CodeBody>,
    detour: Detour,
}

impl RedirectEntry {
    pub fn target(&self) -> &Rc<CodeBody> {
        &self.target
    }

    pub fn is_active(&self) -> bool {
        self.detour.is_active()
    }
}

/// Owns every redirect installed by the engine, at most one per original function.
///
/// Redirects live as long as the manager; dropping it reverts them all.
#[derive(Debug, Default)]
pub struct RedirectManager {
    entries: HashMap<FunctionId, RedirectEntry>,
}

impl RedirectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects calls of `original` to `translated`, replacing any earlier redirect.
    ///
    /// If the new redirect cannot be installed the previous one stays in place.
    pub fn install(
        &mut self,
        runtime: &Runtime,
        original: FunctionId,
        translated: Rc<CodeBody>,
    ) -> Result<(), RedirectError> {
        runtime.validate_detour(original, &translated)?;

        if let Some(previous) = self.entries.remove(&original) {
            log::trace!("releasing redirect of {original} to {}", previous.target.name);
            drop(previous);
        }

        let detour = runtime.detour(original, Rc::clone(&translated))?;
        self.entries.insert(
            original,
            RedirectEntry {
                target: translated,
                detour,
            },
        );

        Ok(())
    }

    pub fn get(&self, original: FunctionId) -> Option<&RedirectEntry> {
        self.entries.get(&original)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
