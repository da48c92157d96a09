use std::{cell::RefCell, rc::Rc};

use thiserror::Error;

use super::{CodeBody, FunctionId, Runtime};

/// The cell every call to a function dispatches through.
///
/// Empty means the function runs its original body.
#[derive(Debug, Default)]
pub struct EntrySlot {
    target: RefCell<Option<Rc<CodeBody>>>,
}

impl EntrySlot {
    pub fn target(&self) -> Option<Rc<CodeBody>> {
        self.target.borrow().clone()
    }

    fn replace(&self, target: Option<Rc<CodeBody>>) -> Option<Rc<CodeBody>> {
        self.target.replace(target)
    }
}

#[derive(Debug, Error)]
pub enum DetourError {
    #[error("{0} has no body to redirect")]
    NoBody(String),
    #[error("{replacement} does not have the signature of {original}")]
    SignatureMismatch { original: String, replacement: String },
}

/// An installed redirection of one function's entry slot.
///
/// Dropping the handle puts back whatever the slot pointed at before, unless the slot
/// has since been pointed somewhere else.
#[must_use = "dropping a Detour reverts it immediately"]
#[derive(Debug)]
pub struct Detour {
    function: FunctionId,
    slot: Rc<EntrySlot>,
    installed: Rc<CodeBody>,
    previous: Option<Rc<CodeBody>>,
}

impl Detour {
    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn target(&self) -> &Rc<CodeBody> {
        &self.installed
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .target()
            .is_some_and(|current| Rc::ptr_eq(&current, &self.installed))
    }
}

impl Drop for Detour {
    fn drop(&mut self) {
        if !self.is_active() {
            return;
        }

        let _ = self.slot.replace(self.previous.take());
        log::debug!("released detour of {} to {}", self.function, self.installed.name);
    }
}

impl Runtime {
    /// Checks that `replacement` can stand in for `original` without touching anything.
    pub fn validate_detour(&self, original: FunctionId, replacement: &CodeBody) -> Result<(), DetourError> {
        let function = self.function(original);

        if function.original_body().is_none() {
            return Err(DetourError::NoBody(self.describe(original)));
        }

        if replacement.sig != function.sig || replacement.is_static != function.is_static {
            return Err(DetourError::SignatureMismatch {
                original: self.describe(original),
                replacement: replacement.name.clone(),
            });
        }

        Ok(())
    }

    /// Points the entry slot of `original` at `replacement`.
    pub fn detour(&self, original: FunctionId, replacement: Rc<CodeBody>) -> Result<Detour, DetourError> {
        self.validate_detour(original, &replacement)?;

        let slot = Rc::clone(&self.function(original).entry);
        let previous = slot.replace(Some(Rc::clone(&replacement)));

        log::trace!("detoured {} to {}", self.describe(original), replacement.name);

        Ok(Detour {
            function: original,
            slot,
            installed: replacement,
            previous,
        })
    }
}
