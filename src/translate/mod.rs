//! Finding the function bodies of an image that differ from the live ones, and linking
//! replacements for them.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    rc::Rc,
};

use thiserror::Error;

use crate::{
    image::{DecodeError, Markers, MethodDef, ModuleImage, TypeSig},
    registry::ReloadScope,
    vm::{CodeBody, FunctionId, LinkError, Linker, ModuleId, Runtime, TypeId},
};

mod encode;

pub use encode::{encode_image_body, encode_live_body};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("{count} definitions in the image match")]
    Ambiguous { count: usize },
    #[error("return type changed from {live} to {image}")]
    ReturnTypeChanged { live: TypeSig, image: TypeSig },
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The function, its type or an enclosing type is marked as excluded.
    Excluded,
    /// Only marked functions of the type are swapped, and this one is not marked.
    NotMarked,
    GenericFunction,
    GenericType,
    /// Abstract or extern, live or in the image.
    NoBody,
    /// No definition in the image has the function's signature.
    NoMatch,
    Unchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Excluded => "excluded",
            Self::NotMarked => "not marked",
            Self::GenericFunction => "generic function",
            Self::GenericType => "generic type",
            Self::NoBody => "no body",
            Self::NoMatch => "no matching definition",
            Self::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SwapPair {
    pub original: FunctionId,
    pub translated: Rc<CodeBody>,
}

#[derive(Debug)]
pub enum Outcome {
    Swapped(SwapPair),
    Skipped { function: String, reason: SkipReason },
    Failed { function: String, error: TranslateError },
}

#[derive(Debug, Default)]
pub struct TranslationReport {
    pub outcomes: Vec<Outcome>,
}

impl TranslationReport {
    pub fn swapped(&self) -> impl Iterator<Item = &SwapPair> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            Outcome::Swapped(pair) => Some(pair),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&str, SkipReason)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            Outcome::Skipped { function, reason } => Some((function.as_str(), *reason)),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TranslateError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            Outcome::Failed { function, error } => Some((function.as_str(), error)),
            _ => None,
        })
    }
}

/// Which functions of a type are candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eligibility {
    AllFunctions,
    MarkedFunctions,
}

/// Compares every eligible function of `module` against its definition in `image` and
/// links a replacement for each one whose body changed.
///
/// `stub_counter` numbers replacement bodies across passes.
pub fn translate(
    runtime: &Runtime,
    module: ModuleId,
    image: &ModuleImage,
    scope: ReloadScope,
    stub_counter: &mut u64,
) -> TranslationReport {
    let mut translator = Translator {
        runtime,
        image,
        linker: Linker::new(runtime, image, module),
        module,
        stub_counter,
        visited: HashSet::new(),
        report: TranslationReport::default(),
    };

    for index in 0..image.types.len() {
        translator.visit_type(index, scope);
    }

    translator.report
}

struct Translator<'a> {
    runtime: &'a Runtime,
    image: &'a ModuleImage,
    linker: Linker<'a>,
    module: ModuleId,
    stub_counter: &'a mut u64,
    visited: HashSet<TypeId>,
    report: TranslationReport,
}

impl<'a> Translator<'a> {
    fn visit_type(&mut self, index: usize, scope: ReloadScope) {
        let full_name = self.image.full_type_name(index);

        if self.is_excluded_type(index) {
            log::trace!("skipping excluded type {full_name}");
            return;
        }

        let Some(live) = self.runtime.module_type(self.module, &full_name) else {
            log::debug!("skipping {full_name}, it is not loaded");
            return;
        };

        if self.visited.contains(&live) {
            return;
        }

        let ty = &self.image.types[index];
        let eligibility = match scope {
            ReloadScope::AllEligibleFunctions => Eligibility::AllFunctions,
            ReloadScope::MarkedOnly if ty.markers.contains(Markers::INCLUDE) => Eligibility::AllFunctions,
            ReloadScope::MarkedOnly
                if self
                    .image
                    .methods_of(index)
                    .any(|(_, method)| method.markers.contains(Markers::INCLUDE)) =>
            {
                Eligibility::MarkedFunctions
            }
            ReloadScope::MarkedOnly => return,
        };

        let mut pending = VecDeque::from([(index, live, eligibility)]);

        while let Some((index, live, eligibility)) = pending.pop_front() {
            if !self.visited.insert(live) {
                continue;
            }

            if eligibility == Eligibility::AllFunctions {
                pending.extend(self.generated_nested_types(live));
            }

            self.visit_functions(index, live, eligibility);
        }
    }

    /// Compiler-generated types nested in `live` that also exist in the image.
    fn generated_nested_types(&self, live: TypeId) -> Vec<(usize, TypeId, Eligibility)> {
        self.runtime
            .ty(live)
            .nested
            .iter()
            .map(|&nested| self.runtime.ty(nested))
            .filter(|nested| nested.markers.contains(Markers::COMPILER_GENERATED))
            .filter_map(|nested| {
                let index = self.image.find_type(&nested.full_name)?;
                (!self.is_excluded_type(index)).then_some((index, nested.id, Eligibility::AllFunctions))
            })
            .collect()
    }

    fn visit_functions(&mut self, index: usize, live: TypeId, eligibility: Eligibility) {
        let runtime = self.runtime;
        let ty = runtime.ty(live);

        if ty.is_generic_definition() {
            for &function in &ty.functions {
                self.skip(function, SkipReason::GenericType);
            }
            return;
        }

        for &function in &ty.functions {
            let outcome = match self.candidate(index, function, eligibility) {
                Ok(Some(pair)) => Outcome::Swapped(pair),
                Ok(None) => continue,
                Err(error) => Outcome::Failed {
                    function: runtime.describe(function),
                    error,
                },
            };
            self.report.outcomes.push(outcome);
        }
    }

    /// Translates one live function. `Ok(None)` means a skip was recorded.
    fn candidate(
        &mut self,
        index: usize,
        function: FunctionId,
        eligibility: Eligibility,
    ) -> Result<Option<SwapPair>, TranslateError> {
        let runtime = self.runtime;
        let live = runtime.function(function);

        if live.is_generic_definition() {
            return self.skipped(function, SkipReason::GenericFunction);
        }
        let Some(current) = live.current_body() else {
            return self.skipped(function, SkipReason::NoBody);
        };
        if live.markers.contains(Markers::EXCLUDE) {
            return self.skipped(function, SkipReason::Excluded);
        }

        let def = match self.find_definition(index, function)? {
            Some(def) => def,
            None => return self.skipped(function, SkipReason::NoMatch),
        };

        if def.markers.contains(Markers::EXCLUDE) {
            return self.skipped(function, SkipReason::Excluded);
        }
        if eligibility == Eligibility::MarkedFunctions && !def.markers.contains(Markers::INCLUDE) {
            return self.skipped(function, SkipReason::NotMarked);
        }
        let Some(body) = &def.body else {
            return self.skipped(function, SkipReason::NoBody);
        };

        if def.sig.ret != live.sig.ret {
            return Err(TranslateError::ReturnTypeChanged {
                live: live.sig.ret.clone(),
                image: def.sig.ret.clone(),
            });
        }

        let image_code = encode_image_body(&self.linker, body)?;
        let live_code = encode_live_body(&current)?;
        if image_code == live_code {
            return self.skipped(function, SkipReason::Unchanged);
        }

        *self.stub_counter += 1;
        let name = format!("{}$hotswap{}", runtime.describe(function), self.stub_counter);

        let translated = self.linker.link_body(&name, &live.sig, live.is_static, body)?;
        log::trace!("linked {name}");

        Ok(Some(SwapPair {
            original: function,
            translated,
        }))
    }

    /// The definition in the image's type `index` matching the live function's name,
    /// parameters, static kind and generic arity.
    fn find_definition(&self, index: usize, function: FunctionId) -> Result<Option<&'a MethodDef>, TranslateError> {
        let image = self.image;
        let live = self.runtime.function(function);

        let mut matches = image
            .methods_of(index)
            .map(|(_, def)| def)
            .filter(|def| live.matches(&def.name, &def.sig.params, def.is_static, def.generic_arity));

        let first = matches.next();
        let extra = matches.count();

        if extra != 0 {
            return Err(TranslateError::Ambiguous { count: extra + 1 });
        }

        Ok(first)
    }

    /// `true` if the type at `index` or any type enclosing it is marked as excluded.
    fn is_excluded_type(&self, index: usize) -> bool {
        std::iter::once(&self.image.types[index])
            .chain(self.image.declaring_chain(index))
            .any(|ty| ty.markers.contains(Markers::EXCLUDE))
    }

    fn skipped(&mut self, function: FunctionId, reason: SkipReason) -> Result<Option<SwapPair>, TranslateError> {
        self.skip(function, reason);
        Ok(None)
    }

    fn skip(&mut self, function: FunctionId, reason: SkipReason) {
        self.report.outcomes.push(Outcome::Skipped {
            function: self.runtime.describe(function),
            reason,
        });
    }
}
