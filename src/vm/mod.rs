//! The live side: loaded modules, their linked functions and the interpreter that
//! calls through each function's entry slot.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    path::Path,
    rc::Rc,
};

use thiserror::Error;

use crate::image::{ImageError, Markers, MethodSig, ModuleImage, TypeSig};

mod body;
mod detour;
mod interp;
mod link;
mod value;

pub use body::{BodyBuilder, CodeBody, Handler, HandlerKind, LiveRef, VerifyError};
pub use detour::{Detour, DetourError, EntrySlot};
pub use interp::VmError;
pub use link::{LinkError, Linker};
pub use value::{Object, Value};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

id_type!(ModuleId);
id_type!(TypeId);
id_type!(FunctionId);
id_type!(FieldId);

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("module {0} is already loaded")]
    DuplicateModule(String),
    #[error("base type of {ty} does not resolve: {source}")]
    BaseType { ty: String, source: LinkError },
    #[error("linking {function} failed: {source}")]
    Link { function: String, source: LinkError },
}

#[derive(Debug)]
pub struct LoadedModule {
    pub id: ModuleId,
    pub name: String,
    pub version: String,
    pub identity: String,
    pub types: Vec<TypeId>,
    by_name: HashMap<String, TypeId>,
}

#[derive(Debug)]
pub struct LiveType {
    pub id: TypeId,
    pub module: ModuleId,
    pub namespace: String,
    pub name: String,
    pub full_name: String,
    pub declaring: Option<TypeId>,
    pub nested: Vec<TypeId>,
    pub base: Option<TypeId>,
    pub generic_arity: u16,
    pub markers: Markers,
    pub functions: Vec<FunctionId>,
    pub fields: Vec<FieldId>,
}

impl LiveType {
    pub fn is_generic_definition(&self) -> bool {
        self.generic_arity != 0
    }
}

#[derive(Debug)]
pub struct LiveFunction {
    pub id: FunctionId,
    pub owner: TypeId,
    pub name: String,
    pub sig: MethodSig,
    pub is_static: bool,
    pub generic_arity: u16,
    pub markers: Markers,
    body: Option<Rc<CodeBody>>,
    entry: Rc<EntrySlot>,
}

impl LiveFunction {
    pub fn original_body(&self) -> Option<&Rc<CodeBody>> {
        self.body.as_ref()
    }

    /// The body calls currently execute: the detour target if one is installed.
    pub fn current_body(&self) -> Option<Rc<CodeBody>> {
        self.entry.target().or_else(|| self.body.clone())
    }

    pub fn is_redirected(&self) -> bool {
        self.entry.target().is_some()
    }

    pub fn is_generic_definition(&self) -> bool {
        self.generic_arity != 0
    }

    pub fn matches(&self, name: &str, params: &[TypeSig], is_static: bool, generic_arity: u16) -> bool {
        self.name == name
            && self.is_static == is_static
            && self.generic_arity == generic_arity
            && self.sig.params == params
    }
}

#[derive(Debug)]
pub struct LiveField {
    pub id: FieldId,
    pub owner: TypeId,
    pub name: String,
    pub ty: TypeSig,
    pub is_static: bool,
}

pub struct Runtime {
    modules: Vec<LoadedModule>,
    types: Vec<LiveType>,
    functions: Vec<LiveFunction>,
    fields: Vec<LiveField>,
    statics: RefCell<HashMap<FieldId, Value>>,
    depth: Cell<usize>,
}

impl Runtime {
    /// Nested interpreted calls allowed before [`VmError::CallDepth`]. Every interpreted
    /// call also nests native frames, so this stays within a default 2 MiB thread stack.
    pub const MAX_CALL_DEPTH: usize = 100;

    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            types: Vec::new(),
            functions: Vec::new(),
            fields: Vec::new(),
            statics: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
        }
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<ModuleId, LoadError> {
        let path = path.as_ref();
        log::debug!("loading module image {path:?}");

        let image = ModuleImage::read(path)?;
        self.load(&image)
    }

    /// Loads and links `image`. On failure the runtime is left as it was.
    pub fn load(&mut self, image: &ModuleImage) -> Result<ModuleId, LoadError> {
        image.validate()?;

        let identity = image.identity();
        if self.modules.iter().any(|m| m.identity == identity) {
            return Err(LoadError::DuplicateModule(identity));
        }

        let marks = (
            self.modules.len(),
            self.types.len(),
            self.functions.len(),
            self.fields.len(),
        );

        let loaded = self.load_unchecked(image, identity);

        if loaded.is_err() {
            let (modules, types, functions, fields) = marks;
            self.modules.truncate(modules);
            self.types.truncate(types);
            self.functions.truncate(functions);
            self.statics
                .get_mut()
                .retain(|field, _| field.index() < fields);
            self.fields.truncate(fields);
        }

        loaded
    }

    fn load_unchecked(&mut self, image: &ModuleImage, identity: String) -> Result<ModuleId, LoadError> {
        let module = ModuleId::from_index(self.modules.len());
        let first_type = self.types.len();

        let mut loaded = LoadedModule {
            id: module,
            name: image.name.clone(),
            version: image.version.clone(),
            identity,
            types: Vec::with_capacity(image.types.len()),
            by_name: HashMap::new(),
        };

        for (index, def) in image.types.iter().enumerate() {
            let id = TypeId::from_index(first_type + index);
            let full_name = image.full_type_name(index);
            let declaring = def
                .declaring_type
                .map(|outer| TypeId::from_index(first_type + outer as usize));

            if let Some(outer) = declaring {
                self.types[outer.index()].nested.push(id);
            }

            loaded.types.push(id);
            loaded.by_name.insert(full_name.clone(), id);

            self.types.push(LiveType {
                id,
                module,
                namespace: def.namespace.clone(),
                name: def.name.clone(),
                full_name,
                declaring,
                nested: Vec::new(),
                base: None,
                generic_arity: def.generic_arity,
                markers: Markers::from_attributes(&def.attributes),
                functions: Vec::new(),
                fields: Vec::new(),
            });
        }

        self.modules.push(loaded);

        for def in &image.fields {
            let id = FieldId::from_index(self.fields.len());
            let owner = TypeId::from_index(first_type + def.owner as usize);

            if def.is_static {
                self.statics.get_mut().insert(id, Value::default_for(&def.ty));
            }

            self.types[owner.index()].fields.push(id);
            self.fields.push(LiveField {
                id,
                owner,
                name: def.name.clone(),
                ty: def.ty.clone(),
                is_static: def.is_static,
            });
        }

        let first_function = self.functions.len();
        for def in &image.methods {
            let id = FunctionId::from_index(self.functions.len());
            let owner = TypeId::from_index(first_type + def.owner as usize);

            self.types[owner.index()].functions.push(id);
            self.functions.push(LiveFunction {
                id,
                owner,
                name: def.name.clone(),
                sig: def.sig.clone(),
                is_static: def.is_static,
                generic_arity: def.generic_arity,
                markers: Markers::from_attributes(&def.attributes),
                body: None,
                entry: Rc::new(EntrySlot::default()),
            });
        }

        let linker = Linker::new(self, image, module);

        let bases = image
            .types
            .iter()
            .enumerate()
            .filter_map(|(index, def)| Some((index, def.base_type?)))
            .map(|(index, token)| {
                linker
                    .resolve_type(token)
                    .map(|base| (first_type + index, base))
                    .map_err(|source| LoadError::BaseType {
                        ty: image.full_type_name(index),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bodies = image
            .methods
            .iter()
            .enumerate()
            .filter_map(|(index, def)| Some((index, def, def.body.as_ref()?)))
            .map(|(index, def, body)| {
                let id = FunctionId::from_index(first_function + index);
                let name = self.describe(id);
                linker
                    .link_body(&name, &def.sig, def.is_static, body)
                    .map(|linked| (id, linked))
                    .map_err(|source| LoadError::Link {
                        function: name,
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (ty, base) in bases {
            self.types[ty].base = Some(base);
        }

        for (id, body) in bodies {
            self.functions[id.index()].body = Some(body);
        }

        log::debug!(
            "loaded module {} with {} types and {} functions",
            image.identity(),
            image.types.len(),
            image.methods.len()
        );

        Ok(module)
    }

    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    pub fn module(&self, id: ModuleId) -> &LoadedModule {
        &self.modules[id.index()]
    }

    pub fn module_by_name(&self, name: &str) -> Option<ModuleId> {
        self.modules.iter().find(|m| m.name == name).map(|m| m.id)
    }

    pub fn ty(&self, id: TypeId) -> &LiveType {
        &self.types[id.index()]
    }

    pub fn function(&self, id: FunctionId) -> &LiveFunction {
        &self.functions[id.index()]
    }

    pub fn field(&self, id: FieldId) -> &LiveField {
        &self.fields[id.index()]
    }

    /// Looks a type up by full name inside one module.
    pub fn module_type(&self, module: ModuleId, full_name: &str) -> Option<TypeId> {
        self.module(module).by_name.get(full_name).copied()
    }

    /// Looks a type up by full name across all modules, in load order.
    pub fn find_type(&self, full_name: &str) -> Option<TypeId> {
        self.modules
            .iter()
            .find_map(|module| module.by_name.get(full_name).copied())
    }

    /// All functions of `ty` matching the signature key, in declaration order.
    pub fn find_functions(
        &self,
        ty: TypeId,
        name: &str,
        params: &[TypeSig],
        is_static: bool,
        generic_arity: u16,
    ) -> Vec<FunctionId> {
        self.ty(ty)
            .functions
            .iter()
            .copied()
            .filter(|&id| self.function(id).matches(name, params, is_static, generic_arity))
            .collect()
    }

    pub fn find_field(&self, ty: TypeId, name: &str) -> Option<FieldId> {
        self.ty(ty)
            .fields
            .iter()
            .copied()
            .find(|&id| self.field(id).name == name)
    }

    /// First function named `name` on the type with the given full name.
    pub fn function_by_name(&self, type_name: &str, name: &str) -> Option<FunctionId> {
        let ty = self.find_type(type_name)?;
        self.ty(ty)
            .functions
            .iter()
            .copied()
            .find(|&id| self.function(id).name == name)
    }

    /// `true` if `ty` is `target` or derives from it.
    pub fn is_assignable(&self, ty: TypeId, target: TypeId) -> bool {
        let mut current = Some(ty);
        while let Some(ty) = current {
            if ty == target {
                return true;
            }
            current = self.ty(ty).base;
        }
        false
    }

    /// Qualified, human readable name of a function.
    pub fn describe(&self, id: FunctionId) -> String {
        let function = self.function(id);
        format!(
            "{}::{}{}",
            self.ty(function.owner).full_name,
            function.name,
            function.sig
        )
    }

    pub fn static_value(&self, field: FieldId) -> Option<Value> {
        self.statics.borrow().get(&field).cloned()
    }

    pub fn set_static_value(&self, field: FieldId, value: Value) {
        self.statics.borrow_mut().insert(field, value);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
