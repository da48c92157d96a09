#![allow(dead_code)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use hotswap::{
    Config, HotSwap,
    image::{Asm, ImageBuilder, MethodBody, MethodSig, ModuleImage, OpCode, RegionKind, TypeSig},
    vm::{FunctionId, ModuleId, Runtime, Value},
};
use tempfile::TempDir;

pub const MODULE: &str = "Game";
pub const VERSION: &str = "1.0.0";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One build of the `Game` test module. Most function results are a multiple of
/// `version`, so each build is observable from outside.
#[derive(Debug, Clone, Copy)]
pub struct Build {
    pub version: i32,
    /// Marks `Game.Counter` with `HotSwapAll`.
    pub include_all: bool,
    /// `Game.Counter::Value` calls a function no loaded module defines.
    pub broken: bool,
}

impl Build {
    pub fn v(version: i32) -> Self {
        Self {
            version,
            include_all: true,
            broken: false,
        }
    }

    pub fn marked_only(self) -> Self {
        Self {
            include_all: false,
            ..self
        }
    }

    pub fn broken(self) -> Self {
        Self {
            broken: true,
            ..self
        }
    }

    pub fn image(&self) -> ModuleImage {
        let v = self.version;
        let i32_sig = MethodSig::nullary(TypeSig::I32);
        let void_sig = MethodSig::nullary(TypeSig::Void);

        let mut b = ImageBuilder::new(MODULE, VERSION);

        let error = b.define_type(MODULE, "Error");
        let error_ctor = b.define_method(error, ".ctor", void_sig.clone(), false);
        b.set_body(error_ctor, ret_void());

        let boom = b.define_type(MODULE, "Boom");
        b.set_base_type(boom, error);
        let boom_ctor = b.define_method(boom, ".ctor", void_sig.clone(), false);
        b.set_body(boom_ctor, ret_void());

        let counter = b.define_type(MODULE, "Counter");
        if self.include_all {
            b.add_attribute(counter, "HotSwapAll");
        }
        let calls = b.define_field(counter, "calls", TypeSig::I32, true);

        let value = b.define_method(counter, "Value", i32_sig.clone(), true);
        let value_body = if self.broken {
            let missing = b.type_ref(None, "Game.Missing");
            let gone = b.method_ref(missing, "Gone", i32_sig.clone(), true);
            body(1, |a| {
                a.call(gone).ret();
            })
        } else {
            ret_i32(v)
        };
        b.set_body(value, value_body);

        let twice = b.define_method(counter, "Twice", i32_sig.clone(), true);
        b.set_body(
            twice,
            body(2, |a| {
                a.call(value).ldc_i4(2).op(OpCode::Mul).ret();
            }),
        );

        let bump = b.define_method(counter, "Bump", i32_sig.clone(), true);
        b.set_body(
            bump,
            body(2, |a| {
                a.token(OpCode::LdSFld, calls)
                    .ldc_i4(v)
                    .op(OpCode::Add)
                    .op(OpCode::Dup)
                    .token(OpCode::StSFld, calls)
                    .ret();
            }),
        );

        let greeting = b.define_method(counter, "Greeting", MethodSig::nullary(TypeSig::String), true);
        let text = b.string(&format!("hello v{v}"));
        b.set_body(
            greeting,
            body(1, |a| {
                a.token(OpCode::LdStr, text).ret();
            }),
        );

        let pick = b.define_method(counter, "Pick", i32_sig.clone(), true);
        b.set_method_generic_arity(pick, 1);
        b.set_body(pick, ret_i32(v));

        let closure = b.define_nested_type(counter, "<>c");
        b.add_attribute(closure, "System.Runtime.CompilerServices.CompilerGeneratedAttribute");
        let lambda = b.define_method(closure, "Lambda", i32_sig.clone(), true);
        b.set_body(lambda, ret_i32(7 * v));

        let via_lambda = b.define_method(counter, "ViaLambda", i32_sig.clone(), true);
        b.set_body(
            via_lambda,
            body(1, |a| {
                a.call(lambda).ret();
            }),
        );

        let marked = b.define_type(MODULE, "Marked");
        b.add_attribute(marked, "HotSwap");
        let marked_value = b.define_method(marked, "Value", i32_sig.clone(), true);
        b.set_body(marked_value, ret_i32(10 * v));
        let pinned = b.define_method(marked, "Pinned", i32_sig.clone(), true);
        b.add_attribute(pinned, "IgnoreHotSwap");
        b.set_body(pinned, ret_i32(10 * v + 1));

        let marked_closure = b.define_nested_type(marked, "<>c");
        b.add_attribute(marked_closure, "CompilerGenerated");
        let marked_lambda = b.define_method(marked_closure, "Lambda", i32_sig.clone(), true);
        b.set_body(marked_lambda, ret_i32(70 * v));

        let unmarked = b.define_type(MODULE, "Unmarked");
        let unmarked_value = b.define_method(unmarked, "Value", i32_sig.clone(), true);
        b.set_body(unmarked_value, ret_i32(100 * v));
        let opted = b.define_method(unmarked, "Opted", i32_sig.clone(), true);
        b.add_attribute(opted, "hotswappable");
        b.set_body(opted, ret_i32(100 * v + 1));

        let ignored = b.define_type(MODULE, "Ignored");
        b.add_attribute(ignored, "HotSwap");
        b.add_attribute(ignored, "IgnoreHotSwapAttribute");
        let ignored_value = b.define_method(ignored, "Value", i32_sig.clone(), true);
        b.set_body(ignored_value, ret_i32(1000 * v));

        let inner = b.define_nested_type(ignored, "Inner");
        b.add_attribute(inner, "HotSwap");
        let inner_value = b.define_method(inner, "Value", i32_sig.clone(), true);
        b.set_body(inner_value, ret_i32(1000 * v + 1));

        let generic = b.define_type(MODULE, "Generic");
        b.add_attribute(generic, "HotSwap");
        b.set_type_generic_arity(generic, 1);
        let generic_value = b.define_method(generic, "Value", i32_sig.clone(), true);
        b.set_body(generic_value, ret_i32(v));

        let point = b.define_type(MODULE, "Point");
        let x = b.define_field(point, "x", TypeSig::I32, false);
        let point_ctor = b.define_method(point, ".ctor", MethodSig::new([TypeSig::I32], TypeSig::Void), false);
        b.set_body(
            point_ctor,
            body(2, |a| {
                a.ldarg(0).ldarg(1).token(OpCode::StFld, x).ret();
            }),
        );
        let scaled = b.define_method(point, "Scaled", i32_sig.clone(), false);
        b.set_body(
            scaled,
            body(2, |a| {
                a.ldarg(0).token(OpCode::LdFld, x).ldc_i4(v).op(OpCode::Mul).ret();
            }),
        );
        let make = b.define_method(point, "Make", i32_sig.clone(), true);
        b.set_body(
            make,
            body(1, |a| {
                a.ldc_i4(3).token(OpCode::NewObj, point_ctor).call(scaled).ret();
            }),
        );

        let errors = b.define_type(MODULE, "Errors");
        let finally_count = b.define_field(errors, "finally_count", TypeSig::I32, true);

        // try { try { throw new Boom(); } catch (Error) { result = v; } } finally { finally_count++; }
        let safe = b.define_method(errors, "Safe", i32_sig.clone(), true);
        let mut asm = Asm::new();
        let [try_start, catch_start, finally_start, end] = [asm.label(), asm.label(), asm.label(), asm.label()];
        asm.mark(try_start)
            .token(OpCode::NewObj, boom_ctor)
            .op(OpCode::Throw)
            .mark(catch_start)
            .op(OpCode::Pop)
            .ldc_i4(v)
            .stloc(0)
            .branch(OpCode::Leave, end)
            .mark(finally_start)
            .token(OpCode::LdSFld, finally_count)
            .ldc_i4(1)
            .op(OpCode::Add)
            .token(OpCode::StSFld, finally_count)
            .op(OpCode::EndFinally)
            .mark(end)
            .ldloc(0)
            .ret()
            .region(RegionKind::Catch(error), try_start, catch_start, catch_start, finally_start)
            .region(RegionKind::Finally, try_start, finally_start, finally_start, end);
        b.set_body(safe, asm.finish(2, vec![TypeSig::I32]).unwrap());

        let rethrow = b.define_method(errors, "Rethrow", i32_sig.clone(), true);
        b.set_body(
            rethrow,
            body(1, |a| {
                a.token(OpCode::NewObj, boom_ctor).op(OpCode::Throw);
            }),
        );

        b.finish()
    }
}

pub fn body(max_stack: u16, emit: impl FnOnce(&mut Asm)) -> MethodBody {
    let mut asm = Asm::new();
    emit(&mut asm);
    asm.finish(max_stack, Vec::new()).unwrap()
}

pub fn ret_i32(value: i32) -> MethodBody {
    body(1, |a| {
        a.ldc_i4(value).ret();
    })
}

pub fn ret_void() -> MethodBody {
    body(0, |a| {
        a.ret();
    })
}

/// A loaded `Game` module whose file lives at `<tmp>/Mods/Game/Assemblies/Game.hsm`.
pub struct Game {
    pub dir: TempDir,
    pub path: PathBuf,
    pub runtime: Runtime,
    pub module: ModuleId,
}

impl Game {
    pub fn load(build: Build) -> Self {
        init_logger();

        let dir = tempfile::tempdir().unwrap();
        let assemblies = dir.path().join("Mods").join(MODULE).join("Assemblies");
        fs::create_dir_all(&assemblies).unwrap();

        let path = assemblies.join("Game.hsm");
        build.image().write(&path).unwrap();
        set_modified(&path, SystemTime::now() - Duration::from_secs(60));

        let mut runtime = Runtime::new();
        let module = runtime.load_file(&path).unwrap();

        Self {
            dir,
            path,
            runtime,
            module,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("Mods").join(MODULE)
    }

    /// An engine with the module file registered.
    pub fn engine(&self) -> HotSwap {
        self.engine_with(Config::default())
    }

    pub fn engine_with(&self, config: Config) -> HotSwap {
        let mut engine = HotSwap::new(config);
        engine.register(&self.runtime, self.module, &self.path).unwrap();
        engine
    }

    /// Overwrites the module file with `build`, dated after any engine start time.
    pub fn rebuild(&self, build: Build) {
        build.image().write(&self.path).unwrap();
        set_modified(&self.path, SystemTime::now() + Duration::from_secs(60));
    }

    pub fn function(&self, type_name: &str, name: &str) -> FunctionId {
        self.runtime
            .function_by_name(type_name, name)
            .unwrap_or_else(|| panic!("no function {type_name}::{name}"))
    }

    pub fn call(&self, type_name: &str, name: &str) -> Value {
        self.runtime
            .call(self.function(type_name, name), Vec::new())
            .unwrap()
    }

    pub fn call_i32(&self, type_name: &str, name: &str) -> i32 {
        self.call(type_name, name).as_i32().unwrap()
    }
}

pub fn set_modified(path: &Path, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}
