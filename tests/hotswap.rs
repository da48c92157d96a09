mod common;

use std::{
    cell::RefCell,
    fs,
    rc::Rc,
    time::{Duration, SystemTime},
};

use common::{Build, Game, MODULE, VERSION, body, init_logger, ret_i32, set_modified};
use hotswap::{
    Config, DirectoryContent, FrameEvents, HotSwap, MessageKind, ReloadScope, StatusSink,
    image::{ImageBuilder, MethodSig, ModuleImage, TypeSig},
    translate::{SkipReason, TranslateError, translate},
    vm::Runtime,
};

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<(MessageKind, String)>>>);

impl StatusSink for Recorder {
    fn message(&mut self, kind: MessageKind, text: &str) {
        self.0.borrow_mut().push((kind, text.to_owned()));
    }
}

#[test]
fn swap_return_1_to_2() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);

    game.rebuild(Build::v(2));

    let image = ModuleImage::read(&game.path).unwrap();
    let mut counter = 0;
    let report = translate(
        &game.runtime,
        game.module,
        &image,
        ReloadScope::AllEligibleFunctions,
        &mut counter,
    );
    let value = game.function("Game.Counter", "Value");
    assert_eq!(report.swapped().filter(|pair| pair.original == value).count(), 1);
    assert_eq!(report.failures().count(), 0);

    let summaries = engine.trigger_all(&game.runtime);
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].reloaded > 0);
    assert_eq!(summaries[0].failed, 0);

    assert!(engine.redirects().get(value).is_some());
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);

    // callers and everything else referenced by the new bodies
    assert_eq!(game.call_i32("Game.Counter", "Twice"), 4);
    assert_eq!(game.call_i32("Game.Counter", "ViaLambda"), 14);
    assert_eq!(game.call_i32("Game.Point", "Make"), 6);
    assert_eq!(game.call("Game.Counter", "Greeting").as_str(), Some("hello v2"));
}

#[test]
fn static_state_survives_swap() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    assert_eq!(game.call_i32("Game.Counter", "Bump"), 1);
    assert_eq!(game.call_i32("Game.Counter", "Bump"), 2);

    game.rebuild(Build::v(5));
    engine.trigger_all(&game.runtime);

    assert_eq!(game.call_i32("Game.Counter", "Bump"), 7);
}

#[test]
fn second_sweep_does_nothing() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    game.rebuild(Build::v(2));
    let first = engine.trigger_all(&game.runtime);
    assert!(first[0].reloaded > 0);

    let second = engine.trigger_all(&game.runtime);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].reloaded, 0);
    assert!(second[0].unchanged_file);

    // without the content hash shortcut, the encodings still compare equal
    let image = ModuleImage::read(&game.path).unwrap();
    let mut counter = 0;
    let report = translate(
        &game.runtime,
        game.module,
        &image,
        ReloadScope::AllEligibleFunctions,
        &mut counter,
    );
    assert_eq!(report.swapped().count(), 0);
    assert_eq!(counter, 0);
}

#[test]
fn one_redirect_per_function() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();
    let value = game.function("Game.Counter", "Value");

    game.rebuild(Build::v(2));
    engine.trigger_all(&game.runtime);
    let redirects = engine.redirects().len();
    let second = Rc::clone(engine.redirects().get(value).unwrap().target());

    game.rebuild(Build::v(3));
    engine.trigger_all(&game.runtime);

    assert_eq!(engine.redirects().len(), redirects);
    let entry = engine.redirects().get(value).unwrap();
    assert!(entry.is_active());
    assert!(!Rc::ptr_eq(entry.target(), &second));
    assert!(entry.target().name.contains("$hotswap"));
    assert_eq!(Rc::strong_count(&second), 1, "the replaced body is still referenced");
    assert_eq!(game.call_i32("Game.Counter", "Value"), 3);

    // going back to the original build is just another swap
    game.rebuild(Build::v(1));
    engine.trigger_all(&game.runtime);
    assert_eq!(engine.redirects().len(), redirects);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);
}

#[test]
fn marked_only_scope() {
    let game = Game::load(Build::v(1).marked_only());
    let mut engine = game.engine();

    let file = engine.registry().lookup(game.module).unwrap().clone();
    assert_eq!(engine.registry().scope_of(&file), ReloadScope::MarkedOnly);

    game.rebuild(Build::v(2).marked_only());
    engine.trigger_all(&game.runtime);

    assert_eq!(game.call_i32("Game.Marked", "Value"), 20);
    assert_eq!(game.call_i32("Game.Unmarked", "Value"), 100);
    assert_eq!(game.call_i32("Game.Unmarked", "Opted"), 201);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);
}

#[test]
fn include_all_scope() {
    let game = Game::load(Build::v(1));
    let engine = game.engine();

    let file = engine.registry().lookup(game.module).unwrap().clone();
    assert_eq!(engine.registry().scope_of(&file), ReloadScope::AllEligibleFunctions);
}

#[test]
fn exclude_wins() {
    for build in [Build::v(1), Build::v(1).marked_only()] {
        let game = Game::load(build);
        let mut engine = game.engine();

        game.rebuild(Build {
            version: 2,
            ..build
        });
        engine.trigger_all(&game.runtime);

        assert_eq!(game.call_i32("Game.Ignored", "Value"), 1000);
        assert_eq!(game.call_i32("Game.Ignored+Inner", "Value"), 1001);
        assert_eq!(game.call_i32("Game.Marked", "Pinned"), 11);
        assert_eq!(game.call_i32("Game.Marked", "Value"), 20);
    }
}

#[test]
fn generics_are_never_swapped() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    game.rebuild(Build::v(2));

    let image = ModuleImage::read(&game.path).unwrap();
    let mut counter = 0;
    let report = translate(
        &game.runtime,
        game.module,
        &image,
        ReloadScope::AllEligibleFunctions,
        &mut counter,
    );

    let reason = |function: &str| {
        report
            .skipped()
            .find(|(name, _)| name.starts_with(function))
            .map(|(_, reason)| reason)
    };
    assert_eq!(reason("Game.Counter::Pick"), Some(SkipReason::GenericFunction));
    assert_eq!(reason("Game.Generic::Value"), Some(SkipReason::GenericType));

    engine.trigger_all(&game.runtime);

    assert_eq!(game.call_i32("Game.Counter", "Pick"), 1);
    assert_eq!(game.call_i32("Game.Generic", "Value"), 1);
}

#[test]
fn unchanged_functions_are_skipped() {
    let game = Game::load(Build::v(1));

    game.rebuild(Build::v(2));
    let image = ModuleImage::read(&game.path).unwrap();
    let mut counter = 0;
    let report = translate(
        &game.runtime,
        game.module,
        &image,
        ReloadScope::AllEligibleFunctions,
        &mut counter,
    );

    let twice = game.function("Game.Counter", "Twice");
    assert!(report.swapped().all(|pair| pair.original != twice));
    assert!(
        report
            .skipped()
            .any(|(name, reason)| name.starts_with("Game.Counter::Twice") && reason == SkipReason::Unchanged)
    );
    assert_eq!(counter as usize, report.swapped().count());
}

#[test]
fn unmarked_functions_of_a_partly_marked_type() {
    let game = Game::load(Build::v(1).marked_only());
    let image = Build::v(2).marked_only().image();

    let mut counter = 0;
    let report = translate(&game.runtime, game.module, &image, ReloadScope::MarkedOnly, &mut counter);

    let reason = |function: &str| {
        report
            .skipped()
            .find(|(name, _)| name.starts_with(function))
            .map(|(_, reason)| reason)
    };
    assert_eq!(reason("Game.Unmarked::Value"), Some(SkipReason::NotMarked));
    assert_eq!(reason("Game.Marked::Pinned"), Some(SkipReason::Excluded));
    // types with no marker at all are not visited
    assert_eq!(reason("Game.Counter::Value"), None);

    let opted = game.function("Game.Unmarked", "Opted");
    assert!(report.swapped().any(|pair| pair.original == opted));
}

/// `P.Host` as loaded, and a rebuild whose definitions cannot replace it.
fn mismatched_host() -> (Runtime, ModuleImage) {
    init_logger();

    let i32_sig = MethodSig::nullary(TypeSig::I32);

    let mut live = ImageBuilder::new("P", "1.0.0");
    let host = live.define_type("P", "Host");
    live.add_attribute(host, "HotSwapAll");
    let value = live.define_method(host, "Value", i32_sig.clone(), true);
    live.set_body(value, ret_i32(1));
    live.define_method(host, "Abstract", i32_sig.clone(), false);
    let dropped = live.define_method(host, "Dropped", i32_sig.clone(), true);
    live.set_body(dropped, ret_i32(1));
    let widen = live.define_method(host, "Widen", i32_sig.clone(), true);
    live.set_body(widen, ret_i32(1));

    let mut runtime = Runtime::new();
    runtime.load(&live.finish()).unwrap();

    let mut rebuilt = ImageBuilder::new("P", "1.0.0");
    let host = rebuilt.define_type("P", "Host");
    rebuilt.add_attribute(host, "HotSwapAll");
    for _ in 0..2 {
        let value = rebuilt.define_method(host, "Value", i32_sig.clone(), true);
        rebuilt.set_body(value, ret_i32(2));
    }
    rebuilt.define_method(host, "Abstract", i32_sig.clone(), false);
    rebuilt.define_method(host, "Dropped", i32_sig, true);
    let widen = rebuilt.define_method(host, "Widen", MethodSig::nullary(TypeSig::I64), true);
    rebuilt.set_body(
        widen,
        body(1, |a| {
            a.ldc_i8(2).ret();
        }),
    );

    (runtime, rebuilt.finish())
}

#[test]
fn unmatchable_definitions_are_reported() {
    let (runtime, image) = mismatched_host();
    let module = runtime.module_by_name("P").unwrap();

    let mut counter = 0;
    let report = translate(&runtime, module, &image, ReloadScope::AllEligibleFunctions, &mut counter);

    assert_eq!(report.swapped().count(), 0);
    assert_eq!(counter, 0);

    let failure = |function: &str| {
        report
            .failures()
            .find(|(name, _)| name.starts_with(function))
            .map(|(_, error)| error)
    };
    assert!(matches!(
        failure("P.Host::Value"),
        Some(TranslateError::Ambiguous { count: 2 })
    ));
    assert!(matches!(
        failure("P.Host::Widen"),
        Some(TranslateError::ReturnTypeChanged {
            live: TypeSig::I32,
            image: TypeSig::I64,
        })
    ));

    let skipped = report.skipped().collect::<Vec<_>>();
    assert!(skipped.iter().any(|&(name, reason)| name.starts_with("P.Host::Abstract") && reason == SkipReason::NoBody));
    assert!(skipped.iter().any(|&(name, reason)| name.starts_with("P.Host::Dropped") && reason == SkipReason::NoBody));

    let value = runtime.function_by_name("P.Host", "Value").unwrap();
    assert_eq!(runtime.call(value, Vec::new()).unwrap().as_i32(), Some(1));
}

#[test]
fn files_older_than_startup_are_ignored() {
    let game = Game::load(Build::v(1));
    let start = SystemTime::now();
    let mut engine = game.engine().with_start_time(start);

    game.rebuild(Build::v(2));
    set_modified(&game.path, start - Duration::from_secs(10));
    assert!(engine.trigger_all(&game.runtime).is_empty());
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);

    set_modified(&game.path, start);
    assert!(engine.trigger_all(&game.runtime).is_empty());

    set_modified(&game.path, start + Duration::from_secs(10));
    assert_eq!(engine.trigger_all(&game.runtime).len(), 1);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);
}

#[test]
fn failing_function_does_not_stop_the_rest() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    game.rebuild(Build::v(2).broken());
    let summaries = engine.trigger_all(&game.runtime);

    assert_eq!(summaries[0].failed, 1);
    assert!(summaries[0].reloaded > 0);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);
    assert_eq!(game.call_i32("Game.Counter", "ViaLambda"), 14);
    assert_eq!(game.call_i32("Game.Marked", "Value"), 20);
}

#[test]
fn nested_generated_types_follow_their_declaring_type() {
    let game = Game::load(Build::v(1).marked_only());
    let mut engine = game.engine();

    game.rebuild(Build::v(2).marked_only());
    engine.trigger_all(&game.runtime);

    // `Marked` carries the include marker, its closure type does not
    assert_eq!(game.call_i32("Game.Marked+<>c", "Lambda"), 140);
    // `Counter` is not marked, so neither is its closure type
    assert_eq!(game.call_i32("Game.Counter", "ViaLambda"), 7);
}

#[test]
fn exception_regions_survive_translation() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    let errors = game.runtime.find_type("Game.Errors").unwrap();
    let finally_count = game.runtime.find_field(errors, "finally_count").unwrap();

    assert_eq!(game.call_i32("Game.Errors", "Safe"), 1);
    assert_eq!(game.runtime.static_value(finally_count), Some(1.into()));

    game.rebuild(Build::v(2));
    engine.trigger_all(&game.runtime);

    let safe = game.function("Game.Errors", "Safe");
    assert!(engine.redirects().get(safe).is_some());
    assert_eq!(game.call_i32("Game.Errors", "Safe"), 2);
    assert_eq!(game.runtime.static_value(finally_count), Some(2.into()));
}

#[test]
fn deferred_sweep_waits_for_repaints() {
    let game = Game::load(Build::v(1));
    let recorder = Recorder::default();
    let mut engine = game.engine().with_status_sink(recorder.clone());

    game.rebuild(Build::v(2));

    let hotkey = FrameEvents {
        hotkey_pressed: true,
        ..FrameEvents::default()
    };
    assert!(engine.on_frame(&game.runtime, hotkey).is_empty());
    assert!(engine.is_deferred_pending());
    assert_eq!(
        recorder.0.borrow().first(),
        Some(&(MessageKind::Silent, "Hotswapping...".to_owned()))
    );

    // frames without a repaint do not count
    assert!(engine.on_frame(&game.runtime, FrameEvents::default()).is_empty());
    assert!(engine.on_frame(&game.runtime, FrameEvents::REPAINT).is_empty());
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);

    let summaries = engine.on_frame(&game.runtime, FrameEvents::REPAINT);
    assert_eq!(summaries.len(), 1);
    assert!(!engine.is_deferred_pending());
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);

    let messages = recorder.0.borrow();
    let (kind, text) = messages.last().unwrap();
    assert_eq!(*kind, MessageKind::Event);
    assert_eq!(
        *text,
        format!("Reloaded {} functions in Game (from Game.hsm)", summaries[0].reloaded)
    );
}

#[test]
fn button_schedules_a_sweep() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine_with(Config {
        deferred_frames: 1,
        ..Config::default()
    });

    game.rebuild(Build::v(2));

    let click = FrameEvents {
        button_clicked: true,
        ..FrameEvents::default()
    };
    engine.on_frame(&game.runtime, click);
    assert_eq!(engine.on_frame(&game.runtime, FrameEvents::REPAINT).len(), 1);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);
}

#[test]
fn trigger_file_resolves_registered_paths() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    game.rebuild(Build::v(2));

    let unrelated = game.dir.path().join("Other.hsm");
    assert!(engine.trigger_file(&game.runtime, &unrelated).is_none());

    let summary = engine.trigger_file(&game.runtime, &game.path).unwrap();
    assert_eq!(summary.module, game.module);
    assert!(summary.reloaded > 0);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);
}

#[test]
fn trigger_file_honors_auto_reload() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine_with(Config {
        auto_reload: false,
        ..Config::default()
    });

    game.rebuild(Build::v(2));

    assert!(engine.trigger_file(&game.runtime, &game.path).is_none());
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);

    // manual sweeps still work
    assert_eq!(engine.trigger_all(&game.runtime).len(), 1);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);
}

#[test]
fn unparsable_file_leaves_functions_alone() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();

    fs::write(&game.path, b"not a module").unwrap();
    set_modified(&game.path, SystemTime::now() + Duration::from_secs(60));

    assert!(engine.trigger_all(&game.runtime).is_empty());
    assert_eq!(game.call_i32("Game.Counter", "Value"), 1);

    // a complete build written afterwards is picked up
    game.rebuild(Build::v(2));
    assert_eq!(engine.trigger_all(&game.runtime).len(), 1);
    assert_eq!(game.call_i32("Game.Counter", "Value"), 2);
}

#[test]
fn discovery_filters_roots_and_identities() {
    let game = Game::load(Build::v(1));
    let mut runtime = game.runtime;

    let other_root = game.dir.path().join("Elsewhere").join("Other");
    fs::create_dir_all(other_root.join("Assemblies")).unwrap();
    let other_path = other_root.join("Assemblies").join("Other.hsm");
    let mut other = ImageBuilder::new("Other", VERSION);
    let ty = other.define_type("Other", "Thing");
    let method = other.define_method(ty, "Value", MethodSig::nullary(TypeSig::I32), true);
    other.set_body(method, ret_i32(5));
    other.finish().write(&other_path).unwrap();
    let other_module = runtime.load_file(&other_path).unwrap();

    let assemblies = game.path.parent().unwrap().to_path_buf();
    let mut stale = ImageBuilder::new(MODULE, "0.9.0");
    stale.define_type(MODULE, "Old");
    stale.finish().write(assemblies.join("Stale.hsm")).unwrap();
    fs::write(assemblies.join("notes.txt"), "not a module").unwrap();

    let mut content = DirectoryContent::new();
    content
        .add_root(game.dir.path().join("Mods").join(MODULE), [game.module])
        .add_root(&other_root, [other_module]);

    let mut engine = HotSwap::new(Config::default());
    assert_eq!(engine.discover(&runtime, &content), 1);

    let file = engine.registry().lookup(game.module).unwrap();
    assert_eq!(file.path(), fs::canonicalize(&game.path).unwrap());
    assert!(engine.registry().lookup(other_module).is_none());
    assert_eq!(
        engine.registry().watch_dirs(),
        [fs::canonicalize(&assemblies).unwrap()]
    );

    // discovering again registers nothing new
    assert_eq!(engine.discover(&runtime, &content), 1);
    assert_eq!(engine.registry().len(), 1);
}

#[cfg(feature = "watch")]
#[test]
fn watcher_triggers_swaps() {
    let game = Game::load(Build::v(1));
    let mut engine = game.engine();
    engine.watch().unwrap();
    assert!(engine.is_watching());

    game.rebuild(Build::v(2));

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while game.call_i32("Game.Counter", "Value") != 2 {
        assert!(std::time::Instant::now() < deadline, "no change was picked up");
        engine.on_frame(&game.runtime, FrameEvents::default());
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn new_types_are_ignored() {
    let game = Game::load(Build::v(1));
    let runtime: &Runtime = &game.runtime;

    let mut image = Build::v(2).image();
    let mut extra = ImageBuilder::new(MODULE, VERSION);
    let ty = extra.define_type(MODULE, "Brand");
    let method = extra.define_method(ty, "New", MethodSig::nullary(TypeSig::I32), true);
    extra.set_body(method, ret_i32(9));
    let extra = extra.finish();

    let owner = image.types.len() as u32;
    image.types.extend(extra.types);
    image.methods.extend(extra.methods.into_iter().map(|mut m| {
        m.owner = owner;
        m
    }));

    let mut counter = 0;
    let report = translate(
        runtime,
        game.module,
        &image,
        ReloadScope::AllEligibleFunctions,
        &mut counter,
    );

    assert_eq!(report.failures().count(), 0);
    assert!(report.swapped().count() > 0);
    assert!(runtime.find_type("Game.Brand").is_none());
}
