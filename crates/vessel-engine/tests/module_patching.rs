//! Integration tests for live module patching

use std::io::Write;
use std::time::{Duration, Instant};
use vessel_engine::bytecode::{Constant, ModuleBuilder, Opcode};
use vessel_engine::{ExecutionMode, HostValue, Module, Vm, VmError, VmOptions};

/// `Game.score` starts at 0, `Game.version()` returns `version`
fn game_module(version: i32, extra_static: bool, score_initial: Constant) -> Module {
    let mut m = ModuleBuilder::new("game");
    let main = m.declare("main");
    let ver = m.declare("version");
    let mut class = m.class("Game");
    class.static_field("score", score_initial).method("version", ver);
    if extra_static {
        class.static_field("lives", Constant::I32(3));
    }
    m.define(main, 0, 0, |f| {
        f.ret_void();
    });
    m.define(ver, 0, 0, |f| {
        f.const_i32(version).ret();
    });
    m.build().unwrap()
}

fn loaded(options: VmOptions) -> Vm {
    let mut vm = Vm::new(options);
    vm.load(game_module(1, false, Constant::I32(0))).unwrap();
    vm.call_entry().unwrap();
    vm
}

#[test]
fn test_patch_swaps_code_and_keeps_statics() {
    let mut vm = loaded(VmOptions::default());
    vm.set_static("Game", "score", HostValue::Int(99)).unwrap();

    let report = vm.patch(game_module(2, true, Constant::I32(0))).unwrap();
    assert!(report.changed);
    assert_eq!(report.functions_changed, 1);
    assert_eq!(report.statics_preserved, 1);
    assert_eq!(report.statics_added, 1);

    assert_eq!(vm.call_static("Game", "version", &[]).unwrap(), HostValue::Int(2));
    assert_eq!(vm.get_static("Game", "score").unwrap(), HostValue::Int(99));
    assert_eq!(vm.get_static("Game", "lives").unwrap(), HostValue::Int(3));
}

#[test]
fn test_identical_patch_reports_unchanged() {
    let mut vm = loaded(VmOptions::default());
    let report = vm.patch(game_module(1, false, Constant::I32(5))).unwrap();
    assert!(!report.changed);
    // Initial values of kept statics do not overwrite live ones
    assert_eq!(vm.get_static("Game", "score").unwrap(), HostValue::Int(0));
}

#[test]
fn test_kind_change_rejected_and_old_module_survives() {
    let mut vm = loaded(VmOptions::default());
    vm.set_static("Game", "score", HostValue::Int(7)).unwrap();

    let err = vm
        .patch(game_module(2, false, Constant::Str("high".into())))
        .unwrap_err();
    assert!(matches!(err, VmError::PatchRejected(_)), "{err:?}");

    assert_eq!(vm.call_static("Game", "version", &[]).unwrap(), HostValue::Int(1));
    assert_eq!(vm.get_static("Game", "score").unwrap(), HostValue::Int(7));
}

#[test]
fn test_invalid_module_rejected() {
    let mut vm = loaded(VmOptions::default());
    let mut broken = game_module(2, false, Constant::I32(0));
    broken.functions[1].code = vec![Opcode::ConstI32 as u8];
    assert!(matches!(vm.patch(broken), Err(VmError::Load(_))));
    assert_eq!(vm.call_static("Game", "version", &[]).unwrap(), HostValue::Int(1));
}

#[test]
fn test_pending_callback_must_survive_patch() {
    let mut m = ModuleBuilder::new("timers");
    let main = m.declare("main");
    let tick = m.declare("on_tick");
    m.define(tick, 0, 0, |f| {
        f.ret_void();
    });
    m.define(main, 0, 0, |f| {
        f.const_f64(10.0).timer_add(tick).pop().ret_void();
    });
    let mut vm = Vm::new(VmOptions::default());
    vm.load(m.build().unwrap()).unwrap();
    vm.call_entry().unwrap();

    let mut without = ModuleBuilder::new("timers");
    let main = without.declare("main");
    without.define(main, 0, 0, |f| {
        f.ret_void();
    });
    assert!(matches!(
        vm.patch(without.build().unwrap()),
        Err(VmError::PatchRejected(_))
    ));
}

/// `Level.text` is filled by `on_loaded` when the read of `path` completes
fn level_module(path: &str, with_callback: bool) -> Module {
    let mut m = ModuleBuilder::new("level");
    let main = m.declare("main");
    let level = m.class("Level").static_field("text", Constant::Null).index();
    if with_callback {
        let on_loaded = m.declare("on_loaded");
        m.define(on_loaded, 1, 1, |f| {
            f.load_local(0).store_static(level, 0).ret_void();
        });
        m.define(main, 0, 0, |f| {
            f.const_str(path).async_read(on_loaded).ret_void();
        });
    } else {
        m.define(main, 0, 0, |f| {
            f.ret_void();
        });
    }
    m.build().unwrap()
}

#[test]
fn test_undrained_io_callback_must_survive_patch() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "level one").unwrap();
    let path = file.path().to_string_lossy().into_owned();

    let mut vm = Vm::new(VmOptions::default());
    vm.load(level_module(&path, true)).unwrap();
    vm.call_entry().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !vm.has_pending_async_io() {
        assert!(Instant::now() < deadline, "read never completed");
        std::thread::sleep(Duration::from_millis(1));
    }

    // The completion sits on the channel; dropping its callback would lose it
    assert!(matches!(
        vm.patch(level_module(&path, false)),
        Err(VmError::PatchRejected(_))
    ));
    assert_eq!(vm.drain_async_io().unwrap(), 1);
    assert_eq!(
        vm.get_static("Level", "text").unwrap(),
        HostValue::from("level one")
    );

    // Once dispatched the callback may go
    vm.patch(level_module(&path, false)).unwrap();
}

#[test]
fn test_static_mode_refuses_patch() {
    let mut vm = loaded(VmOptions {
        execution_mode: ExecutionMode::Static,
        ..VmOptions::default()
    });
    assert!(matches!(
        vm.patch(game_module(2, false, Constant::I32(0))),
        Err(VmError::PatchUnsupported)
    ));
}
