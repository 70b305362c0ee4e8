//! Shared fixtures: bytecode modules and fresh instances
//!
//! Every test gets its own [`ProcessRegistry`], so the one-instance rule
//! applies per test instead of per test binary.

use std::path::{Path, PathBuf};
use vessel_engine::bytecode::{Constant, ModuleBuilder, Opcode};
use vessel_engine::Module;
use vessel_runtime::{ProcessRegistry, Vessel, VesselConfig};

/// `Game` with `score`, `started`, `version()` and `bump()`
///
/// The entry point sets `Game.started`. `bump()` increments `score` and
/// returns the new value. With `extra_static`, `Game.lives` (3) is added.
pub fn game_module(version: i32, extra_static: bool) -> Module {
    game_module_with_score(version, extra_static, Constant::I32(0))
}

pub fn game_module_with_score(version: i32, extra_static: bool, score: Constant) -> Module {
    let mut m = ModuleBuilder::new("game");
    let main = m.declare("main");
    let ver = m.declare("version");
    let bump = m.declare("bump");
    let add = m.declare("add");
    let mut class = m.class("Game");
    class
        .static_field("score", score)
        .static_field("started", Constant::Bool(false))
        .static_field("title", Constant::Str("vessel".into()))
        .static_field("speed", Constant::F64(1.5))
        .method("version", ver)
        .method("bump", bump);
    if extra_static {
        class.static_field("lives", Constant::I32(3));
    }
    let game = class.index();

    m.define(main, 0, 0, |f| {
        f.const_bool(true).store_static(game, 1).ret_void();
    });
    m.define(ver, 0, 0, |f| {
        f.const_i32(version).ret();
    });
    m.define(bump, 0, 0, |f| {
        f.load_static(game, 0)
            .const_i32(1)
            .raw(Opcode::Iadd)
            .dup()
            .store_static(game, 0)
            .ret();
    });
    m.define(add, 2, 2, |f| {
        f.load_local(0).load_local(1).raw(Opcode::Iadd).ret();
    });
    m.entry(main);
    m.build().unwrap()
}

/// `Ticker` counts main-loop frames and 50 ms timer hits
pub fn ticker_module() -> Module {
    let mut m = ModuleBuilder::new("ticker");
    let main = m.declare("main");
    let on_frame = m.declare("on_frame");
    let on_timer = m.declare("on_timer");
    let ticker = m
        .class("Ticker")
        .static_field("frames", Constant::I32(0))
        .static_field("timer_hits", Constant::I32(0))
        .index();
    m.define(on_frame, 0, 0, |f| {
        f.load_static(ticker, 0).const_i32(1).raw(Opcode::Iadd).store_static(ticker, 0);
        f.ret_void();
    });
    m.define(on_timer, 0, 0, |f| {
        f.load_static(ticker, 1).const_i32(1).raw(Opcode::Iadd).store_static(ticker, 1);
        f.ret_void();
    });
    m.define(main, 0, 0, |f| {
        f.const_f64(0.05).timer_every(on_timer).pop();
        f.main_loop_add(on_frame).ret_void();
    });
    m.entry(main);
    m.build().unwrap()
}

/// Entry point that throws
pub fn faulty_module() -> Module {
    let mut m = ModuleBuilder::new("faulty");
    let main = m.declare("main");
    m.class("Game").static_field("score", Constant::I32(0));
    m.define(main, 0, 0, |f| {
        f.throw_str("boom");
    });
    m.build().unwrap()
}

/// Entry point that calls the host native `host.log` with one argument
pub fn native_module() -> Module {
    let mut m = ModuleBuilder::new("natives");
    let main = m.declare("main");
    let out = m.class("Out").static_field("reply", Constant::Null).index();
    m.define(main, 0, 0, |f| {
        f.const_str("hello")
            .call_native("host.log", 1)
            .store_static(out, 0)
            .ret_void();
    });
    m.build().unwrap()
}

pub fn write_module(dir: &Path, name: &str, module: &Module) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, module.encode()).unwrap();
    path
}

pub fn create(config: VesselConfig) -> Vessel {
    Vessel::create_in(&ProcessRegistry::new(), config).unwrap()
}

/// Created, initialized and loaded with `module`, entry not yet run
pub fn loaded_with(config: VesselConfig, module: &Module) -> Vessel {
    let vm = create(config);
    vm.init(&[]).unwrap();
    vm.load_memory(&module.encode()).unwrap();
    vm
}

/// [`game_module`] version 1 with the entry point run
pub fn running_game(config: VesselConfig) -> Vessel {
    let vm = loaded_with(config, &game_module(1, false));
    vm.call_entry().unwrap();
    vm
}
