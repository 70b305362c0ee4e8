//! `vessel demo`: Write a small module that exercises the event loops.

use anyhow::Context;
use std::path::Path;
use vessel_engine::bytecode::{BuildError, Constant, ModuleBuilder, Opcode};
use vessel_engine::Module;

/// `Demo` greets through `host.print`, counts frames and quarter-second ticks
pub fn build() -> Result<Module, BuildError> {
    let mut m = ModuleBuilder::new("demo");
    let main = m.declare("main");
    let on_frame = m.declare("on_frame");
    let on_tick = m.declare("on_tick");
    let add = m.declare("add");
    let demo = m
        .class("Demo")
        .static_field("frames", Constant::I32(0))
        .static_field("ticks", Constant::I32(0))
        .static_field("greeting", Constant::Str("Hello from Vessel".into()))
        .method("add", add)
        .index();

    m.define(main, 0, 0, |f| {
        f.load_static(demo, 2).call_native("host.print", 1).pop();
        f.const_f64(0.25).timer_every(on_tick).pop();
        f.main_loop_add(on_frame).ret_void();
    });
    m.define(on_frame, 0, 0, |f| {
        f.load_static(demo, 0).const_i32(1).raw(Opcode::Iadd).store_static(demo, 0);
        f.ret_void();
    });
    m.define(on_tick, 0, 0, |f| {
        f.load_static(demo, 1).const_i32(1).raw(Opcode::Iadd).store_static(demo, 1);
        f.ret_void();
    });
    m.define(add, 2, 2, |f| {
        f.load_local(0).load_local(1).raw(Opcode::Iadd).ret();
    });
    m.entry(main);
    m.build()
}

pub fn execute(output: &Path) -> anyhow::Result<()> {
    let module = build().context("demo module failed to build")?;
    std::fs::write(output, module.encode())
        .with_context(|| format!("failed to write '{}'", output.display()))?;
    println!("Wrote {}", output.display());
    println!("Try: vessel run {} --frames 120", output.display());
    Ok(())
}
