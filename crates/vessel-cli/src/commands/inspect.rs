//! `vessel inspect`: Show the contents of a bytecode file.

use anyhow::Context;
use std::path::Path;
use vessel_engine::bytecode::{self, decode_code, flags, Constant, Instruction, Module};

pub fn execute(file: &Path, code: bool) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read '{}'", file.display()))?;
    let module = bytecode::load_module(&bytes)
        .with_context(|| format!("'{}' is not valid Vessel bytecode", file.display()))?;

    println!("Module:    {}", module.name);
    println!("Size:      {} bytes", bytes.len());
    println!("Flags:     {}", describe_flags(module.flags));
    let entry = module.entry_function().map_or("?", |f| f.name.as_str());
    println!("Entry:     {}", entry);

    println!();
    println!("Functions ({}):", module.functions.len());
    for (i, function) in module.functions.iter().enumerate() {
        println!(
            "  {:>3}  {}  params={} locals={} code={}B",
            i,
            function.name,
            function.param_count,
            function.local_count,
            function.code.len()
        );
        if code {
            for (offset, instr) in decode_code(&function.code)? {
                println!("         {:04}  {}", offset, render(&module, &instr));
            }
        }
    }

    println!();
    println!("Classes ({}):", module.classes.len());
    for class in &module.classes {
        println!("  {}", class.name);
        for field in &class.statics {
            println!("    static {} = {}", field.name, render_constant(&field.initial));
        }
        for method in &class.methods {
            let target = module
                .functions
                .get(method.function as usize)
                .map_or("?", |f| f.name.as_str());
            println!("    method {} -> {}", method.name, target);
        }
    }

    if !module.natives.is_empty() {
        println!();
        println!("Natives ({}):", module.natives.len());
        for native in &module.natives {
            println!("  {}", native);
        }
    }
    Ok(())
}

fn describe_flags(bits: u32) -> String {
    let mut names = Vec::new();
    if bits & flags::HAS_NATIVES != 0 {
        names.push("natives");
    }
    if bits & flags::DEBUG_NAMES != 0 {
        names.push("debug-names");
    }
    if names.is_empty() {
        format!("{:#x}", bits)
    } else {
        format!("{:#x} ({})", bits, names.join(", "))
    }
}

fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::Null => "null".to_string(),
        Constant::Bool(b) => b.to_string(),
        Constant::I32(i) => format!("{} (int)", i),
        Constant::F64(x) => format!("{} (float)", x),
        Constant::Str(s) => format!("{:?}", s),
    }
}

/// One instruction with pool and table indices resolved to names
fn render(module: &Module, instr: &Instruction) -> String {
    let function = |i: u32| {
        module
            .functions
            .get(i as usize)
            .map_or("?", |f| f.name.as_str())
    };
    let static_name = |class: u32, field: u16| {
        module
            .classes
            .get(class as usize)
            .and_then(|c| {
                c.statics
                    .get(field as usize)
                    .map(|f| format!("{}.{}", c.name, f.name))
            })
            .unwrap_or_else(|| "?".to_string())
    };
    let op = instr.opcode().name();
    match *instr {
        Instruction::Op(_) => op.to_string(),
        Instruction::ConstI32(v) => format!("{} {}", op, v),
        Instruction::ConstF64(v) => format!("{} {}", op, v),
        Instruction::ConstStr(i) => match module.strings.get(i as usize) {
            Some(s) => format!("{} {:?}", op, s),
            None => format!("{} #{}", op, i),
        },
        Instruction::LoadLocal(slot) | Instruction::StoreLocal(slot) => format!("{} {}", op, slot),
        Instruction::LoadStatic { class, field } | Instruction::StoreStatic { class, field } => {
            format!("{} {}", op, static_name(class, field))
        }
        Instruction::Jump(_, offset) => format!("{} {:+}", op, offset),
        Instruction::Call(f) | Instruction::Intrinsic(_, f) => format!("{} {}", op, function(f)),
        Instruction::CallNative { native, argc } => {
            let name = module.natives.get(native as usize).map_or("?", |n| n.as_str());
            format!("{} {}/{}", op, name, argc)
        }
    }
}
