//! `vessel run`: drive a bytecode file the way an embedding host would.

use crate::watch::ModuleWatcher;
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use vessel_runtime::{HostValue, IntegrationMode, Vessel, VesselConfig};

pub struct RunArgs {
    pub file: PathBuf,
    pub args: Vec<String>,
    pub config: Option<PathBuf>,
    pub threaded: bool,
    pub frames: u64,
    pub dt: f64,
    pub hot_reload: bool,
    pub watch: bool,
    pub print: Vec<String>,
}

pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    if !args.dt.is_finite() || args.dt < 0.0 {
        anyhow::bail!("--dt must be a non-negative number of seconds");
    }
    let probes = args
        .print
        .iter()
        .map(|p| parse_probe(p))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = match &args.config {
        Some(path) => VesselConfig::from_file(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?,
        None => VesselConfig::from_env()?,
    };
    if args.hot_reload || args.watch {
        config.hot_reload.enabled = true;
    }
    vessel_runtime::logging::init_logging(&config.logging.level);

    let vm = Vessel::create_with_config(config)?;
    let result = drive(&vm, &args, &probes);
    let teardown = vm.destroy();
    result?;
    teardown.context("teardown failed")?;
    Ok(())
}

/// `Class.field` to print after the run
fn parse_probe(spec: &str) -> anyhow::Result<(String, String)> {
    match spec.split_once('.') {
        Some((class, field)) if !class.is_empty() && !field.is_empty() => {
            Ok((class.to_string(), field.to_string()))
        }
        _ => Err(anyhow!("expected CLASS.FIELD, got '{}'", spec)),
    }
}

fn drive(vm: &Vessel, args: &RunArgs, probes: &[(String, String)]) -> anyhow::Result<()> {
    let mut argv = vec![args.file.display().to_string()];
    argv.extend(args.args.iter().cloned());
    vm.init(&argv)?;
    register_host_natives(vm)?;
    vm.load_file(&args.file)
        .with_context(|| format!("failed to load '{}'", args.file.display()))?;

    let watcher = if args.watch {
        Some(ModuleWatcher::new(&args.file)?)
    } else {
        None
    };

    let values = if args.threaded {
        run_threaded(vm, args, watcher.as_ref(), probes)?
    } else {
        run_frames(vm, args, watcher.as_ref(), probes)?
    };
    for ((class, field), value) in probes.iter().zip(values) {
        println!("{}.{} = {}", class, field, value);
    }
    Ok(())
}

/// Natives every program run by the CLI can call
fn register_host_natives(vm: &Vessel) -> anyhow::Result<()> {
    vm.register_native("host.print", |args: &[HostValue]| {
        let line = args
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}", line);
        Ok(HostValue::Null)
    })?;
    vm.register_native("host.time", |_: &[HostValue]| {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| e.to_string())?;
        Ok(HostValue::Float(now.as_secs_f64()))
    })?;
    Ok(())
}

fn report_reload(result: vessel_runtime::VesselResult<bool>) {
    match result {
        Ok(true) => println!("Reloaded."),
        Ok(false) => {}
        Err(e) => eprintln!("Reload failed: {}", e),
    }
}

/// Host-driven: one `update` per frame on this thread
fn run_frames(
    vm: &Vessel,
    args: &RunArgs,
    watcher: Option<&ModuleWatcher>,
    probes: &[(String, String)],
) -> anyhow::Result<Vec<HostValue>> {
    vm.call_entry()?;

    // A fixed frame count runs on virtual time; otherwise wait in real time
    // for outstanding timers and I/O
    let realtime = args.frames == 0;
    let mut frame = 0;
    loop {
        let more = if realtime {
            vm.has_pending_work()
        } else {
            frame < args.frames
        };
        if !more {
            break;
        }
        if let Some(w) = watcher {
            if w.changed() {
                report_reload(vm.check_reload());
            }
        }
        vm.update(args.dt)?;
        frame += 1;
        if realtime {
            thread::sleep(Duration::from_secs_f64(args.dt));
        }
    }
    tracing::debug!(frames = frame, "run finished");

    probes
        .iter()
        .map(|(class, field)| Ok(vm.get_static(class, field)?))
        .collect()
}

/// Dedicated VM thread; this thread only feeds it calls
fn run_threaded(
    vm: &Vessel,
    args: &RunArgs,
    watcher: Option<&ModuleWatcher>,
    probes: &[(String, String)],
) -> anyhow::Result<Vec<HostValue>> {
    vm.set_mode(IntegrationMode::Threaded)?;
    vm.start()?;

    let frame_time = Duration::from_secs_f64(args.dt);
    let mut frame = 0;
    loop {
        if args.frames > 0 && frame >= args.frames {
            break;
        }
        if args.frames == 0 {
            let probe = vm.clone();
            if !vm.call_sync(move || probe.has_pending_work())? {
                break;
            }
        }
        if let Some(w) = watcher {
            if w.changed() {
                let target = vm.clone();
                report_reload(vm.call_sync(move || target.check_reload())?);
            }
        }
        thread::sleep(frame_time);
        frame += 1;
    }

    let reader = vm.clone();
    let probes = probes.to_vec();
    let values = vm.call_sync(move || {
        probes
            .iter()
            .map(|(class, field)| reader.get_static(class, field))
            .collect::<Result<Vec<_>, _>>()
    })??;
    vm.stop()?;
    Ok(values)
}
