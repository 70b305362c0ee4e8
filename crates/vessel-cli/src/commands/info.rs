//! `vessel info`: Display version and environment info.

use vessel_runtime::{ExecutionSetting, Vessel, VesselConfig};

pub fn execute() -> anyhow::Result<()> {
    println!("Vessel v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Platform:     {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    println!("Runtime:      {}", Vessel::runtime_version());
    let jit = if cfg!(feature = "jit") { "available" } else { "disabled" };
    println!("JIT:          {}", jit);

    // Effective configuration after VESSEL_* overrides
    match VesselConfig::from_env() {
        Ok(config) => {
            let execution = match config.vm.execution {
                ExecutionSetting::Auto => "auto",
                ExecutionSetting::Jit => "jit",
                ExecutionSetting::Static => "static",
            };
            println!("Execution:    {}", execution);
            println!("Hot reload:   {}", config.hot_reload.enabled);
            println!("Log level:    {}", config.logging.level);
        }
        Err(e) => println!("Config:       invalid ({})", e),
    }

    println!();
    println!("Environment:");
    for var in [
        "VESSEL_EXECUTION",
        "VESSEL_GC_THRESHOLD",
        "VESSEL_GC_PAUSE_TIMEOUT_MS",
        "VESSEL_STOP_TIMEOUT_MS",
        "VESSEL_CALL_TIMEOUT_MS",
        "VESSEL_TICK_INTERVAL_MS",
        "VESSEL_HOT_RELOAD",
        "VESSEL_LOG_LEVEL",
        "VESSEL_LOG",
    ] {
        print_env(var);
    }

    Ok(())
}

fn print_env(var: &str) {
    match std::env::var(var) {
        Ok(val) => println!("  {} = {}", var, val),
        Err(_) => println!("  {} = (default)", var),
    }
}
