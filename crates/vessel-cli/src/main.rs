//! Vessel command-line driver
//!
//! Plays the host application: creates the process-wide VM, loads a bytecode
//! file and drives it either frame by frame or on a dedicated VM thread.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod watch;

#[derive(Parser)]
#[command(name = "vessel")]
#[command(about = "Run and inspect Vessel bytecode", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bytecode file
    Run {
        /// Bytecode file (.vbc)
        file: PathBuf,
        /// Arguments passed to the program
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Runtime configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Run on a dedicated VM thread
        #[arg(short, long)]
        threaded: bool,
        /// Number of frames to run (0 = until no work is pending)
        #[arg(short, long, default_value_t = 0)]
        frames: u64,
        /// Seconds per frame
        #[arg(long, default_value_t = 1.0 / 60.0)]
        dt: f64,
        /// Enable hot reload
        #[arg(long)]
        hot_reload: bool,
        /// Reload the file when it changes on disk (implies --hot-reload)
        #[arg(short, long)]
        watch: bool,
        /// Print a static field after the run, as Class.field
        #[arg(short, long = "print", value_name = "CLASS.FIELD")]
        print: Vec<String>,
    },

    /// Show the contents of a bytecode file
    Inspect {
        /// Bytecode file (.vbc)
        file: PathBuf,
        /// Disassemble function bodies
        #[arg(short, long)]
        code: bool,
    },

    /// Write a small demo module
    Demo {
        /// Output file
        #[arg(default_value = "demo.vbc")]
        output: PathBuf,
    },

    /// Display version and environment info
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            args,
            config,
            threaded,
            frames,
            dt,
            hot_reload,
            watch,
            print,
        } => commands::run::execute(commands::run::RunArgs {
            file,
            args,
            config,
            threaded,
            frames,
            dt,
            hot_reload,
            watch,
            print,
        }),
        Commands::Inspect { file, code } => {
            vessel_runtime::logging::init_logging("warn");
            commands::inspect::execute(&file, code)
        }
        Commands::Demo { output } => {
            vessel_runtime::logging::init_logging("warn");
            commands::demo::execute(&output)
        }
        Commands::Info => commands::info::execute(),
    }
}
