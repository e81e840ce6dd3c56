//! Command-line front end
//!
//! Builds a machine from flags, runs it to a target mcycle, and can emit
//! a proof-carrying single-step log and check it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use veriscv::access::LogType;
use veriscv::{FlashConfig, Machine, MachineConfig, RunStatus};

#[derive(Parser)]
#[command(name = "veriscv", about = "Verifiable RISC-V 64 machine emulator")]
struct Cli {
    /// Boot image loaded at the start of RAM.
    boot_image: PathBuf,

    /// RAM size in MiB.
    #[arg(long, default_value_t = 64)]
    memory: u64,

    /// Kernel command line.
    #[arg(long, default_value = "")]
    cmdline: String,

    /// Attach the terminal to the HTIF console.
    #[arg(long)]
    interactive: bool,

    /// Stop when mcycle reaches this value.
    #[arg(long, default_value_t = u64::MAX)]
    max_mcycle: u64,

    /// Flash drive spec `start:length:path[:shared]`; may repeat.
    #[arg(long = "flash")]
    flash: Vec<String>,

    /// After the run, log one step with proofs, verify it, and write the
    /// serialized log here.
    #[arg(long)]
    step_log: Option<PathBuf>,

    /// Print the Merkle root before and after the run.
    #[arg(long)]
    root_hash: bool,
}

fn parse_flash(spec: &str) -> Result<FlashConfig, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!("bad flash spec `{spec}` (want start:length:path[:shared])"));
    }
    let parse_num = |s: &str| -> Result<u64, String> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
        } else {
            s.parse().map_err(|e: std::num::ParseIntError| e.to_string())
        }
    };
    Ok(FlashConfig {
        start: parse_num(parts[0])?,
        length: parse_num(parts[1])?,
        backing: PathBuf::from(parts[2]),
        label: PathBuf::from(parts[2])
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flash".into()),
        shared: parts.get(3).is_some_and(|s| *s == "shared"),
    })
}

fn hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = MachineConfig::new(cli.memory << 20);
    config.cmdline = cli.cmdline.clone();
    config.interactive = cli.interactive;
    for spec in &cli.flash {
        match parse_flash(spec) {
            Ok(flash) => config.flash.push(flash),
            Err(err) => {
                error!("{err}");
                return ExitCode::FAILURE;
            }
        }
    }
    let config = match config.load_boot_image(&cli.boot_image) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut machine = match Machine::new(config) {
        Ok(machine) => machine,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.root_hash {
        println!("root before: {}", hex(&machine.root_hash()));
    }

    let status = machine.run(cli.max_mcycle);
    match status {
        RunStatus::Halted => info!(mcycle = machine.read_mcycle(), "machine halted"),
        RunStatus::Yielded => info!(mcycle = machine.read_mcycle(), "machine yielded"),
        RunStatus::Done => info!(mcycle = machine.read_mcycle(), "cycle target reached"),
    }

    if let Some(path) = &cli.step_log {
        if machine.halted() {
            error!("cannot step a halted machine");
            return ExitCode::FAILURE;
        }
        let log = machine.step(LogType::full());
        match Machine::verify_access_log(&log, true) {
            Ok(final_root) => {
                info!(accesses = log.accesses.len(), "step log verified");
                println!("step-log root: {}", hex(&final_root));
            }
            Err(err) => {
                error!("step log failed verification: {err}");
                return ExitCode::FAILURE;
            }
        }
        let bytes = match bincode::serialize(&log) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("cannot serialize log: {err}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(err) = std::fs::write(path, bytes) {
            error!("cannot write {}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    }

    if cli.root_hash {
        println!("root after: {}", hex(&machine.root_hash()));
    }

    ExitCode::SUCCESS
}
