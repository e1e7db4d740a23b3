//! CLI entry point: wires a [`System`] from the parsed [`Config`], loads the
//! firmware image, and runs the scheduler. Actual CPU decode/interpretation
//! is supplied by an embedder through [`latte_hv::cpu::Interpreter`]; this
//! binary on its own demonstrates the host glue (memory, devices, interrupt
//! mesh) booting a firmware image without driving any instructions.

use clap::Parser;
use latte_hv::config::{Cli, Config};
use latte_hv::system::System;
use std::fs;
use std::process::ExitCode;

fn run(config: Config) -> Result<(), latte_hv::HvError> {
    let system = System::new(&config)?;

    let firmware = fs::read(&config.firmware).map_err(|source| latte_hv::HvError::BackingFileIo {
        path: config.firmware.display().to_string(),
        source,
    })?;
    let entry = system.load_elf(&firmware)?;
    log::info!("loaded {} entry={:#010x}", config.firmware.display(), entry);

    if let Ok(key_bytes) = fs::read(&config.key) {
        if let Some(key) = key_bytes.get(..16) {
            let mut key_arr = [0u8; 16];
            key_arr.copy_from_slice(key);
            match system.decrypt_app_entry(&key_arr) {
                Ok(resume) => log::info!("APP entry decrypted, resume={:#010x}", resume),
                Err(e) => log::warn!("APP entry decryption skipped: {e}"),
            }
        } else {
            log::warn!("{}: key file shorter than 16 bytes", config.key.display());
        }
    }

    if config.start_in_debugger {
        log::info!("--break requested; no interactive debugger is wired into this binary");
    }

    log::info!(
        "host glue ready: {} physical-memory ranges/windows wired, scheduler idle (no CpuCore attached)",
        "SEC + 3x APP"
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let config: Config = cli.into();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
