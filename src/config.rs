//! CLI surface and host-side configuration (backing-file defaults from the
//! design): flags and backing-file paths consumed by `System::new`.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "latte-hv", about = "Full-system emulator host for a heterogeneous SEC/APP console platform")]
pub struct Cli {
    /// Firmware ELF image to load and run.
    pub firmware: PathBuf,

    /// Start in the debugger instead of free-running.
    #[arg(long)]
    pub r#break: bool,

    /// Make SEC data aborts recoverable (guest-visible) instead of fatal.
    #[arg(long)]
    pub abort: bool,

    /// Silence chatty unknown-offset device logging.
    #[arg(long)]
    pub noprint: bool,

    /// Enable the IPC/syscall snoop trace.
    #[arg(long)]
    pub logsys: bool,

    #[arg(long, default_value = "slc_work.bin")]
    pub nand: PathBuf,
    #[arg(long, default_value = "slcspare_work.bin")]
    pub nand_spare: PathBuf,
    #[arg(long, default_value = "slccmpt_work.bin")]
    pub nand_compat: PathBuf,
    #[arg(long, default_value = "slccmptspare_work.bin")]
    pub nand_compat_spare: PathBuf,
    #[arg(long, default_value = "sd.bin")]
    pub sd: PathBuf,
    #[arg(long, default_value = "otp.bin")]
    pub otp: PathBuf,
    #[arg(long, default_value = "seeprom.bin")]
    pub seeprom: PathBuf,
    #[arg(long, default_value = "espresso_key.txt")]
    pub key: PathBuf,
}

/// The parameters `System::new` needs, independent of how they were
/// collected (CLI, tests building one in-process, etc).
#[derive(Debug, Clone)]
pub struct Config {
    pub firmware: PathBuf,
    pub start_in_debugger: bool,
    pub aborts_are_recoverable: bool,
    pub quiet_devices: bool,
    pub trace_syscalls: bool,
    pub nand: PathBuf,
    pub nand_spare: PathBuf,
    pub nand_compat: PathBuf,
    pub nand_compat_spare: PathBuf,
    pub sd: PathBuf,
    pub otp: PathBuf,
    pub seeprom: PathBuf,
    pub key: PathBuf,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            firmware: cli.firmware,
            start_in_debugger: cli.r#break,
            aborts_are_recoverable: cli.abort,
            quiet_devices: cli.noprint,
            trace_syscalls: cli.logsys,
            nand: cli.nand,
            nand_spare: cli.nand_spare,
            nand_compat: cli.nand_compat,
            nand_compat_spare: cli.nand_compat_spare,
            sd: cli.sd,
            otp: cli.otp,
            seeprom: cli.seeprom,
            key: cli.key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_expected_backing_file_names() {
        let cli = Cli::parse_from(["latte-hv", "firmware.elf"]);
        let config: Config = cli.into();
        assert_eq!(config.nand, PathBuf::from("slc_work.bin"));
        assert_eq!(config.nand_spare, PathBuf::from("slcspare_work.bin"));
        assert_eq!(config.nand_compat, PathBuf::from("slccmpt_work.bin"));
        assert_eq!(config.nand_compat_spare, PathBuf::from("slccmptspare_work.bin"));
        assert_eq!(config.key, PathBuf::from("espresso_key.txt"));
        assert!(!config.start_in_debugger);
        assert!(!config.trace_syscalls);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["latte-hv", "firmware.elf", "--break", "--logsys"]);
        let config: Config = cli.into();
        assert!(config.start_in_debugger);
        assert!(config.trace_syscalls);
        assert!(!config.aborts_are_recoverable);
    }
}
