use thiserror::Error;

/// Every fault and fatal condition the core can raise.
#[derive(Debug, Error)]
pub enum HvError {
    #[error("unmapped physical access at {addr:#010x} (len {len})")]
    UnmappedAccess { addr: u32, len: usize },

    #[error("unaligned MMIO access at {addr:#010x} (len {len})")]
    UnalignedAccess { addr: u32, len: usize },

    #[error("translation fault at {addr:#010x} (write={write})")]
    TranslationFault { addr: u32, write: bool },

    #[error("protection fault at {addr:#010x} (write={write})")]
    ProtectionFault { addr: u32, write: bool },

    #[error("undefined instruction {opcode:#010x} at {pc:#010x}")]
    UndefinedInstruction { pc: u32, opcode: u32 },

    #[error("software interrupt {number:#x} at {pc:#010x}")]
    SoftwareInterrupt { pc: u32, number: u32 },

    #[error("device configuration violation in {device}: {detail}")]
    DeviceConfigViolation { device: &'static str, detail: String },

    #[error("backing file I/O error ({path}): {source}")]
    BackingFileIo { path: String, #[source] source: std::io::Error },
}
