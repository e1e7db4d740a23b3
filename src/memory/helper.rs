//! Typed guest-memory accessor façade: a small, concretely-typed reader/
//! writer over a [`Translator`]. Used by the IPC snoop and by device models
//! that read/write guest-formatted structures (OHCI TD/ED chains, AHCI
//! command tables, NAND/AES/SHA DMA buffers).

use crate::error::HvError;
use crate::memory::PhysicalMemory;
use crate::mmu::Translator;

/// Reads/writes guest memory through a translator, for callers that see
/// virtual addresses (the IPC snoop, syscall argument capture). Device
/// models that only ever see physical DMA addresses use
/// [`PhysicalMemory::read_bytes`]/`write_bytes` directly instead.
pub struct MemoryAccess<'a> {
    phys: &'a PhysicalMemory,
    mmu: &'a dyn Translator,
}

impl<'a> MemoryAccess<'a> {
    pub fn new(phys: &'a PhysicalMemory, mmu: &'a dyn Translator) -> Self {
        Self { phys, mmu }
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, HvError> {
        let phys_addr = self.mmu.translate_data_read(addr)?;
        self.phys.read_bytes(phys_addr, len)
    }

    /// Reads a NUL-terminated ASCII/UTF-8 string starting at `addr`.
    pub fn read_cstr_utf8(&self, addr: u32) -> Result<String, HvError> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        loop {
            let byte = self.read_bytes(cursor, 1)?[0];
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.wrapping_add(1);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_u32_be(&self, addr: u32) -> Result<u32, HvError> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
