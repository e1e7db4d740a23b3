//! The physical memory fabric: RAM ranges backed by a byte buffer,
//! and MMIO "special" windows backed by a [`Device`](crate::devices::Device).
//!
//! Lookup is linear over a small number of entries (<20 in practice); ranges
//! and specials never overlap.

pub mod helper;

use crate::devices::Device;
use crate::error::HvError;
use std::cell::RefCell;
use std::rc::Rc;

/// Byte order a caller wants an MMIO register packed/unpacked in. RAM ranges
/// are raw bytes and ignore this; only [`Special`] windows consult it, since
/// the same register is visible to both the little-endian SEC core and the
/// big-endian APP cores.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    fn pack(self, value: u32, len: usize) -> Vec<u8> {
        let be = value.to_be_bytes();
        let le = value.to_le_bytes();
        match (self, len) {
            (Endian::Big, 4) => be.to_vec(),
            (Endian::Big, 2) => be[2..4].to_vec(),
            (Endian::Little, 4) => le.to_vec(),
            (Endian::Little, 2) => le[0..2].to_vec(),
            _ => unreachable!("MMIO accesses are always 2- or 4-byte aligned"),
        }
    }
    fn unpack(self, bytes: &[u8]) -> u32 {
        match (self, bytes.len()) {
            (Endian::Big, 4) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (Endian::Big, 2) => u32::from(u16::from_be_bytes([bytes[0], bytes[1]])),
            (Endian::Little, 4) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (Endian::Little, 2) => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            _ => unreachable!("MMIO accesses are always 2- or 4-byte aligned"),
        }
    }
}

struct Range {
    base: u32,
    len: u32,
    data: Vec<u8>,
}

struct Special {
    base: u32,
    len: u32,
    device: Rc<RefCell<dyn Device>>,
}

pub struct PhysicalMemory {
    ranges: Vec<Range>,
    specials: Vec<Special>,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self { ranges: Vec::new(), specials: Vec::new() }
    }

    /// Allocates a zero-initialised RAM range of `len` bytes at `base`.
    pub fn add_range(&mut self, base: u32, len: u32) {
        debug_assert!(!self.overlaps(base, len), "overlapping physical memory range at {base:#010x}");
        self.ranges.push(Range { base, len, data: vec![0; len as usize] });
    }

    /// Installs an MMIO window backed by `device`, whose `read`/`write` are
    /// called with an offset relative to `base`.
    pub fn add_special(&mut self, base: u32, len: u32, device: Rc<RefCell<dyn Device>>) {
        debug_assert!(!self.overlaps(base, len), "overlapping physical memory window at {base:#010x}");
        self.specials.push(Special { base, len, device });
    }

    fn overlaps(&self, base: u32, len: u32) -> bool {
        let end = base as u64 + len as u64;
        self.ranges
            .iter()
            .any(|r| (base as u64) < r.base as u64 + r.len as u64 && (r.base as u64) < end)
            || self
                .specials
                .iter()
                .any(|s| (base as u64) < s.base as u64 + s.len as u64 && (s.base as u64) < end)
    }

    /// Reads `len` bytes at `addr`. Specials are consulted before ranges.
    /// No access may straddle the boundary of the range/window that covers
    /// its start address — that is a programming error in the caller.
    pub fn read(&self, addr: u32, len: usize, endian: Endian) -> Result<Vec<u8>, HvError> {
        let end = addr as u64 + len as u64;
        for s in &self.specials {
            if (addr as u64) >= s.base as u64 && end <= s.base as u64 + s.len as u64 {
                let offset = addr - s.base;
                let value = s.device.borrow_mut().read(offset);
                return Ok(endian.pack(value, len));
            }
        }
        for r in &self.ranges {
            if (addr as u64) >= r.base as u64 && end <= r.base as u64 + r.len as u64 {
                let start = (addr - r.base) as usize;
                return Ok(r.data[start..start + len].to_vec());
            }
        }
        Err(HvError::UnmappedAccess { addr, len })
    }

    pub fn write(&mut self, addr: u32, bytes: &[u8], endian: Endian) -> Result<(), HvError> {
        let len = bytes.len();
        let end = addr as u64 + len as u64;
        for s in &mut self.specials {
            if (addr as u64) >= s.base as u64 && end <= s.base as u64 + s.len as u64 {
                let offset = addr - s.base;
                let value = endian.unpack(bytes);
                let mut device = s.device.borrow_mut();
                device.write(offset, value);
                if let Some(err) = device.take_fault() {
                    return Err(err);
                }
                return Ok(());
            }
        }
        for r in &mut self.ranges {
            if (addr as u64) >= r.base as u64 && end <= r.base as u64 + r.len as u64 {
                let start = (addr - r.base) as usize;
                r.data[start..start + len].copy_from_slice(bytes);
                return Ok(());
            }
        }
        Err(HvError::UnmappedAccess { addr, len })
    }

    /// Convenience used by devices performing bulk DMA-style transfers
    /// (NAND page reads, AES/SHA block streaming, AHCI PRDT scatter-gather):
    /// reads raw RAM bytes directly, since DMA payloads are opaque byte
    /// streams with no single accessing core's endianness to honour.
    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, HvError> {
        let end = addr as u64 + len as u64;
        for r in &self.ranges {
            if (addr as u64) >= r.base as u64 && end <= r.base as u64 + r.len as u64 {
                let start = (addr - r.base) as usize;
                return Ok(r.data[start..start + len].to_vec());
            }
        }
        Err(HvError::UnmappedAccess { addr, len })
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), HvError> {
        let len = data.len();
        let end = addr as u64 + len as u64;
        for r in &mut self.ranges {
            if (addr as u64) >= r.base as u64 && end <= r.base as u64 + r.len as u64 {
                let start = (addr - r.base) as usize;
                r.data[start..start + len].copy_from_slice(data);
                return Ok(());
            }
        }
        Err(HvError::UnmappedAccess { addr, len })
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

pub type PhysMemHandle = Rc<RefCell<PhysicalMemory>>;
