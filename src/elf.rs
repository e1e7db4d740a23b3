//! Minimal ELF32/64 program-header reader. An external ELF loader is an
//! external collaborator, but this crate ships a small fallback so it is
//! runnable end to end without one. Reads only what `System::load_elf`
//! needs: the entry point and the `PT_LOAD` segments.

use crate::error::HvError;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS32: u8 = 1;
const CLASS64: u8 = 2;
const DATA_LE: u8 = 1;
const DATA_BE: u8 = 2;
const PT_LOAD: u32 = 1;

/// One `PT_LOAD` segment: where it lives in the file and where it belongs
/// in the guest's physical address space.
#[derive(Debug, Clone)]
pub struct Segment {
    pub file_offset: usize,
    pub file_size: usize,
    pub phys_addr: u32,
    pub mem_size: usize,
}

#[derive(Debug, Clone)]
pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<Segment>,
}

fn read_u32(data: &[u8], offset: usize, big_endian: bool) -> Result<u32, HvError> {
    let bytes = data.get(offset..offset + 4).ok_or_else(|| truncated())?;
    Ok(if big_endian { BigEndian::read_u32(bytes) } else { LittleEndian::read_u32(bytes) })
}

fn read_u64(data: &[u8], offset: usize, big_endian: bool) -> Result<u64, HvError> {
    let bytes = data.get(offset..offset + 8).ok_or_else(|| truncated())?;
    Ok(if big_endian { BigEndian::read_u64(bytes) } else { LittleEndian::read_u64(bytes) })
}

fn read_u16(data: &[u8], offset: usize, big_endian: bool) -> Result<u16, HvError> {
    let bytes = data.get(offset..offset + 2).ok_or_else(|| truncated())?;
    Ok(if big_endian { BigEndian::read_u16(bytes) } else { LittleEndian::read_u16(bytes) })
}

fn truncated() -> HvError {
    HvError::DeviceConfigViolation { device: "elf", detail: "truncated ELF header".into() }
}

impl ElfImage {
    /// Parses an ELF32 or ELF64 image, big- or little-endian. Only the
    /// fields needed to seed physical memory and the entry point are read;
    /// section headers, symbol tables, and relocations are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, HvError> {
        if data.len() < 20 || data[0..4] != MAGIC {
            return Err(HvError::DeviceConfigViolation { device: "elf", detail: "missing ELF magic".into() });
        }
        let class = data[4];
        let data_encoding = data[5];
        let big_endian = match data_encoding {
            DATA_LE => false,
            DATA_BE => true,
            other => {
                return Err(HvError::DeviceConfigViolation { device: "elf", detail: format!("unknown data encoding {other}") })
            }
        };

        let (entry, phoff, phentsize, phnum) = match class {
            CLASS32 => {
                let entry = read_u32(data, 0x18, big_endian)?;
                let phoff = read_u32(data, 0x1C, big_endian)? as u64;
                let phentsize = read_u16(data, 0x2A, big_endian)?;
                let phnum = read_u16(data, 0x2C, big_endian)?;
                (entry as u64, phoff, phentsize, phnum)
            }
            CLASS64 => {
                let entry = read_u64(data, 0x18, big_endian)?;
                let phoff = read_u64(data, 0x20, big_endian)?;
                let phentsize = read_u16(data, 0x36, big_endian)?;
                let phnum = read_u16(data, 0x38, big_endian)?;
                (entry, phoff, phentsize, phnum)
            }
            other => return Err(HvError::DeviceConfigViolation { device: "elf", detail: format!("unknown class {other}") }),
        };

        let mut segments = Vec::new();
        for i in 0..phnum as u64 {
            let base = (phoff + i * phentsize as u64) as usize;
            let p_type = read_u32(data, base, big_endian)?;
            if p_type != PT_LOAD {
                continue;
            }
            let segment = match class {
                CLASS32 => Segment {
                    file_offset: read_u32(data, base + 0x04, big_endian)? as usize,
                    phys_addr: read_u32(data, base + 0x0C, big_endian)?,
                    file_size: read_u32(data, base + 0x10, big_endian)? as usize,
                    mem_size: read_u32(data, base + 0x14, big_endian)? as usize,
                },
                CLASS64 => Segment {
                    file_offset: read_u64(data, base + 0x08, big_endian)? as usize,
                    phys_addr: read_u64(data, base + 0x10, big_endian)? as u32,
                    file_size: read_u64(data, base + 0x20, big_endian)? as usize,
                    mem_size: read_u64(data, base + 0x28, big_endian)? as usize,
                },
                _ => unreachable!(),
            };
            segments.push(segment);
        }

        Ok(ElfImage { entry: entry as u32, segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_elf32_be(entry: u32, segment_data: &[u8], phys_addr: u32) -> Vec<u8> {
        let phoff = 0x34u32;
        let phentsize = 0x20u16;
        let data_offset = phoff as usize + phentsize as usize;
        let mut buf = vec![0u8; data_offset + segment_data.len()];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = CLASS32;
        buf[5] = DATA_BE;
        BigEndian::write_u32(&mut buf[0x18..0x1C], entry);
        BigEndian::write_u32(&mut buf[0x1C..0x20], phoff);
        BigEndian::write_u16(&mut buf[0x2A..0x2C], phentsize);
        BigEndian::write_u16(&mut buf[0x2C..0x2E], 1);
        let ph = phoff as usize;
        BigEndian::write_u32(&mut buf[ph..ph + 4], PT_LOAD);
        BigEndian::write_u32(&mut buf[ph + 4..ph + 8], data_offset as u32);
        BigEndian::write_u32(&mut buf[ph + 0x0C..ph + 0x10], phys_addr);
        BigEndian::write_u32(&mut buf[ph + 0x10..ph + 0x14], segment_data.len() as u32);
        BigEndian::write_u32(&mut buf[ph + 0x14..ph + 0x18], segment_data.len() as u32);
        buf[data_offset..].copy_from_slice(segment_data);
        buf
    }

    #[test]
    fn parses_entry_and_single_load_segment() {
        let image = build_elf32_be(0xFFF0_0100, b"hello world", 0x0800_0100);
        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.entry, 0xFFF0_0100);
        assert_eq!(elf.segments.len(), 1);
        assert_eq!(elf.segments[0].phys_addr, 0x0800_0100);
        assert_eq!(elf.segments[0].file_size, 11);
    }

    #[test]
    fn rejects_missing_magic() {
        let err = ElfImage::parse(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, HvError::DeviceConfigViolation { .. }));
    }
}
