//! SDIO/MMC controller: a simplified command state machine
//! over a backing block-image file.

use crate::devices::{unknown_read, unknown_write, Device};
use crate::error::HvError;
use crate::interrupts::{AggregatorHandle, Word};
use crate::memory::PhysMemHandle;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

const REG_CMD: u32 = 0x00;
const REG_ARG: u32 = 0x04;
const REG_RESP0: u32 = 0x08;
const REG_BLOCKLEN: u32 = 0x18;
const REG_BLOCKCOUNT: u32 = 0x1C;
const REG_DMAADDR: u32 = 0x20;
const REG_STATUS: u32 = 0x24;

const STATUS_CMD_DONE: u32 = 1 << 0;

// Fixed CSD words returned for CMD9 (arbitrary but stable constants; the
// guest only inspects capacity-class fields this model does not vary).
const FIXED_CSD: [u32; 4] = [0x0026_8032, 0x5F59_83B2, 0x80FF_FF7F, 0x0A40_4000];

pub struct SdioController {
    cmd: u32,
    arg: u32,
    resp: [u32; 4],
    rca: u32,
    block_len: u32,
    block_count: u32,
    app_cmd_latched: bool,
    dma_addr: u32,
    status: u32,
    backing: Option<File>,
    phys: PhysMemHandle,
    irq: AggregatorHandle,
    irq_word: Word,
    irq_bit: u8,
    fault: Option<HvError>,
}

impl SdioController {
    pub fn new(phys: PhysMemHandle, irq: AggregatorHandle, irq_word: Word, irq_bit: u8) -> Self {
        Self {
            cmd: 0,
            arg: 0,
            resp: [0; 4],
            rca: 0x1234,
            block_len: 512,
            block_count: 1,
            app_cmd_latched: false,
            dma_addr: 0,
            status: 0,
            backing: None,
            phys,
            irq,
            irq_word,
            irq_bit,
            fault: None,
        }
    }

    pub fn set_backing_file(&mut self, file: File) {
        self.backing = Some(file);
    }

    /// Sector addressing is always fixed at 512-byte units regardless of
    /// the mutable `BLOCKLEN` register: only the transfer size scales with
    /// `block_len`/`block_count`, matching the fixed `argument << 9` seek
    /// real hardware uses.
    fn sector_offset(&self) -> u64 {
        (self.arg as u64) << 9
    }

    fn read_blocks(&mut self, count: u32) {
        let Some(file) = self.backing.as_mut() else { return };
        let mut buf = vec![0u8; (self.block_len * count) as usize];
        let offset = self.sector_offset();
        if file.seek(SeekFrom::Start(offset)).and_then(|_| file.read_exact(&mut buf)).is_err() {
            buf.fill(0);
        }
        if let Err(e) = self.phys.borrow_mut().write_bytes(self.dma_addr, &buf) {
            self.fault = Some(e);
        }
    }

    fn write_blocks(&mut self, count: u32) {
        let len = (self.block_len * count) as usize;
        let buf = match self.phys.borrow().read_bytes(self.dma_addr, len) {
            Ok(b) => b,
            Err(e) => {
                self.fault = Some(e);
                return;
            }
        };
        if let Some(file) = self.backing.as_mut() {
            let offset = self.sector_offset();
            let _ = file.seek(SeekFrom::Start(offset)).and_then(|_| file.write_all(&buf));
        }
    }

    fn dispatch(&mut self, index: u32) {
        let is_app_cmd = self.app_cmd_latched;
        self.app_cmd_latched = false;
        self.resp = [0; 4];

        if is_app_cmd {
            match index {
                6 => {}                          // ACMD6: bus width, accepted and ignored
                41 => self.resp[0] = 0xC010_0000, // ACMD41: busy clear + high-capacity
                _ => unknown_write(self.name(), REG_CMD, index),
            }
        } else {
            match index {
                0 => {}
                1 => self.resp[0] = 0x8010_0000,
                3 => self.resp[0] = self.rca << 16,
                5 => self.resp[0] = 0,
                7 => {}
                8 => self.resp[0] = self.arg & 0xFFF,
                9 => self.resp = FIXED_CSD,
                13 => self.resp[0] = 0,
                16 => self.block_len = self.arg,
                17 => self.read_blocks(1),
                18 => self.read_blocks(self.block_count),
                25 => self.write_blocks(self.block_count),
                52 => self.resp[0] = 0,
                55 => self.app_cmd_latched = true,
                _ => unknown_write(self.name(), REG_CMD, index),
            }
        }

        self.status |= STATUS_CMD_DONE;
        self.irq.borrow_mut().trigger(self.irq_word, self.irq_bit);
    }
}

impl Device for SdioController {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            REG_CMD => self.cmd,
            REG_ARG => self.arg,
            REG_RESP0..=0x14 => self.resp[((offset - REG_RESP0) / 4) as usize],
            REG_BLOCKLEN => self.block_len,
            REG_BLOCKCOUNT => self.block_count,
            REG_DMAADDR => self.dma_addr,
            REG_STATUS => self.status,
            _ => unknown_read(self.name(), offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match offset {
            REG_CMD => {
                self.cmd = value;
                self.dispatch(value & 0x3F);
            }
            REG_ARG => self.arg = value,
            REG_BLOCKLEN => self.block_len = value,
            REG_BLOCKCOUNT => self.block_count = value,
            REG_DMAADDR => self.dma_addr = value,
            REG_STATUS => self.status &= !value,
            _ => unknown_write(self.name(), offset, value),
        }
    }

    fn name(&self) -> &'static str {
        "sdio"
    }

    fn take_fault(&mut self) -> Option<HvError> {
        self.fault.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::InterruptAggregator;
    use std::cell::RefCell;
    use std::io::Write as _;
    use std::rc::Rc;
    use tempfile::tempfile;

    #[test]
    fn cmd17_reads_a_block_from_the_backing_file() {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x1000);
        let agg = Rc::new(RefCell::new(InterruptAggregator::new()));
        let mut sd = SdioController::new(phys.clone(), agg, Word::All, 0);
        let mut file = tempfile().unwrap();
        file.write_all(&[0x5Au8; 512]).unwrap();
        sd.set_backing_file(file);
        sd.write(REG_BLOCKLEN, 512);
        sd.write(REG_DMAADDR, 0x100);
        sd.write(REG_ARG, 0);
        sd.write(REG_CMD, 17);
        let data = phys.borrow().read_bytes(0x100, 512).unwrap();
        assert!(data.iter().all(|&b| b == 0x5A));
        assert_eq!(sd.read(REG_STATUS) & STATUS_CMD_DONE, STATUS_CMD_DONE);
    }

    #[test]
    fn seek_offset_stays_at_the_fixed_512_byte_sector_size_after_cmd16() {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x1000);
        let agg = Rc::new(RefCell::new(InterruptAggregator::new()));
        let mut sd = SdioController::new(phys.clone(), agg, Word::All, 0);
        let mut file = tempfile().unwrap();
        let mut expected = vec![0u8; 4096];
        expected[512..512 + 4].copy_from_slice(&[1, 2, 3, 4]);
        file.write_all(&expected).unwrap();
        sd.set_backing_file(file);

        // CMD16 sets a non-512 BLOCKLEN; the seek offset for sector 1 must
        // still land at byte 512, not `1 * block_len`.
        sd.write(REG_ARG, 64);
        sd.write(REG_CMD, 16);
        sd.write(REG_ARG, 1);
        sd.write(REG_DMAADDR, 0x100);
        sd.write(REG_CMD, 17);
        let data = phys.borrow().read_bytes(0x100, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }
}
