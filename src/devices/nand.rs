//! NAND flash controller: eight independent banks plus one main bank, each
//! with its own address/data-buffer/ECC-buffer registers and command
//! register, dispatching on a command register whose low byte is the
//! opcode and whose MSB latches execution. Transfer-shape assertions are
//! kept as validation but surfaced as a fatal [`HvError::DeviceConfigViolation`]
//! instead of a panic.

use crate::devices::{unknown_read, unknown_write, Device};
use crate::error::HvError;
use crate::interrupts::{AggregatorHandle, Word};
use crate::memory::PhysMemHandle;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

const REG_CTRL: u32 = 0x00;
const REG_CONFIG: u32 = 0x04;
const REG_ADDR1: u32 = 0x08;
const REG_ADDR2: u32 = 0x0C;
const REG_DATABUF: u32 = 0x10;
const REG_ECCBUF: u32 = 0x14;

const REG_BANK: u32 = 0x18;
const REG_BANK_CONTROL: u32 = 0x30;
const REG_INT_MASK: u32 = 0x34;

/// Eight independently-addressable bank register blocks, each mirroring
/// the main bank's six-register shape.
const BANK_BLOCK_BASE: u32 = 0x40;
const BANK_BLOCK_STRIDE: u32 = 0x18;
const BANK_COUNT: usize = 8;
const BANK_BLOCK_END: u32 = BANK_BLOCK_BASE + BANK_BLOCK_STRIDE * BANK_COUNT as u32;

const CMD_EXEC: u32 = 1 << 31;
const CMD_IRQ_ENABLE: u32 = 1 << 30;

const PAGE_DATA_LEN: usize = 0x800;
const PAGE_SPARE_LEN: usize = 0x40;
const PAGE_FULL_LEN: usize = PAGE_DATA_LEN + PAGE_SPARE_LEN + 0x40; // data + spare + ECC copy

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Opcode {
    Reset,
    InitRead,
    ReadPage,
    EraseInit,
    Erase,
    WritePage,
    WriteSpare,
    Identify,
}

fn decode(opcode: u32) -> Option<Opcode> {
    match opcode & 0xFF {
        0xFF => Some(Opcode::Reset),
        0x00 => Some(Opcode::InitRead),
        0x30 => Some(Opcode::ReadPage),
        0x60 => Some(Opcode::EraseInit),
        0x70 => Some(Opcode::Erase),
        0x80 => Some(Opcode::WritePage),
        0x85 => Some(Opcode::WriteSpare),
        0x90 => Some(Opcode::Identify),
        _ => None,
    }
}

/// One bank's own address/config/data-buffer/ECC-buffer/command registers;
/// the main bank and each of the eight addressable banks are each one of
/// these, read/written through the same six-register layout.
#[derive(Debug, Default, Clone, Copy)]
struct BankRegs {
    ctrl: u32,
    config: u32,
    addr: u64,
    databuf: u32,
    eccbuf: u32,
}

impl BankRegs {
    fn read(&self, offset: u32) -> Option<u32> {
        match offset {
            REG_CTRL => Some(self.ctrl),
            REG_CONFIG => Some(self.config),
            REG_ADDR1 => Some((self.addr & 0xFFFF_FFFF) as u32),
            REG_ADDR2 => Some((self.addr >> 32) as u32),
            REG_DATABUF => Some(self.databuf),
            REG_ECCBUF => Some(self.eccbuf),
            _ => None,
        }
    }

    /// Returns whether this write armed a command (`CMD_EXEC` set), and
    /// `None` if `offset` isn't one of this bank's six registers at all.
    fn write(&mut self, offset: u32, value: u32) -> Option<bool> {
        match offset {
            REG_CTRL => {
                self.ctrl = value;
                Some(value & CMD_EXEC != 0)
            }
            REG_CONFIG => {
                self.config = value;
                Some(false)
            }
            REG_ADDR1 => {
                self.addr = (self.addr & !0xFFFF_FFFF) | value as u64;
                Some(false)
            }
            REG_ADDR2 => {
                self.addr = (self.addr & 0xFFFF_FFFF) | ((value as u64) << 32);
                Some(false)
            }
            REG_DATABUF => {
                self.databuf = value;
                Some(false)
            }
            REG_ECCBUF => {
                self.eccbuf = value;
                Some(false)
            }
            _ => None,
        }
    }
}

struct BankImages {
    data: Option<File>,
    spare: Option<File>,
}

impl BankImages {
    fn none() -> Self {
        Self { data: None, spare: None }
    }
}

pub struct NandController {
    main: BankRegs,
    banks: [BankRegs; BANK_COUNT],
    bank_select: u32,
    bank_control: u32,
    int_mask: u32,
    native: BankImages,
    compat: BankImages,
    chip_id: [u8; 2],
    phys: PhysMemHandle,
    irq: AggregatorHandle,
    irq_word: Word,
    irq_bit: u8,
    fault: Option<HvError>,
}

impl NandController {
    pub fn new(phys: PhysMemHandle, irq: AggregatorHandle, irq_word: Word, irq_bit: u8, chip_id: [u8; 2]) -> Self {
        Self {
            main: BankRegs::default(),
            banks: [BankRegs::default(); BANK_COUNT],
            bank_select: 0,
            bank_control: 0,
            int_mask: 0,
            native: BankImages::none(),
            compat: BankImages::none(),
            chip_id,
            phys,
            irq,
            irq_word,
            irq_bit,
            fault: None,
        }
    }

    pub fn set_native_images(&mut self, data: File, spare: File) {
        self.native = BankImages { data: Some(data), spare: Some(spare) };
    }

    pub fn set_compat_images(&mut self, data: File, spare: File) {
        self.compat = BankImages { data: Some(data), spare: Some(spare) };
    }

    fn is_compat(&self) -> bool {
        self.bank_select & 0x2 != 0
    }

    fn images(&mut self) -> &mut BankImages {
        if self.is_compat() {
            &mut self.compat
        } else {
            &mut self.native
        }
    }

    fn page_number(addr: u64) -> u64 {
        addr >> 12
    }

    fn fail(&mut self, detail: impl Into<String>) {
        self.fault = Some(HvError::DeviceConfigViolation { device: "nand", detail: detail.into() });
    }

    fn read_page(&mut self, regs: BankRegs, spare_only: bool) {
        let page = Self::page_number(regs.addr);
        let (data_len, spare_len) = if spare_only { (0, PAGE_SPARE_LEN) } else { (PAGE_DATA_LEN, PAGE_FULL_LEN - PAGE_DATA_LEN) };
        let databuf = regs.databuf;
        let eccbuf = regs.eccbuf;
        let images = self.images();

        if !spare_only {
            if let Some(file) = images.data.as_mut() {
                let mut buf = vec![0u8; data_len];
                if file.seek(SeekFrom::Start(page * PAGE_DATA_LEN as u64)).and_then(|_| file.read_exact(&mut buf)).is_err() {
                    buf.fill(0xFF);
                }
                let _ = self.phys.borrow_mut().write_bytes(databuf, &buf);
            }
        }
        if let Some(file) = images.spare.as_mut() {
            let mut buf = vec![0u8; spare_len];
            if file.seek(SeekFrom::Start(page * PAGE_SPARE_LEN as u64)).and_then(|_| file.read_exact(&mut buf)).is_err() {
                buf.fill(0xFF);
            }
            let dst = if spare_only { databuf } else { eccbuf };
            let _ = self.phys.borrow_mut().write_bytes(dst, &buf);
        }
    }

    fn write_page_data(&mut self, regs: BankRegs) {
        let page = Self::page_number(regs.addr);
        let databuf = regs.databuf;
        let bytes = match self.phys.borrow().read_bytes(databuf, PAGE_DATA_LEN) {
            Ok(b) => b,
            Err(_) => {
                self.fail("write-page DMA source not mapped");
                return;
            }
        };
        let images = self.images();
        if let Some(file) = images.data.as_mut() {
            let _ = file.seek(SeekFrom::Start(page * PAGE_DATA_LEN as u64)).and_then(|_| file.write_all(&bytes));
        }
    }

    fn write_spare(&mut self, regs: BankRegs) {
        let page = Self::page_number(regs.addr);
        let databuf = regs.databuf;
        let bytes = match self.phys.borrow().read_bytes(databuf, PAGE_SPARE_LEN) {
            Ok(b) => b,
            Err(_) => {
                self.fail("write-spare DMA source not mapped");
                return;
            }
        };
        let images = self.images();
        if let Some(file) = images.spare.as_mut() {
            let _ = file.seek(SeekFrom::Start(page * PAGE_SPARE_LEN as u64)).and_then(|_| file.write_all(&bytes));
        }
    }

    fn erase(&mut self, regs: BankRegs) {
        let page = Self::page_number(regs.addr);
        let images = self.images();
        if let Some(file) = images.data.as_mut() {
            let _ = file.seek(SeekFrom::Start(page * PAGE_DATA_LEN as u64)).and_then(|_| file.write_all(&[0xFFu8; PAGE_DATA_LEN]));
        }
        if let Some(file) = images.spare.as_mut() {
            let _ = file.seek(SeekFrom::Start(page * PAGE_SPARE_LEN as u64)).and_then(|_| file.write_all(&[0xFFu8; PAGE_SPARE_LEN]));
        }
    }

    fn identify(&mut self, regs: BankRegs) {
        let databuf = regs.databuf;
        let _ = self.phys.borrow_mut().write_bytes(databuf, &self.chip_id);
    }

    /// Executes the command latched by a bank's own CTRL write. `bank_index`
    /// is `None` for the main bank, `Some(i)` for one of the eight
    /// addressable banks; both share the same opcode table and the same
    /// `native`/`compat` backing images, selected by the global `bank`
    /// register rather than per-bank state.
    fn execute(&mut self, regs: BankRegs, command: u32, bank_index: Option<u8>) {
        let Some(opcode) = decode(command) else {
            self.fail(format!("unsupported NAND opcode {:#04x} (bank {:?})", command & 0xFF, bank_index));
            return;
        };
        let spare_only = regs.config & 0x1 != 0;
        match opcode {
            Opcode::Reset | Opcode::InitRead | Opcode::EraseInit => {}
            Opcode::ReadPage => self.read_page(regs, spare_only),
            Opcode::Erase => self.erase(regs),
            Opcode::WritePage => self.write_page_data(regs),
            Opcode::WriteSpare => self.write_spare(regs),
            Opcode::Identify => self.identify(regs),
        }
        if self.fault.is_none() && command & CMD_IRQ_ENABLE != 0 {
            self.irq.borrow_mut().trigger(self.irq_word, self.irq_bit);
        }
    }
}

impl Device for NandController {
    fn read(&mut self, offset: u32) -> u32 {
        if let Some(value) = self.main.read(offset) {
            return value;
        }
        match offset {
            REG_BANK => self.bank_select,
            REG_BANK_CONTROL => self.bank_control,
            REG_INT_MASK => self.int_mask,
            _ if (BANK_BLOCK_BASE..BANK_BLOCK_END).contains(&offset) => {
                let rel = offset - BANK_BLOCK_BASE;
                let index = (rel / BANK_BLOCK_STRIDE) as usize;
                let local = rel % BANK_BLOCK_STRIDE;
                self.banks[index].read(local).unwrap_or_else(|| unknown_read(self.name(), offset))
            }
            _ => unknown_read(self.name(), offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        if let Some(armed) = self.main.write(offset, value) {
            if armed {
                let regs = self.main;
                self.execute(regs, value, None);
            }
            return;
        }
        match offset {
            REG_BANK => self.bank_select = value,
            REG_BANK_CONTROL => self.bank_control = value,
            REG_INT_MASK => self.int_mask = value,
            _ if (BANK_BLOCK_BASE..BANK_BLOCK_END).contains(&offset) => {
                let rel = offset - BANK_BLOCK_BASE;
                let index = (rel / BANK_BLOCK_STRIDE) as usize;
                let local = rel % BANK_BLOCK_STRIDE;
                match self.banks[index].write(local, value) {
                    Some(true) => {
                        let regs = self.banks[index];
                        self.execute(regs, value, Some(index as u8));
                    }
                    Some(false) => {}
                    None => unknown_write(self.name(), offset, value),
                }
            }
            _ => unknown_write(self.name(), offset, value),
        }
    }

    fn name(&self) -> &'static str {
        "nand"
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
    use std::rc::Rc;
    use tempfile::tempfile;

    fn controller() -> NandController {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x10000);
        let agg = Rc::new(RefCell::new(InterruptAggregator::new()));
        NandController::new(phys, agg, Word::All, 0, [0xEC, 0xD3])
    }

    #[test]
    fn unsupported_opcode_is_a_fatal_device_config_violation() {
        let mut nand = controller();
        nand.write(REG_CTRL, CMD_EXEC | 0x77);
        assert!(matches!(nand.take_fault(), Some(HvError::DeviceConfigViolation { device: "nand", .. })));
    }

    #[test]
    fn identify_writes_chip_id_to_databuf() {
        let mut nand = controller();
        nand.write(REG_DATABUF, 0x100);
        nand.write(REG_CTRL, CMD_EXEC | 0x90);
        assert_eq!(nand.phys.borrow().read_bytes(0x100, 2).unwrap(), vec![0xEC, 0xD3]);
    }

    #[test]
    fn erase_then_read_returns_all_ff() {
        let mut nand = controller();
        let data_file = tempfile().unwrap();
        let spare_file = tempfile().unwrap();
        nand.set_native_images(data_file, spare_file);
        nand.write(REG_DATABUF, 0x100);
        nand.write(REG_ECCBUF, 0x900);
        nand.write(REG_CTRL, CMD_EXEC | 0x70); // erase
        nand.write(REG_CTRL, CMD_EXEC | 0x30); // read-page
        let page = nand.phys.borrow().read_bytes(0x100, PAGE_DATA_LEN).unwrap();
        assert!(page.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn per_bank_register_block_is_independently_addressable() {
        let mut nand = controller();
        // Bank 3's own DATABUF/CTRL, distinct from the main bank's.
        let bank3_base = BANK_BLOCK_BASE + 3 * BANK_BLOCK_STRIDE;
        nand.write(bank3_base + REG_DATABUF, 0x200);
        nand.write(bank3_base + REG_CTRL, CMD_EXEC | 0x90); // identify
        assert_eq!(nand.phys.borrow().read_bytes(0x200, 2).unwrap(), vec![0xEC, 0xD3]);
        // The main bank's own DATABUF is untouched by bank 3's write.
        assert_eq!(nand.read(REG_DATABUF), 0);
    }

    #[test]
    fn bank_control_and_int_mask_registers_are_reachable() {
        let mut nand = controller();
        nand.write(REG_BANK_CONTROL, 0xAAAA);
        nand.write(REG_INT_MASK, 0x5555);
        assert_eq!(nand.read(REG_BANK_CONTROL), 0xAAAA);
        assert_eq!(nand.read(REG_INT_MASK), 0x5555);
    }
}
