//! USB OHCI host controller: a root hub with one port, walking
//! the control/bulk endpoint-descriptor chains in guest memory and handing
//! transfer buffers to one synthetic USB device.

use crate::devices::{unknown_read, unknown_write, Device};
use crate::error::HvError;
use crate::interrupts::{AggregatorHandle, Word};
use crate::memory::PhysMemHandle;

const REG_CONTROL: u32 = 0x04;
const REG_CMD_STATUS: u32 = 0x08;
const REG_INT_STATUS: u32 = 0x0C;
const REG_INT_ENABLE: u32 = 0x10;
const REG_HCCA: u32 = 0x18;
const REG_CONTROL_HEAD_ED: u32 = 0x20;
const REG_BULK_HEAD_ED: u32 = 0x28;

const CMD_STATUS_CLF: u32 = 1 << 1; // control list filled
const CMD_STATUS_BLF: u32 = 1 << 2; // bulk list filled

const ED_SKIP: u32 = 1 << 14;
const TD_DIR_SETUP: u32 = 0;
const TD_DIR_OUT: u32 = 1;
const TD_DIR_IN: u32 = 2;

const HCCA_DONE_HEAD_OFFSET: u32 = 0x84;
const INT_WRITEBACK_DONE_HEAD: u32 = 1 << 1;

pub struct OhciController {
    control: u32,
    cmd_status: u32,
    int_status: u32,
    int_enable: u32,
    hcca: u32,
    control_head: u32,
    bulk_head: u32,
    done_head: u32,
    /// Open question: only port index 1 gates interrupt delivery on this
    /// platform; other indices are accepted as no-ops.
    port_index: u32,
    device_buffer: Vec<u8>,
    phys: PhysMemHandle,
    irq: AggregatorHandle,
    irq_word: Word,
    irq_bit: u8,
    fault: Option<HvError>,
}

impl OhciController {
    pub fn new(phys: PhysMemHandle, irq: AggregatorHandle, irq_word: Word, irq_bit: u8, port_index: u32) -> Self {
        Self {
            control: 0,
            cmd_status: 0,
            int_status: 0,
            int_enable: 0,
            hcca: 0,
            control_head: 0,
            bulk_head: 0,
            done_head: 0,
            port_index,
            device_buffer: Vec::new(),
            phys,
            irq,
            irq_word,
            irq_bit,
            fault: None,
        }
    }

    fn read_u32(&self, addr: u32) -> Result<u32, HvError> {
        let bytes = self.phys.borrow().read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), HvError> {
        self.phys.borrow_mut().write_bytes(addr, &value.to_le_bytes())
    }

    fn process_td(&mut self, td_addr: u32) -> Result<(), HvError> {
        let flags = self.read_u32(td_addr)?;
        let cbp = self.read_u32(td_addr + 4)?;
        let be = self.read_u32(td_addr + 12)?;
        let direction = (flags >> 19) & 0x3;

        if cbp == 0 {
            return Ok(());
        }
        let size = (be - cbp + 1) as usize;
        match direction {
            TD_DIR_SETUP | TD_DIR_OUT => {
                let data = self.phys.borrow().read_bytes(cbp, size)?;
                self.device_buffer = data;
            }
            TD_DIR_IN => {
                let mut data = std::mem::take(&mut self.device_buffer);
                data.resize(size, 0);
                self.phys.borrow_mut().write_bytes(cbp, &data)?;
            }
            _ => {}
        }
        // Clear the condition-code bits (top nibble): transfer succeeded.
        self.write_u32(td_addr, flags & 0x0FFF_FFFF)
    }

    fn process_list(&mut self, head_ed: u32) -> Result<(), HvError> {
        let mut ed_addr = head_ed;
        while ed_addr != 0 {
            let flags = self.read_u32(ed_addr)?;
            let next_ed = self.read_u32(ed_addr + 12)?;
            if flags & ED_SKIP != 0 {
                ed_addr = next_ed;
                continue;
            }
            let tail = self.read_u32(ed_addr + 4)? & !0xF;
            let mut head = self.read_u32(ed_addr + 8)?;
            let halted = head & 0x1 != 0;
            let mut current = head & !0xF;
            if !halted {
                while current != 0 && current != tail {
                    let next_td = self.read_u32(current + 8)?;
                    self.process_td(current)?;
                    let done_entry = current;
                    self.write_u32(current + 8, self.done_head)?;
                    self.done_head = done_entry;
                    current = next_td;
                }
                head = (current & !0xF) | (head & 0xF);
                self.write_u32(ed_addr + 8, head)?;
            }
            ed_addr = next_ed;
        }
        Ok(())
    }

    fn run_lists(&mut self) -> Result<(), HvError> {
        if self.cmd_status & CMD_STATUS_CLF != 0 {
            self.process_list(self.control_head)?;
        }
        if self.cmd_status & CMD_STATUS_BLF != 0 {
            self.process_list(self.bulk_head)?;
        }
        if self.done_head != 0 && self.hcca != 0 {
            self.write_u32(self.hcca + HCCA_DONE_HEAD_OFFSET, self.done_head)?;
            self.done_head = 0;
            self.int_status |= INT_WRITEBACK_DONE_HEAD;
            if self.port_index == 1 && self.int_enable & INT_WRITEBACK_DONE_HEAD != 0 {
                self.irq.borrow_mut().trigger(self.irq_word, self.irq_bit);
            }
        }
        Ok(())
    }
}

impl Device for OhciController {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            REG_CONTROL => self.control,
            REG_CMD_STATUS => self.cmd_status,
            REG_INT_STATUS => self.int_status,
            REG_INT_ENABLE => self.int_enable,
            REG_HCCA => self.hcca,
            REG_CONTROL_HEAD_ED => self.control_head,
            REG_BULK_HEAD_ED => self.bulk_head,
            _ => unknown_read(self.name(), offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match offset {
            REG_CONTROL => self.control = value,
            REG_CMD_STATUS => {
                self.cmd_status = value;
                if let Err(e) = self.run_lists() {
                    self.fault = Some(e);
                }
            }
            REG_INT_STATUS => self.int_status &= !value,
            REG_INT_ENABLE => self.int_enable = value,
            REG_HCCA => self.hcca = value,
            REG_CONTROL_HEAD_ED => self.control_head = value,
            REG_BULK_HEAD_ED => self.bulk_head = value,
            _ => unknown_write(self.name(), offset, value),
        }
    }

    fn name(&self) -> &'static str {
        "ohci"
    }

    fn take_fault(&mut self) -> Option<HvError> {
        self.fault.take()
    }
}
