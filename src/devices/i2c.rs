//! I²C master register shell. Real hardware bit-bangs SDA/SCL
//! through GPIO group 2 to reach an EEPROM and an audio/video codec; this
//! crate implements the register surface and the interrupt line only, with
//! no codec model (out of scope).

use crate::devices::{unknown_read, unknown_write, Device};

const REG_CONTROL: u32 = 0x00;
const REG_DATA: u32 = 0x04;
const REG_INTERRUPT: u32 = 0x08;

const INTERRUPT_ENABLE: u32 = 1 << 1;
const INTERRUPT_PENDING: u32 = 1 << 0;

pub struct I2cMaster {
    control: u32,
    data: u32,
    interrupt: u32,
}

impl I2cMaster {
    pub fn new() -> Self {
        Self { control: 0, data: 0, interrupt: 0 }
    }

    pub fn has_pending_interrupt(&self) -> bool {
        self.interrupt & INTERRUPT_ENABLE != 0 && self.interrupt & INTERRUPT_PENDING != 0
    }
}

impl Default for I2cMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for I2cMaster {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            REG_CONTROL => self.control,
            REG_DATA => self.data,
            REG_INTERRUPT => self.interrupt,
            _ => unknown_read(self.name(), offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match offset {
            REG_CONTROL => {
                self.control = value;
                // A transfer completes synchronously in this model (
                // long-running device operations appear instantaneous).
                self.interrupt |= INTERRUPT_PENDING;
            }
            REG_DATA => self.data = value,
            REG_INTERRUPT => {
                // bit0 is write-one-to-clear, bit1 (enable) is set directly.
                self.interrupt &= !(value & INTERRUPT_PENDING);
                self.interrupt = (self.interrupt & !INTERRUPT_ENABLE) | (value & INTERRUPT_ENABLE);
            }
            _ => unknown_write(self.name(), offset, value),
        }
    }

    fn name(&self) -> &'static str {
        "i2c"
    }
}
