//! OTP (one-time-programmable fuse) controller: 8 banks of 32
//! big-endian words, exposed through a command/data register pair.

use crate::devices::{unknown_read, unknown_write, Device};
use crate::error::HvError;
use byteorder::{BigEndian, ByteOrder};

const REG_COMMAND: u32 = 0x00;
const REG_DATA: u32 = 0x04;

const COMMAND_START: u32 = 1 << 31;

pub struct Otp {
    words: [u32; 256],
    out: u32,
}

impl Otp {
    pub fn new() -> Self {
        Self { words: [0; 256], out: 0 }
    }

    /// Loads a 1 KiB big-endian image: 8 banks of 32 words each.
    pub fn load(bytes: &[u8]) -> Result<Self, HvError> {
        if bytes.len() != 1024 {
            return Err(HvError::DeviceConfigViolation {
                device: "otp",
                detail: format!("expected a 1024-byte image, got {}", bytes.len()),
            });
        }
        let mut words = [0u32; 256];
        BigEndian::read_u32_into(bytes, &mut words);
        Ok(Self { words, out: 0 })
    }
}

impl Default for Otp {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Otp {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            REG_DATA => self.out,
            _ => unknown_read(self.name(), offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match offset {
            REG_COMMAND => {
                if value & COMMAND_START != 0 {
                    let addr = (value & 0xFF) as usize;
                    self.out = self.words[addr];
                }
            }
            _ => unknown_write(self.name(), offset, value),
        }
    }

    fn name(&self) -> &'static str {
        "otp"
    }
}
