//! AES engine: two independent instances at 0xD020000 and
//! 0xD180000, differing only in which IRQ line they raise.

use crate::crypto::AesCbc;
use crate::devices::{unknown_read, unknown_write, Device};
use crate::error::HvError;
use crate::interrupts::{AggregatorHandle, Word};
use crate::memory::PhysMemHandle;

const REG_CTRL: u32 = 0x00;
const REG_SRC: u32 = 0x04;
const REG_DST: u32 = 0x08;
const REG_KEY0: u32 = 0x10;
const REG_IV0: u32 = 0x20;

const CTRL_START: u32 = 1 << 31;
const CTRL_IRQ_ENABLE: u32 = 1 << 30;
const CTRL_CHAIN_CONTINUE: u32 = 1 << 12;
const CTRL_DECRYPT: u32 = 1 << 28;
const CTRL_BLOCKS_MASK: u32 = 0xFFF;

pub struct AesEngine {
    ctrl: u32,
    src: u32,
    dst: u32,
    key: [u8; 16],
    iv: [u8; 16],
    phys: PhysMemHandle,
    irq: AggregatorHandle,
    irq_word: Word,
    irq_bit: u8,
    cipher: Box<dyn AesCbc>,
    fault: Option<HvError>,
}

impl AesEngine {
    pub fn new(phys: PhysMemHandle, irq: AggregatorHandle, irq_word: Word, irq_bit: u8, cipher: Box<dyn AesCbc>) -> Self {
        Self { ctrl: 0, src: 0, dst: 0, key: [0; 16], iv: [0; 16], phys, irq, irq_word, irq_bit, cipher, fault: None }
    }

    fn write_word_be(buf: &mut [u8; 16], slot: u32, value: u32) {
        let idx = (slot as usize) * 4;
        buf[idx..idx + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn start(&mut self, ctrl: u32) {
        if ctrl & CTRL_CHAIN_CONTINUE != 0 {
            // Open question, resolved: unimplemented, fatal.
            self.fault = Some(HvError::DeviceConfigViolation {
                device: "aes",
                detail: "chain-continue is not implemented".to_string(),
            });
            return;
        }
        let blocks = (ctrl & CTRL_BLOCKS_MASK) + 1;
        let len = (blocks as usize) * 16;
        let bytes = match self.phys.borrow().read_bytes(self.src, len) {
            Ok(b) => b,
            Err(e) => {
                self.fault = Some(e);
                return;
            }
        };

        let mut iv = self.iv;
        let mut out = Vec::with_capacity(len);
        for chunk in bytes.chunks_exact(16) {
            let mut block = [0u8; 16];
            block.copy_from_slice(chunk);
            let result = if ctrl & CTRL_DECRYPT != 0 {
                self.cipher.decrypt_block(&self.key, &mut iv, &block)
            } else {
                self.cipher.encrypt_block(&self.key, &mut iv, &block)
            };
            out.extend_from_slice(&result);
        }

        if let Err(e) = self.phys.borrow_mut().write_bytes(self.dst, &out) {
            self.fault = Some(e);
            return;
        }

        if ctrl & CTRL_IRQ_ENABLE != 0 {
            self.irq.borrow_mut().trigger(self.irq_word, self.irq_bit);
        }
    }
}

impl Device for AesEngine {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            REG_CTRL => self.ctrl,
            REG_SRC => self.src,
            REG_DST => self.dst,
            _ => unknown_read(self.name(), offset),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match offset {
            REG_CTRL => {
                self.ctrl = value;
                if value & CTRL_START != 0 {
                    self.start(value);
                }
            }
            REG_SRC => self.src = value,
            REG_DST => self.dst = value,
            REG_KEY0..=0x1C => Self::write_word_be(&mut self.key, (offset - REG_KEY0) / 4, value),
            REG_IV0..=0x2C => Self::write_word_be(&mut self.iv, (offset - REG_IV0) / 4, value),
            _ => unknown_write(self.name(), offset, value),
        }
    }

    fn name(&self) -> &'static str {
        "aes"
    }

    fn take_fault(&mut self) -> Option<HvError> {
        self.fault.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareAes;
    use crate::interrupts::InterruptAggregator;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn aes_engine_seed_scenario() {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x1000);
        phys.borrow_mut().write_bytes(0x100, b"YELLOW SUBMARINE").unwrap();
        let agg = Rc::new(RefCell::new(InterruptAggregator::new()));
        let mut aes = AesEngine::new(phys.clone(), agg, Word::All, 0, Box::new(SoftwareAes));
        aes.write(REG_SRC, 0x100);
        aes.write(REG_DST, 0x200);
        aes.write(REG_CTRL, CTRL_START); // encrypt, 1 block, zero key/iv
        assert!(aes.take_fault().is_none());
        let cipher = phys.borrow().read_bytes(0x200, 16).unwrap();
        let mut iv = [0u8; 16];
        let expected = SoftwareAes.encrypt_block(&[0; 16], &mut iv, b"YELLOW SUBMARINE");
        assert_eq!(cipher, expected);
    }

    #[test]
    fn chain_continue_is_fatal() {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x1000);
        let agg = Rc::new(RefCell::new(InterruptAggregator::new()));
        let mut aes = AesEngine::new(phys, agg, Word::All, 0, Box::new(SoftwareAes));
        aes.write(REG_CTRL, CTRL_START | CTRL_CHAIN_CONTINUE);
        assert!(matches!(aes.take_fault(), Some(HvError::DeviceConfigViolation { device: "aes", .. })));
    }
}
