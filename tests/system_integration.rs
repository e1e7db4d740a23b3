//! End-to-end tests driving `System` the way an embedder would: build one
//! from a `Config`, poke its MMIO surface through the wired physical memory,
//! and load/decrypt firmware images the way `main` does.

use byteorder::{BigEndian, ByteOrder};
use latte_hv::config::{Cli, Config};
use latte_hv::crypto::{AesCbc, SoftwareAes};
use latte_hv::cpu::{Interpreter, Signal};
use latte_hv::memory::Endian;
use latte_hv::system::System;
use clap::Parser;
use std::cell::RefCell;
use std::rc::Rc;

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS32: u8 = 1;
const DATA_BE: u8 = 2;
const PT_LOAD: u32 = 1;

fn test_config(tmp: &tempfile::TempDir) -> Config {
    let cli = Cli::parse_from([
        "latte-hv",
        "firmware.elf",
        "--nand",
        tmp.path().join("slc.bin").to_str().unwrap(),
        "--nand-spare",
        tmp.path().join("slcspare.bin").to_str().unwrap(),
    ]);
    cli.into()
}

/// Builds a minimal big-endian ELF32 image with one `PT_LOAD` segment,
/// mirroring the wire format `System::load_elf` actually parses.
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
fn load_elf_seeds_physical_memory_at_the_segments_address() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let system = System::new(&config).unwrap();

    let image = build_elf32_be(0xFFF0_0100, b"boot stub payload", 0x0800_1000);
    let entry = system.load_elf(&image).unwrap();

    assert_eq!(entry, 0xFFF0_0100);
    let read_back = system.phys.borrow().read(0x0800_1000, 18, Endian::Big).unwrap();
    assert_eq!(read_back, b"boot stub payload");
}

#[test]
fn decrypt_app_entry_round_trips_through_wired_physical_memory() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let system = System::new(&config).unwrap();

    let key = [0x42u8; 16];
    let plaintext = b"APP0 entry point stub code.....!"; // 32 bytes, two blocks
    assert_eq!(plaintext.len() % 16, 0);

    let cipher = SoftwareAes;
    let mut iv = [0u8; 16];
    let mut ciphertext = Vec::with_capacity(plaintext.len());
    for chunk in plaintext.chunks(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        ciphertext.extend_from_slice(&cipher.encrypt_block(&key, &mut iv, &block));
    }

    {
        let mut mem = system.phys.borrow_mut();
        mem.write(0x0800_00AC, &(plaintext.len() as u32).to_be_bytes(), Endian::Big).unwrap();
        mem.write_bytes(0x0800_0100, &ciphertext).unwrap();
    }

    let resume = system.decrypt_app_entry(&key).unwrap();
    assert_eq!(resume, 0xFFF0_0100);

    let recovered = system.phys.borrow().read_bytes(0x0800_0100, plaintext.len()).unwrap();
    assert_eq!(recovered, plaintext);
}

#[test]
fn nand_identify_through_mmio_reaches_app_databuf_and_raises_irq() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let system = System::new(&config).unwrap();

    // Identify reads the chip-id bytes into whatever DMA buffer REG_DATABUF
    // points at; point it at a scratch address in MEM1.
    const NAND_BASE: u32 = 0xD01_0000;
    const REG_DATABUF: u32 = 0x10;
    const REG_CTRL: u32 = 0x00;
    const SCRATCH: u32 = 0x0010_0000;
    const CMD_EXEC: u32 = 1 << 31;
    const CMD_IRQ_ENABLE: u32 = 1 << 30;
    const OPCODE_IDENTIFY: u32 = 0x90;

    {
        let mut mem = system.phys.borrow_mut();
        mem.write(NAND_BASE + REG_DATABUF, &SCRATCH.to_be_bytes(), Endian::Big).unwrap();
        mem.write(NAND_BASE + REG_CTRL, &(CMD_EXEC | CMD_IRQ_ENABLE | OPCODE_IDENTIFY).to_be_bytes(), Endian::Big).unwrap();
    }

    let chip_id = system.phys.borrow().read_bytes(SCRATCH, 2).unwrap();
    assert_eq!(chip_id, vec![0xEC, 0xD5]);

    // Unmask the NAND bit (ALL word, bit 1) so the pulse is deliverable.
    system.phys.borrow_mut().write(0xD00_0478, &(1u32 << 1).to_be_bytes(), Endian::Big).unwrap();
    assert!(system.sec_irq.borrow_mut().check_interrupts());
}

#[test]
fn timer_alarm_drives_a_scheduled_core_through_a_fake_interpreter() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let mut system = System::new(&config).unwrap();

    struct CountingInterpreter {
        steps: Rc<RefCell<u32>>,
    }
    impl Interpreter for CountingInterpreter {
        fn step(&mut self, quantum: u32) -> Signal {
            *self.steps.borrow_mut() += quantum;
            Signal::Continue
        }
        fn add_exec_breakpoint(&mut self, _addr: u32) {}
        fn remove_exec_breakpoint(&mut self, _addr: u32) {}
        fn add_watchpoint(&mut self, _addr: u32, _write: bool) {}
        fn remove_watchpoint(&mut self, _addr: u32, _write: bool) {}
    }

    let steps = Rc::new(RefCell::new(0u32));
    let interp = Rc::new(RefCell::new(CountingInterpreter { steps: steps.clone() }));
    let sec_irq = system.sec_irq.clone();
    let core = system.scheduler.add(interp, 1250, move || {
        let _ = sec_irq.borrow_mut().check_interrupts();
    });
    system.scheduler.resume(core);

    system.scheduler.run_rotations(4);

    assert_eq!(*steps.borrow(), 1250 * 4);
    assert_eq!(system.scheduler.retired(core), (1250 * 4) as u64);
}
