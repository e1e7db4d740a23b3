//! Full-system emulator host glue for a heterogeneous security-processor
//! (SEC) plus triple application-core (APP0/1/2) console platform.
//!
//! This crate is the glue layer: physical memory, both MMU families, the
//! interrupt mesh, every MMIO device model, and the round-robin scheduler
//! that rotates the four cores. Instruction decoding/interpretation for the
//! SEC and APP cores is an external collaborator behind the [`cpu::CpuCore`]
//! and [`cpu::Interpreter`] traits; this crate does not implement an ISA.

pub mod breakpoints;
pub mod config;
pub mod cpu;
pub mod crypto;
pub mod devices;
pub mod elf;
pub mod error;
pub mod interrupts;
pub mod ipc_snoop;
pub mod memory;
pub mod mmu;
pub mod scheduler;
pub mod system;

pub use config::{Cli, Config};
pub use error::HvError;
pub use system::System;
