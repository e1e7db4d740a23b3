//! The CPU-core and interpreter interfaces the system glue consumes:
//! instruction decoding/interpretation itself is an external collaborator,
//! but the shape of the handle it presents is part of this crate's contract
//! with that collaborator.

/// A guest exception the core's standard vectoring mechanism should take.
#[derive(Debug, Copy, Clone)]
pub enum Exception {
    DataStorage { addr: u32, write: bool },
    InstructionStorage { addr: u32 },
    Undefined { opcode: u32 },
    SystemCall { number: u32 },
}

/// Register/SPR/MSR accessors and exception injection for one core, common
/// to both the SEC and the APP cores despite their different register
/// files (the embedder's concrete core exposes whichever subset applies).
pub trait CpuCore {
    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);
    fn gpr(&self, index: usize) -> u32;
    fn set_gpr(&mut self, index: usize, value: u32);
    fn msr(&self) -> u32;
    fn set_msr(&mut self, value: u32);
    fn raise_exception(&mut self, exception: Exception);
}

/// Result of running a quantum: whether the scheduler should keep rotating
/// this core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Quit,
}

/// `step(n)` plus breakpoint/watchpoint registration and single-callback
/// event delivery. The interpreter fires one callback per address; fanning
/// that out to multiple observers is [`crate::breakpoints::BreakpointRouter`]'s
/// job, which holds a handle to this trait and registers/deregisters with
/// it as observers come and go.
pub trait Interpreter {
    fn step(&mut self, quantum: u32) -> Signal;
    fn add_exec_breakpoint(&mut self, addr: u32);
    fn remove_exec_breakpoint(&mut self, addr: u32);
    fn add_watchpoint(&mut self, addr: u32, write: bool);
    fn remove_watchpoint(&mut self, addr: u32, write: bool);
}
