//! Guest-kernel syscall intercept layer: breakpoints
//! the instruction after a SEC supervisor-mode syscall trap, decodes the
//! call, and emits a trace line; async completions are tracked for the
//! three `*_ASYNC` calls.

use crate::error::HvError;
use crate::memory::helper::MemoryAccess;
use std::collections::HashMap;

/// Syscall numbers recognized by the guest kernel's supervisor-call trap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNumber {
    CreateMessageQueue = 0x00,
    DestroyMessageQueue = 0x01,
    SendMessage = 0x02,
    JamMessage = 0x03,
    ReceiveMessage = 0x04,
    Open = 0x05,
    Close = 0x06,
    Ioctl = 0x07,
    IoctlAsync = 0x08,
    Resume = 0x09,
    Ioctlv = 0x0B,
    IoctlvAsync = 0x0C,
    ResumeAsync = 0x0D,
}

impl SyscallNumber {
    fn from_raw(n: u32) -> Option<Self> {
        use SyscallNumber::*;
        Some(match n {
            0x00 => CreateMessageQueue,
            0x01 => DestroyMessageQueue,
            0x02 => SendMessage,
            0x03 => JamMessage,
            0x04 => ReceiveMessage,
            0x05 => Open,
            0x06 => Close,
            0x07 => Ioctl,
            0x08 => IoctlAsync,
            0x09 => Resume,
            0x0B => Ioctlv,
            0x0C => IoctlvAsync,
            0x0D => ResumeAsync,
            _ => return None,
        })
    }
}

/// A captured syscall's arguments, tagged by kind.
#[derive(Debug, Clone)]
pub enum IosSyscall {
    CreateMessageQueue { message_buffer: u32, depth: u32 },
    DestroyMessageQueue { queue_id: u32 },
    SendMessage { queue_id: u32, message: u32, flags: u32 },
    JamMessage { queue_id: u32, message: u32, flags: u32 },
    ReceiveMessage { queue_id: u32, flags: u32 },
    Open { path: String, mode: u32 },
    Close { fd: u32 },
    Ioctl { fd: u32, request: u32, input: u32, input_len: u32, output: u32, output_len: u32 },
    Ioctlv { fd: u32, request: u32, in_count: u32, out_count: u32, argv: u32 },
    IoctlAsync { fd: u32, request: u32, input: u32, input_len: u32, output: u32, output_len: u32, callback: u32, context: u32 },
    IoctlvAsync { fd: u32, request: u32, in_count: u32, out_count: u32, argv: u32, callback: u32, context: u32 },
    Resume { thread_id: u32 },
    ResumeAsync { thread_id: u32, callback: u32, context: u32 },
}

/// Decodes a syscall's arguments from the SEC calling convention: r0..r3 in
/// `regs`, with string/struct arguments read from guest memory.
pub fn decode_syscall(number: u32, regs: [u32; 4], mem: &MemoryAccess) -> Result<Option<IosSyscall>, HvError> {
    let Some(kind) = SyscallNumber::from_raw(number) else {
        return Ok(None);
    };
    let [r0, r1, r2, r3] = regs;
    let syscall = match kind {
        SyscallNumber::CreateMessageQueue => IosSyscall::CreateMessageQueue { message_buffer: r0, depth: r1 },
        SyscallNumber::DestroyMessageQueue => IosSyscall::DestroyMessageQueue { queue_id: r0 },
        SyscallNumber::SendMessage => IosSyscall::SendMessage { queue_id: r0, message: r1, flags: r2 },
        SyscallNumber::JamMessage => IosSyscall::JamMessage { queue_id: r0, message: r1, flags: r2 },
        SyscallNumber::ReceiveMessage => IosSyscall::ReceiveMessage { queue_id: r0, flags: r1 },
        SyscallNumber::Open => IosSyscall::Open { path: mem.read_cstr_utf8(r0)?, mode: r1 },
        SyscallNumber::Close => IosSyscall::Close { fd: r0 },
        SyscallNumber::Ioctl => IosSyscall::Ioctl {
            fd: r0,
            request: r1,
            input: mem.read_u32_be(r2)?,
            input_len: mem.read_u32_be(r2 + 4)?,
            output: mem.read_u32_be(r2 + 8)?,
            output_len: mem.read_u32_be(r2 + 12)?,
        },
        SyscallNumber::Ioctlv => IosSyscall::Ioctlv { fd: r0, request: r1, in_count: r2 & 0xFFFF, out_count: r2 >> 16, argv: r3 },
        SyscallNumber::IoctlAsync => IosSyscall::IoctlAsync {
            fd: r0,
            request: r1,
            input: mem.read_u32_be(r2)?,
            input_len: mem.read_u32_be(r2 + 4)?,
            output: mem.read_u32_be(r2 + 8)?,
            output_len: mem.read_u32_be(r2 + 12)?,
            callback: mem.read_u32_be(r2 + 16)?,
            context: mem.read_u32_be(r2 + 20)?,
        },
        SyscallNumber::IoctlvAsync => IosSyscall::IoctlvAsync {
            fd: r0,
            request: r1,
            in_count: r2 & 0xFFFF,
            out_count: r2 >> 16,
            argv: r3,
            callback: mem.read_u32_be(r3 + 4)?,
            context: mem.read_u32_be(r3 + 8)?,
        },
        SyscallNumber::Resume => IosSyscall::Resume { thread_id: r0 },
        SyscallNumber::ResumeAsync => IosSyscall::ResumeAsync { thread_id: r0, callback: r1, context: r2 },
    };
    Ok(Some(syscall))
}

/// An in-flight synchronous call awaiting its return-address breakpoint.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub issuing_pc: u32,
    pub thread_id: u32,
    pub syscall: IosSyscall,
}

/// An in-flight async completion awaiting a matching `receive_message`.
#[derive(Debug, Clone)]
pub struct PendingAsync {
    pub issuing_pc: u32,
    pub thread_id: u32,
    pub syscall: IosSyscall,
}

/// Static `(address range -> module name)` table. Open question resolved:
/// kept as a plain slice, not a guest-memory walk of the loader's module
/// list.
pub struct ModuleTable {
    entries: &'static [(u32, u32, &'static str)],
}

impl ModuleTable {
    pub const fn new(entries: &'static [(u32, u32, &'static str)]) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, pc: u32) -> &'static str {
        self.entries.iter().find(|(start, end, _)| pc >= *start && pc < *end).map(|(_, _, name)| *name).unwrap_or("unknown")
    }
}

pub struct IpcSnoop {
    descriptor_paths: HashMap<u32, String>,
    pending: HashMap<(u32, u32), PendingCall>,
    pending_async: HashMap<(u32, u32), PendingAsync>,
    modules: ModuleTable,
}

impl IpcSnoop {
    pub fn new(modules: ModuleTable) -> Self {
        Self { descriptor_paths: HashMap::new(), pending: HashMap::new(), pending_async: HashMap::new(), modules }
    }

    /// Called when `open` returns successfully: remembers the path for a
    /// descriptor so later `ioctl`/`close` traces can attribute it.
    pub fn record_descriptor(&mut self, fd: u32, path: String) {
        self.descriptor_paths.insert(fd, path);
    }

    pub fn descriptor_path(&self, fd: u32) -> Option<&str> {
        self.descriptor_paths.get(&fd).map(String::as_str)
    }

    /// Registers a synchronous call awaiting its return breakpoint.
    pub fn register_pending(&mut self, return_pc: u32, thread_id: u32, issuing_pc: u32, syscall: IosSyscall) {
        self.pending.insert((return_pc, thread_id), PendingCall { issuing_pc, thread_id, syscall });
    }

    /// Takes (removes) the pending call for `(return_pc, thread_id)`, if any.
    pub fn take_pending(&mut self, return_pc: u32, thread_id: u32) -> Option<PendingCall> {
        self.pending.remove(&(return_pc, thread_id))
    }

    pub fn register_pending_async(&mut self, queue_handle: u32, message_address: u32, issuing_pc: u32, thread_id: u32, syscall: IosSyscall) {
        if !matches!(
            syscall,
            IosSyscall::IoctlAsync { .. } | IosSyscall::IoctlvAsync { .. } | IosSyscall::ResumeAsync { .. }
        ) {
            return;
        }
        self.pending_async.insert((queue_handle, message_address), PendingAsync { issuing_pc, thread_id, syscall });
    }

    pub fn take_pending_async(&mut self, queue_handle: u32, message_address: u32) -> Option<PendingAsync> {
        self.pending_async.remove(&(queue_handle, message_address))
    }

    pub fn module_for(&self, pc: u32) -> &'static str {
        self.modules.resolve(pc)
    }

    /// Formats a trace line for a completed synchronous call.
    pub fn trace_line(&self, call: &PendingCall, return_value: u32) -> String {
        format!(
            "[{}] thread {} pc={:#010x} {:?} -> {:#010x}",
            self.module_for(call.issuing_pc),
            call.thread_id,
            call.issuing_pc,
            call.syscall,
            return_value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::helper::MemoryAccess;
    use crate::memory::PhysicalMemory;
    use crate::mmu::Translator;

    struct Identity;
    impl Translator for Identity {
        fn translate_data_read(&self, ea: u32) -> Result<u32, HvError> {
            Ok(ea)
        }
        fn translate_data_write(&self, ea: u32) -> Result<u32, HvError> {
            Ok(ea)
        }
        fn translate_instruction_fetch(&self, ea: u32) -> Result<u32, HvError> {
            Ok(ea)
        }
    }

    #[test]
    fn decodes_open_with_path_string() {
        let mut phys = PhysicalMemory::new();
        phys.add_range(0, 0x1000);
        phys.write_bytes(0x100, b"/dev/nand\0").unwrap();
        let translator = Identity;
        let mem = MemoryAccess::new(&phys, &translator);
        let result = decode_syscall(0x05, [0x100, 1, 0, 0], &mem).unwrap().unwrap();
        match result {
            IosSyscall::Open { path, mode } => {
                assert_eq!(path, "/dev/nand");
                assert_eq!(mode, 1);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn module_table_resolves_ranges_and_falls_back_to_unknown() {
        static TABLE: &[(u32, u32, &str)] = &[(0x1000, 0x2000, "kernel")];
        let modules = ModuleTable::new(TABLE);
        assert_eq!(modules.resolve(0x1500), "kernel");
        assert_eq!(modules.resolve(0x5000), "unknown");
    }
}
