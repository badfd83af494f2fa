use nix::{errno::Errno, libc::user_regs_struct, sys::ptrace, unistd::Pid};
use rewind_target::{x86_64, RegisterId};

use super::{process_memory, TargetControl};
use crate::Error;

/// A process stopped under `ptrace`, unwound from another process.
///
/// Attaching and waiting for the stop are left to the caller. Memory is transferred with
/// `process_vm_readv`/`process_vm_writev`, registers with `PTRACE_GETREGS`/`PTRACE_SETREGS`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PtraceTarget {
    pid: Pid,
}

impl PtraceTarget {
    /// The traced process `pid`, which must be in a ptrace stop.
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    /// The traced process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn registers(&self) -> Result<user_regs_struct, Error> {
        ptrace::getregs(self.pid).map_err(|errno| self.failed("PTRACE_GETREGS", errno))
    }

    fn failed(&self, request: &str, errno: Errno) -> Error {
        Error::Other(format!("{request} on process {} failed: {errno}", self.pid))
    }
}

fn field(registers: &mut user_regs_struct, register: RegisterId) -> Option<&mut u64> {
    let field = match register {
        x86_64::RAX => &mut registers.rax,
        x86_64::RDX => &mut registers.rdx,
        x86_64::RCX => &mut registers.rcx,
        x86_64::RBX => &mut registers.rbx,
        x86_64::RSI => &mut registers.rsi,
        x86_64::RDI => &mut registers.rdi,
        x86_64::RBP => &mut registers.rbp,
        x86_64::RSP => &mut registers.rsp,
        RegisterId(8) => &mut registers.r8,
        RegisterId(9) => &mut registers.r9,
        RegisterId(10) => &mut registers.r10,
        RegisterId(11) => &mut registers.r11,
        RegisterId(12) => &mut registers.r12,
        RegisterId(13) => &mut registers.r13,
        RegisterId(14) => &mut registers.r14,
        RegisterId(15) => &mut registers.r15,
        x86_64::RIP => &mut registers.rip,
        _ => return None,
    };
    Some(field)
}

impl TargetControl for PtraceTarget {
    fn read_word(&mut self, address: u64) -> Result<u64, Error> {
        process_memory::read_word(self.pid, address)
    }

    fn write_word(&mut self, address: u64, value: u64) -> Result<(), Error> {
        process_memory::write_word(self.pid, address, value)
    }

    fn read_register(&mut self, register: RegisterId) -> Result<u64, Error> {
        let mut registers = self.registers()?;
        field(&mut registers, register)
            .map(|value| *value)
            .ok_or(Error::BadRegister { register })
    }

    fn write_register(&mut self, register: RegisterId, value: u64) -> Result<(), Error> {
        let mut registers = self.registers()?;
        *field(&mut registers, register).ok_or(Error::BadRegister { register })? = value;
        ptrace::setregs(self.pid, registers).map_err(|errno| self.failed("PTRACE_SETREGS", errno))
    }

    fn continue_execution(&mut self) -> Result<(), Error> {
        tracing::debug!("Continuing process {}", self.pid);
        ptrace::cont(self.pid, None).map_err(|errno| self.failed("PTRACE_CONT", errno))
    }
}
