use rewind_target::{FpValue, RegisterId};

use crate::{
    address_space::Accessors,
    context::MachineContext,
    cursor::Cursor,
    proc_info::{ProcInfo, ProcName, UnwindInfoProvider},
    resume::{self, ContextInstaller},
    Access, Error,
};

/// Accessors for unwinding the calling process.
///
/// Registers come from the [`MachineContext`] the cursor was created with, memory is read
/// from the process itself. Resuming hands the frame's state to the [`ContextInstaller`].
#[derive(Debug)]
pub struct Local<P, I> {
    provider: P,
    installer: I,
}

impl<P: UnwindInfoProvider, I: ContextInstaller> Local<P, I> {
    /// Accessors that look procedures up in `provider` and resume through `installer`.
    pub fn new(provider: P, installer: I) -> Self {
        Self {
            provider,
            installer,
        }
    }

    /// The source of procedure information.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The installer used by resume.
    pub fn installer(&self) -> &I {
        &self.installer
    }
}

impl<P: UnwindInfoProvider, I: ContextInstaller> Accessors for Local<P, I> {
    type Context = MachineContext;

    const LOCAL: bool = true;

    fn find_proc_info(
        &self,
        _context: &mut MachineContext,
        ip: u64,
        need_unwind_info: bool,
    ) -> Result<ProcInfo, Error> {
        super::find_proc_info(&self.provider, ip, need_unwind_info)
    }

    fn get_dyn_info_list_addr(&self, _context: &mut MachineContext) -> Result<u64, Error> {
        super::dyn_info_list_addr(&self.provider)
    }

    #[cfg(target_os = "linux")]
    fn access_mem(
        &self,
        _context: &mut MachineContext,
        address: u64,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        let pid = nix::unistd::Pid::this();
        match access {
            Access::Read => *value = super::process_memory::read_word(pid, address)?,
            Access::Write => super::process_memory::write_word(pid, address, *value)?,
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn access_mem(
        &self,
        _context: &mut MachineContext,
        address: u64,
        _value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        Err(Error::memory(
            address,
            access,
            "local memory access is only implemented on Linux",
        ))
    }

    fn access_reg(
        &self,
        context: &mut MachineContext,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        context.access(register, value, access)
    }

    fn access_fpreg(
        &self,
        context: &mut MachineContext,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error> {
        context.access_fp(register, value, access)
    }

    fn resume(&self, cursor: &mut Cursor<'_, Self>) -> Result<(), Error> {
        let state = resume::install_state(cursor, self.installer.scratch_address())?;
        self.installer.install(state)
    }

    fn get_proc_name(&self, _context: &mut MachineContext, ip: u64) -> Result<ProcName, Error> {
        super::proc_name(&self.provider, ip)
    }
}
