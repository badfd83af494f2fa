use std::marker::PhantomData;

use rewind_target::{FpValue, RegisterId};

use crate::{
    address_space::Accessors,
    cursor::Cursor,
    proc_info::{ProcInfo, ProcName, UnwindInfoProvider},
    Access, Error,
};

/// Control over a stopped process.
///
/// This is the per-cursor context of [`Remote`] accessors. Calls may block for as long as the
/// process control mechanism needs; errors are passed on unchanged.
pub trait TargetControl: Send {
    /// Read one word of memory.
    fn read_word(&mut self, address: u64) -> Result<u64, Error>;

    /// Write one word of memory.
    fn write_word(&mut self, address: u64, value: u64) -> Result<(), Error>;

    /// Read an integer register.
    fn read_register(&mut self, register: RegisterId) -> Result<u64, Error>;

    /// Write an integer register.
    fn write_register(&mut self, register: RegisterId, value: u64) -> Result<(), Error>;

    /// Read a floating-point register.
    fn read_fp_register(&mut self, register: RegisterId) -> Result<FpValue, Error> {
        Err(Error::BadRegister { register })
    }

    /// Write a floating-point register.
    fn write_fp_register(&mut self, register: RegisterId, value: FpValue) -> Result<(), Error> {
        let _ = value;
        Err(Error::BadRegister { register })
    }

    /// Let the process run again.
    fn continue_execution(&mut self) -> Result<(), Error>;
}

/// Accessors for a stopped process, reached through the cursor's [`TargetControl`].
pub struct Remote<P, T> {
    provider: P,
    _target: PhantomData<fn(T)>,
}

impl<P: UnwindInfoProvider, T: TargetControl> Remote<P, T> {
    /// Accessors that look procedures up in `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            _target: PhantomData,
        }
    }
}

impl<P: std::fmt::Debug, T> std::fmt::Debug for Remote<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("provider", &self.provider)
            .finish()
    }
}

impl<P: UnwindInfoProvider, T: TargetControl> Accessors for Remote<P, T> {
    type Context = T;

    fn find_proc_info(
        &self,
        _target: &mut T,
        ip: u64,
        need_unwind_info: bool,
    ) -> Result<ProcInfo, Error> {
        super::find_proc_info(&self.provider, ip, need_unwind_info)
    }

    fn get_dyn_info_list_addr(&self, _target: &mut T) -> Result<u64, Error> {
        super::dyn_info_list_addr(&self.provider)
    }

    fn access_mem(
        &self,
        target: &mut T,
        address: u64,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        match access {
            Access::Read => *value = target.read_word(address)?,
            Access::Write => target.write_word(address, *value)?,
        }
        Ok(())
    }

    fn access_reg(
        &self,
        target: &mut T,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        match access {
            Access::Read => *value = target.read_register(register)?,
            Access::Write => target.write_register(register, *value)?,
        }
        Ok(())
    }

    fn access_fpreg(
        &self,
        target: &mut T,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error> {
        match access {
            Access::Read => *value = target.read_fp_register(register)?,
            Access::Write => target.write_fp_register(register, *value)?,
        }
        Ok(())
    }

    fn resume(&self, cursor: &mut Cursor<'_, Self>) -> Result<(), Error> {
        cursor.context_mut().continue_execution()
    }

    fn get_proc_name(&self, _target: &mut T, ip: u64) -> Result<ProcName, Error> {
        super::proc_name(&self.provider, ip)
    }
}
