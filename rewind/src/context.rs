//! Captured register state of a thread.

use rewind_target::{FpValue, RegisterFile, RegisterId};

use crate::{Access, Error};

/// The register values of one thread at the point it was captured.
///
/// Registers that were not captured have no storage: accessing them fails with
/// [`Error::BadRegister`] until they are written.
#[derive(Debug, Clone)]
pub struct MachineContext {
    register_file: &'static RegisterFile,
    words: Vec<Option<u64>>,
    fp: Vec<Option<FpValue>>,
}

impl PartialEq for MachineContext {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.register_file, other.register_file)
            && self.words == other.words
            && self.fp == other.fp
    }
}

impl MachineContext {
    /// A context with no captured registers.
    pub fn new(register_file: &'static RegisterFile) -> Self {
        Self {
            register_file,
            words: vec![None; register_file.len()],
            fp: vec![None; register_file.len()],
        }
    }

    /// Builder form of [`MachineContext::set`] for integer registers known to be in the file.
    pub fn with(mut self, register: RegisterId, value: u64) -> Self {
        if let Err(error) = self.set(register, value) {
            tracing::warn!("Ignoring captured value of {register}: {error}");
        }
        self
    }

    /// Builder form of [`MachineContext::set_fp`].
    pub fn with_fp(mut self, register: RegisterId, value: FpValue) -> Self {
        if let Err(error) = self.set_fp(register, value) {
            tracing::warn!("Ignoring captured value of {register}: {error}");
        }
        self
    }

    /// The register file the context was captured with.
    pub fn register_file(&self) -> &'static RegisterFile {
        self.register_file
    }

    fn slot(&self, register: RegisterId, floating_point: bool) -> Result<usize, Error> {
        match self.register_file.get(register) {
            Some(description) if description.is_floating_point() == floating_point => {
                Ok(register.index())
            }
            _ => Err(Error::BadRegister { register }),
        }
    }

    /// Value of an integer register.
    pub fn get(&self, register: RegisterId) -> Result<u64, Error> {
        let slot = self.slot(register, false)?;
        self.words[slot].ok_or(Error::BadRegister { register })
    }

    /// Store the value of an integer register.
    pub fn set(&mut self, register: RegisterId, value: u64) -> Result<(), Error> {
        let slot = self.slot(register, false)?;
        self.words[slot] = Some(value);
        Ok(())
    }

    /// Value of a floating-point register.
    pub fn get_fp(&self, register: RegisterId) -> Result<FpValue, Error> {
        let slot = self.slot(register, true)?;
        self.fp[slot].ok_or(Error::BadRegister { register })
    }

    /// Store the value of a floating-point register.
    pub fn set_fp(&mut self, register: RegisterId, value: FpValue) -> Result<(), Error> {
        let slot = self.slot(register, true)?;
        self.fp[slot] = Some(value);
        Ok(())
    }

    /// The integer register access shared by the accessor back-ends.
    pub fn access(
        &mut self,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error> {
        match access {
            Access::Read => *value = self.get(register)?,
            Access::Write => self.set(register, *value)?,
        }
        Ok(())
    }

    /// The floating-point register access shared by the accessor back-ends.
    pub fn access_fp(
        &mut self,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error> {
        match access {
            Access::Read => *value = self.get_fp(register)?,
            Access::Write => self.set_fp(register, *value)?,
        }
        Ok(())
    }

    /// The registers that hold a value, in id order.
    pub fn captured(&self) -> impl Iterator<Item = (RegisterId, u64)> + '_ {
        self.register_file
            .iter()
            .filter_map(|register| Some((register.id, self.words[register.id.index()]?)))
    }

    /// Capture the general purpose registers saved in a signal handler's `ucontext_t`.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn from_ucontext(ucontext: &libc::ucontext_t) -> Self {
        use rewind_target::x86_64;

        let gregs = &ucontext.uc_mcontext.gregs;
        let saved = [
            (x86_64::RAX, libc::REG_RAX),
            (x86_64::RDX, libc::REG_RDX),
            (x86_64::RCX, libc::REG_RCX),
            (x86_64::RBX, libc::REG_RBX),
            (x86_64::RSI, libc::REG_RSI),
            (x86_64::RDI, libc::REG_RDI),
            (x86_64::RBP, libc::REG_RBP),
            (x86_64::RSP, libc::REG_RSP),
            (x86_64::r(8), libc::REG_R8),
            (x86_64::r(9), libc::REG_R9),
            (x86_64::r(10), libc::REG_R10),
            (x86_64::r(11), libc::REG_R11),
            (x86_64::r(12), libc::REG_R12),
            (x86_64::r(13), libc::REG_R13),
            (x86_64::r(14), libc::REG_R14),
            (x86_64::r(15), libc::REG_R15),
            (x86_64::RIP, libc::REG_RIP),
        ];

        saved
            .into_iter()
            .fold(Self::new(&x86_64::REGISTERS), |context, (register, index)| {
                context.with(register, gregs[index as usize] as u64)
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rewind_target::{regstack, x86_64};

    #[test]
    fn uncaptured_registers_have_no_storage() {
        let context = MachineContext::new(&x86_64::REGISTERS).with(x86_64::RBP, 0x10);
        assert_eq!(context.get(x86_64::RBP).unwrap(), 0x10);
        assert!(matches!(
            context.get(x86_64::RBX),
            Err(Error::BadRegister { .. })
        ));
        assert!(matches!(
            context.get(RegisterId(200)),
            Err(Error::BadRegister { .. })
        ));
        assert_eq!(context.captured().collect::<Vec<_>>(), vec![(x86_64::RBP, 0x10)]);
    }

    #[test]
    fn floating_point_registers_need_the_floating_point_accessor() {
        let mut context = MachineContext::new(&regstack::REGISTERS);
        let mut value = 1;
        assert!(matches!(
            context.access(regstack::fr(2), &mut value, Access::Write),
            Err(Error::BadRegister { .. })
        ));
        let mut fp = FpValue::from_words(1, 2);
        context.access_fp(regstack::fr(2), &mut fp, Access::Write).unwrap();
        assert_eq!(context.get_fp(regstack::fr(2)).unwrap(), fp);
        assert!(matches!(
            context.get_fp(regstack::gr(2)),
            Err(Error::BadRegister { .. })
        ));
    }
}
