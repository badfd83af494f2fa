//! Accessor back-ends.
//!
//! - [`Local`] unwinds the calling process from a captured [`MachineContext`].
//! - [`Remote`] drives a stopped process through a [`TargetControl`] implementation, such as
//!   [`PtraceTarget`] on Linux.
//! - [`Snapshot`] unwinds a copy of registers and memory taken earlier.
//!
//! [`MachineContext`]: crate::MachineContext

mod local;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod ptrace;
mod remote;
mod snapshot;

pub use local::Local;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::PtraceTarget;
pub use remote::{Remote, TargetControl};
pub use snapshot::{CapturedState, MemoryRegion, Snapshot};

use crate::{
    proc_info::{ProcInfo, ProcName, UnwindInfoProvider},
    Error,
};

fn find_proc_info(
    provider: &impl UnwindInfoProvider,
    ip: u64,
    need_unwind_info: bool,
) -> Result<ProcInfo, Error> {
    let mut info = provider.find(ip).ok_or(Error::ProcInfoNotFound { ip })?;
    if !need_unwind_info {
        info.unwind = None;
    }
    Ok(info)
}

fn proc_name(provider: &impl UnwindInfoProvider, ip: u64) -> Result<ProcName, Error> {
    provider.proc_name(ip).ok_or(Error::ProcInfoNotFound { ip })
}

fn dyn_info_list_addr(provider: &impl UnwindInfoProvider) -> Result<u64, Error> {
    provider
        .dyn_info_list_addr()
        .ok_or(Error::NotSupported("no dynamic procedure list"))
}

/// Word access to another process' memory (or our own) without going through a signal-prone
/// pointer dereference.
#[cfg(target_os = "linux")]
mod process_memory {
    use std::io::{IoSlice, IoSliceMut};

    use nix::{
        sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec},
        unistd::Pid,
    };

    use crate::{Access, Error};

    pub(super) fn read_word(pid: Pid, address: u64) -> Result<u64, Error> {
        let mut buffer = [0u8; 8];
        let remote = [RemoteIoVec {
            base: address as usize,
            len: buffer.len(),
        }];
        match process_vm_readv(pid, &mut [IoSliceMut::new(&mut buffer)], &remote) {
            Ok(8) => Ok(u64::from_ne_bytes(buffer)),
            Ok(read) => Err(Error::memory(
                address,
                Access::Read,
                format!("short read of {read} bytes"),
            )),
            Err(errno) => Err(Error::memory(address, Access::Read, errno.desc())),
        }
    }

    pub(super) fn write_word(pid: Pid, address: u64, value: u64) -> Result<(), Error> {
        let buffer = value.to_ne_bytes();
        let remote = [RemoteIoVec {
            base: address as usize,
            len: buffer.len(),
        }];
        match process_vm_writev(pid, &[IoSlice::new(&buffer)], &remote) {
            Ok(8) => Ok(()),
            Ok(written) => Err(Error::memory(
                address,
                Access::Write,
                format!("short write of {written} bytes"),
            )),
            Err(errno) => Err(Error::memory(address, Access::Write, errno.desc())),
        }
    }
}
