use rewind_target::RegisterId;

/// Direction of an access through an accessor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, docsplay::Display)]
pub enum Access {
    /// read
    Read,
    /// write
    Write,
}

impl Access {
    /// `true` for writes.
    pub fn is_write(self) -> bool {
        self == Access::Write
    }
}

/// Failed to {access} address {address:#010x}: {reason}
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub struct MemoryAccessError {
    /// The address that was accessed.
    pub address: u64,
    /// Whether the access was a read or a write.
    pub access: Access,
    /// What the accessor reported.
    pub reason: String,
}

impl MemoryAccessError {
    /// Create a new error for an access to `address`.
    pub fn new(address: u64, access: Access, reason: impl Into<String>) -> Self {
        Self {
            address,
            access,
            reason: reason.into(),
        }
    }
}

/// An error occurred while unwinding or resuming a target.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The register number is out of range, or the accessor has no storage for it.
    #[error("Register {register} has no storage that can be accessed")]
    BadRegister {
        /// The offending register.
        register: RegisterId,
    },
    /// A write was attempted on a register whose value the unwinder derives itself.
    #[error("Register {register} is derived while unwinding and cannot be written")]
    ReadOnlyRegister {
        /// The offending register.
        register: RegisterId,
    },
    /// An accessor failed to read or write target memory.
    #[error(transparent)]
    MemoryAccess(#[from] MemoryAccessError),
    /// No unwind description covers the address. While stepping this ends the chain.
    #[error("No procedure information covers address {ip:#010x}")]
    ProcInfoNotFound {
        /// The address that was looked up.
        ip: u64,
    },
    /// A location that was needed could not be resolved to any storage.
    #[error("The location of register {register} is unknown in this frame")]
    InvalidContext {
        /// The register whose location is unknown.
        register: RegisterId,
    },
    /// Walking the register backing store went past the oldest area the cursor knows about.
    #[error("The register backing store underflowed while flushing stacked registers")]
    RegisterStackUnderflow,
    /// The static bootstrap arena cannot satisfy another allocation.
    #[error("The bootstrap arena is exhausted: {requested} bytes requested, {remaining} bytes left")]
    BootstrapArenaExhausted {
        /// Size of the failed request in bytes.
        requested: usize,
        /// Bytes still available in the arena.
        remaining: usize,
    },
    /// The operation is not available for this target.
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
    /// The configuration could not be loaded.
    #[error("Invalid unwinder configuration")]
    Config(#[from] Box<figment::Error>),
    /// Some other error occurred.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// A short-hand for a failed memory access.
    pub fn memory(address: u64, access: Access, reason: impl Into<String>) -> Self {
        Error::MemoryAccess(MemoryAccessError::new(address, access, reason))
    }

    /// A target-supplied `base` whose offset lies past the end of the address space.
    pub fn address_overflow(base: u64, access: Access) -> Self {
        Error::memory(base, access, "offset runs past the end of the address space")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_access_display() {
        let error = Error::memory(0xdead_0000, Access::Write, "not mapped");
        assert_eq!(
            error.to_string(),
            "Failed to write address 0xdead0000: not mapped"
        );
    }

    #[test]
    fn address_overflow_names_the_base() {
        let error = Error::address_overflow(u64::MAX - 4, Access::Read);
        assert_eq!(
            error.to_string(),
            "Failed to read address 0xfffffffffffffffb: offset runs past the end of the address space"
        );
    }

    #[test]
    fn register_errors_name_the_register() {
        let error = Error::ReadOnlyRegister {
            register: RegisterId(7),
        };
        assert_eq!(
            error.to_string(),
            "Register #7 is derived while unwinding and cannot be written"
        );
    }
}
