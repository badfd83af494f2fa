//! The accessor protocol and the address space that binds one accessor set to a target.

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};

use rewind_target::{ByteOrder, FpValue, RegisterFile, RegisterId};

use crate::{
    cache::{CacheGeneration, CachingPolicy, Generation, Lookup, UnwindCache},
    config::UnwindConfig,
    cursor::Cursor,
    dyn_info,
    proc_info::{ProcInfo, ProcName},
    Access, Error,
};

/// The operations through which the unwinder reaches a target.
///
/// One implementation exists per kind of target: the calling process itself, a traced process,
/// or a captured snapshot. The stepping algorithm is written only against this trait.
///
/// `Context` is the per-cursor argument handed to every call, e.g. the captured registers of the
/// thread being unwound or a handle to a stopped process.
pub trait Accessors: Sized + Send + Sync {
    /// Per-cursor state passed to every accessor call.
    type Context: Send;

    /// `true` if cursors over this target run in the thread being unwound, in which case resume
    /// installs the register state directly instead of writing it back register by register.
    const LOCAL: bool = false;

    /// The procedure covering `ip`. `need_unwind_info` is `false` when only the procedure bounds
    /// and handler are needed.
    fn find_proc_info(
        &self,
        context: &mut Self::Context,
        ip: u64,
        need_unwind_info: bool,
    ) -> Result<ProcInfo, Error>;

    /// Byte order of the target, as configured for the address space the accessors are bound
    /// to. Called once, before any other operation.
    fn set_byte_order(&mut self, byte_order: ByteOrder) {
        let _ = byte_order;
    }

    /// Release whatever [`Accessors::find_proc_info`] allocated for `proc_info`.
    fn put_unwind_info(&self, context: &mut Self::Context, proc_info: &ProcInfo) {
        let _ = (context, proc_info);
    }

    /// The address of the target's list of dynamically registered procedures.
    fn get_dyn_info_list_addr(&self, context: &mut Self::Context) -> Result<u64, Error>;

    /// Read or write one word of target memory.
    fn access_mem(
        &self,
        context: &mut Self::Context,
        address: u64,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error>;

    /// Read or write one integer register. Registers without storage fail with
    /// [`Error::BadRegister`].
    fn access_reg(
        &self,
        context: &mut Self::Context,
        register: RegisterId,
        value: &mut u64,
        access: Access,
    ) -> Result<(), Error>;

    /// Read or write one floating-point register.
    fn access_fpreg(
        &self,
        context: &mut Self::Context,
        register: RegisterId,
        value: &mut FpValue,
        access: Access,
    ) -> Result<(), Error>;

    /// Transfer control to the frame `cursor` is on.
    ///
    /// For non-local targets the cursor has already written its registers back through
    /// [`Accessors::access_reg`] and [`Accessors::access_fpreg`] when this is called.
    fn resume(&self, cursor: &mut Cursor<'_, Self>) -> Result<(), Error>;

    /// Name of the procedure containing `ip`.
    fn get_proc_name(&self, context: &mut Self::Context, ip: u64) -> Result<ProcName, Error>;
}

const DYN_INFO_LIST_UNSET: u64 = 0;

/// One target's accessor binding, together with the caches shared by every cursor on it.
///
/// An address space outlives the cursors created on it, and may be shared by cursors stepping
/// concurrently on different threads.
pub struct AddressSpace<A: Accessors> {
    accessors: A,
    register_file: &'static RegisterFile,
    byte_order: ByteOrder,
    max_frames: usize,
    caching_policy: AtomicU8,
    generation: CacheGeneration,
    dyn_info_list_addr: AtomicU64,
    cache: UnwindCache,
}

impl<A: Accessors> AddressSpace<A> {
    /// An address space using the default configuration.
    pub fn new(accessors: A, register_file: &'static RegisterFile) -> Result<Self, Error> {
        Self::with_config(accessors, register_file, &UnwindConfig::default())
    }

    /// An address space configured by `config`.
    pub fn with_config(
        mut accessors: A,
        register_file: &'static RegisterFile,
        config: &UnwindConfig,
    ) -> Result<Self, Error> {
        tracing::debug!(
            "New {} address space, {:?} byte order, caching {:?}",
            register_file.name,
            config.byte_order,
            config.caching_policy
        );
        accessors.set_byte_order(config.byte_order);
        Ok(Self {
            accessors,
            register_file,
            byte_order: config.byte_order,
            max_frames: config.max_frames,
            caching_policy: AtomicU8::new(config.caching_policy as u8),
            generation: CacheGeneration::new(),
            dyn_info_list_addr: AtomicU64::new(DYN_INFO_LIST_UNSET),
            cache: UnwindCache::new(config.pool_reserve)?,
        })
    }

    /// The accessors this address space forwards to.
    pub fn accessors(&self) -> &A {
        &self.accessors
    }

    /// Register file of the target.
    pub fn register_file(&self) -> &'static RegisterFile {
        self.register_file
    }

    /// Byte order of the target.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Most frames a [`backtrace`](crate::backtrace()) on this address space collects.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Current caching policy.
    pub fn caching_policy(&self) -> CachingPolicy {
        if self.caching_policy.load(Ordering::Relaxed) == CachingPolicy::None as u8 {
            CachingPolicy::None
        } else {
            CachingPolicy::Global
        }
    }

    /// Change the caching policy. Anything cached so far is invalidated.
    pub fn set_caching_policy(&self, policy: CachingPolicy) {
        self.caching_policy.store(policy as u8, Ordering::Relaxed);
        self.flush_cache(0, 0);
    }

    /// The current cache generation.
    pub fn generation(&self) -> Generation {
        self.generation.current()
    }

    /// Invalidate cached unwind information for the code in `lo..hi`.
    ///
    /// The range is advisory: everything is invalidated. Cached entries are left in place and
    /// dropped lazily once they are found to belong to an old generation.
    pub fn flush_cache(&self, lo: u64, hi: u64) -> Generation {
        self.dyn_info_list_addr
            .store(DYN_INFO_LIST_UNSET, Ordering::Release);
        let generation = self.generation.bump();
        tracing::debug!("Flushed unwind cache for {lo:#x}..{hi:#x}, now at {generation:?}");
        generation
    }

    /// The address of the dynamic procedure list, asking the accessors only on the first call
    /// after creation or a flush.
    pub fn dyn_info_list_addr(&self, context: &mut A::Context) -> Result<u64, Error> {
        let cached = self.dyn_info_list_addr.load(Ordering::Acquire);
        if cached != DYN_INFO_LIST_UNSET {
            return Ok(cached);
        }
        let generation = self.generation.current();
        let address = self.accessors.get_dyn_info_list_addr(context)?;
        // A flush that raced with the lookup wins.
        if self.generation.is_current(generation) {
            self.dyn_info_list_addr.store(address, Ordering::Release);
        }
        Ok(address)
    }

    /// The procedure covering `ip`, from the cache when possible.
    ///
    /// Procedures the accessors do not know about are looked up in the dynamic procedure list.
    pub fn find_proc_info(
        &self,
        context: &mut A::Context,
        ip: u64,
    ) -> Result<Arc<ProcInfo>, Error> {
        let caching = self.caching_policy() != CachingPolicy::None;

        let generation = loop {
            let generation = self.generation.current();
            if !caching {
                break generation;
            }
            match self.cache.lookup(ip, generation) {
                Lookup::Hit(info) if self.generation.is_current(generation) => return Ok(info),
                // Flushed while we were reading, start over.
                Lookup::Hit(_) => continue,
                Lookup::Stale | Lookup::Miss => break generation,
            }
        };

        let info = match self.accessors.find_proc_info(context, ip, true) {
            Ok(info) => info,
            Err(Error::ProcInfoNotFound { .. }) => dyn_info::find_proc_info(self, context, ip)?,
            Err(error) => return Err(error),
        };
        let info = Arc::new(info);

        if caching {
            if let Err(error) = self.cache.insert(info.clone(), generation, &self.generation) {
                tracing::warn!("Not caching procedure at {:#x}: {error}", info.start_ip);
            }
        }
        Ok(info)
    }

    /// Hand procedure information back to the accessors once a cursor is done with it. Cached
    /// information stays alive and is not released.
    pub(crate) fn release_proc_info(&self, context: &mut A::Context, info: &ProcInfo) {
        if self.caching_policy() == CachingPolicy::None {
            self.accessors.put_unwind_info(context, info);
        }
    }
}

impl<A: Accessors + std::fmt::Debug> std::fmt::Debug for AddressSpace<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("accessors", &self.accessors)
            .field("register_file", &self.register_file.name)
            .field("byte_order", &self.byte_order)
            .field("max_frames", &self.max_frames)
            .field("caching_policy", &self.caching_policy())
            .field("generation", &self.generation())
            .finish()
    }
}
