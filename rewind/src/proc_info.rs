//! Procedure information: the static description of a procedure that the unwinder consumes.

use std::fmt::{self, Display};

use rewind_target::RegisterId;
use serde::Serialize;

/// How the canonical frame address of a frame is computed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum CfaRule {
    /// The value of `register` in the current frame, plus `offset`.
    RegisterAndOffset {
        /// Base register.
        register: RegisterId,
        /// Signed displacement added to the register value.
        offset: i64,
    },
}

impl Display for CfaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfaRule::RegisterAndOffset { register, offset } => write!(f, "{register}{offset:+}"),
        }
    }
}

/// Where the caller's value of one register was saved by the current frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum RegisterRule {
    /// The caller's value cannot be recovered.
    Undefined,
    /// The register was not modified by the current frame.
    SameValue,
    /// Saved in memory at the canonical frame address plus the offset.
    Offset(i64),
    /// Saved in another register of the current frame.
    Register(RegisterId),
}

impl Display for RegisterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterRule::Undefined => write!(f, "undefined"),
            RegisterRule::SameValue => write!(f, "same value"),
            RegisterRule::Offset(offset) => write!(f, "[cfa{offset:+}]"),
            RegisterRule::Register(register) => write!(f, "in {register}"),
        }
    }
}

/// One row of a decoded unwind table: the rules in effect for a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnwindRow {
    /// How to compute the canonical frame address.
    pub cfa: CfaRule,
    /// Rules for the registers the procedure saves. Registers without an entry fall back to the
    /// default of their register file.
    pub rules: Vec<(RegisterId, RegisterRule)>,
}

impl UnwindRow {
    /// A row with only a CFA rule.
    pub fn new(cfa: CfaRule) -> Self {
        Self {
            cfa,
            rules: Vec::new(),
        }
    }

    /// Add (or replace) the rule of `register`.
    pub fn with_rule(mut self, register: RegisterId, rule: RegisterRule) -> Self {
        self.rules.retain(|(id, _)| *id != register);
        self.rules.push((register, rule));
        self
    }

    /// The rule recorded for `register`, if any.
    pub fn rule(&self, register: RegisterId) -> Option<RegisterRule> {
        self.rules
            .iter()
            .find_map(|(id, rule)| (*id == register).then_some(*rule))
    }
}

/// A signal trampoline: the interrupted frame's registers are in a saved context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct SignalFrame {
    /// Offset of the saved context from the canonical frame address.
    pub context_offset: i64,
}

/// The static description of the procedure covering an instruction address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcInfo {
    /// First instruction address of the procedure.
    pub start_ip: u64,
    /// First address past the procedure.
    pub end_ip: u64,
    /// Personality routine, or 0.
    pub handler: u64,
    /// Language specific data area, or 0.
    pub lsda: u64,
    /// Global pointer value the procedure expects, or 0.
    pub gp: u64,
    /// Set for signal trampolines.
    pub signal_frame: Option<SignalFrame>,
    /// Set for procedures that switch to another register backing store. Their caller's stacks
    /// are described by a marker stored at the canonical frame address.
    pub stack_switch: bool,
    /// The decoded unwind rules. Procedures without rules are unwound with the architecture's
    /// fallback rules.
    pub unwind: Option<UnwindRow>,
}

impl ProcInfo {
    /// A procedure covering `start_ip..end_ip` without unwind rules.
    pub fn new(start_ip: u64, end_ip: u64) -> Self {
        Self {
            start_ip,
            end_ip,
            ..Default::default()
        }
    }

    /// Attach unwind rules.
    pub fn with_unwind(mut self, row: UnwindRow) -> Self {
        self.unwind = Some(row);
        self
    }

    /// `true` if `ip` lies inside the procedure.
    pub fn contains(&self, ip: u64) -> bool {
        (self.start_ip..self.end_ip).contains(&ip)
    }
}

/// The name of the procedure containing an address, and the address' offset from its start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcName {
    /// Symbol name.
    pub name: String,
    /// Offset of the address from the start of the symbol.
    pub offset: u64,
}

impl Display for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.name, self.offset)
    }
}

/// Source of procedure information for the accessor back-ends.
pub trait UnwindInfoProvider: Send + Sync {
    /// The procedure covering `ip`.
    fn find(&self, ip: u64) -> Option<ProcInfo>;

    /// The name of the procedure covering `ip`.
    fn proc_name(&self, ip: u64) -> Option<ProcName> {
        let _ = ip;
        None
    }

    /// Address of the list of dynamically registered procedures, if the target has one.
    fn dyn_info_list_addr(&self) -> Option<u64> {
        None
    }
}

/// An in-memory table of procedures, sorted by start address.
#[derive(Debug, Clone, Default)]
pub struct UnwindTable {
    entries: Vec<(ProcInfo, Option<String>)>,
    dyn_info_list_addr: Option<u64>,
}

impl UnwindTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure. An entry overlapping an existing one replaces it.
    pub fn insert(&mut self, info: ProcInfo, name: Option<&str>) {
        self.entries
            .retain(|(entry, _)| entry.end_ip <= info.start_ip || entry.start_ip >= info.end_ip);
        let position = self
            .entries
            .partition_point(|(entry, _)| entry.start_ip < info.start_ip);
        self.entries
            .insert(position, (info, name.map(str::to_string)));
    }

    /// Builder form of [`UnwindTable::insert`].
    pub fn with(mut self, info: ProcInfo, name: &str) -> Self {
        self.insert(info, Some(name));
        self
    }

    /// Set the address reported for the dynamic procedure list.
    pub fn with_dyn_info_list(mut self, address: u64) -> Self {
        self.dyn_info_list_addr = Some(address);
        self
    }

    /// Remove the procedure covering `ip`, as a JIT would when it releases code.
    pub fn remove(&mut self, ip: u64) -> Option<ProcInfo> {
        let index = self.index_of(ip)?;
        Some(self.entries.remove(index).0)
    }

    /// Number of procedures in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, ip: u64) -> Option<usize> {
        let index = self
            .entries
            .partition_point(|(entry, _)| entry.start_ip <= ip)
            .checked_sub(1)?;
        self.entries[index].0.contains(ip).then_some(index)
    }
}

impl UnwindInfoProvider for UnwindTable {
    fn find(&self, ip: u64) -> Option<ProcInfo> {
        self.index_of(ip).map(|index| self.entries[index].0.clone())
    }

    fn proc_name(&self, ip: u64) -> Option<ProcName> {
        let (info, name) = &self.entries[self.index_of(ip)?];
        Some(ProcName {
            name: name.clone()?,
            offset: ip - info.start_ip,
        })
    }

    fn dyn_info_list_addr(&self) -> Option<u64> {
        self.dyn_info_list_addr
    }
}

impl<P: UnwindInfoProvider + ?Sized> UnwindInfoProvider for std::sync::Arc<P> {
    fn find(&self, ip: u64) -> Option<ProcInfo> {
        (**self).find(ip)
    }

    fn proc_name(&self, ip: u64) -> Option<ProcName> {
        (**self).proc_name(ip)
    }

    fn dyn_info_list_addr(&self) -> Option<u64> {
        (**self).dyn_info_list_addr()
    }
}
