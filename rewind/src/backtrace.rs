use std::fmt::{self, Display};

use serde::Serialize;

use crate::{
    address_space::Accessors,
    cursor::{Cursor, StepOutcome},
    proc_info::ProcName,
    Error,
};

/// One frame of a collected backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Position in the backtrace, 0 being the innermost frame.
    pub index: usize,
    /// Instruction pointer of the frame.
    pub ip: u64,
    /// Stack pointer of the frame.
    pub sp: u64,
    /// Name of the procedure, if the accessors know it.
    pub procedure: Option<ProcName>,
    /// Start of the procedure, if procedure information was found.
    pub start_ip: Option<u64>,
    /// The frame is a signal trampoline.
    pub signal_frame: bool,
}

impl Frame {
    fn capture<A: Accessors>(cursor: &mut Cursor<'_, A>) -> Self {
        Frame {
            index: cursor.frame_index(),
            ip: cursor.ip(),
            sp: cursor.sp(),
            procedure: cursor.proc_name().ok(),
            start_ip: cursor.proc_info().ok().map(|info| info.start_ip),
            signal_frame: cursor.is_signal_frame(),
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<3} {:#018x}", self.index, self.ip)?;
        match &self.procedure {
            Some(procedure) => write!(f, " in {procedure}")?,
            None => write!(f, " in <unknown>")?,
        }
        if self.signal_frame {
            write!(f, " <signal handler called>")?;
        }
        Ok(())
    }
}

/// Walk the stack from the cursor's frame outwards, collecting at most
/// [`AddressSpace::max_frames`](crate::AddressSpace::max_frames) frames.
///
/// A step that fails ends the walk with the error; the frames collected so far are lost with
/// it. Use [`Cursor::step`] directly to keep them.
pub fn backtrace<A: Accessors>(cursor: &mut Cursor<'_, A>) -> Result<Vec<Frame>, Error> {
    let max_frames = cursor.address_space().max_frames();
    let mut frames = Vec::new();
    while frames.len() < max_frames {
        frames.push(Frame::capture(cursor));
        if cursor.step()? == StepOutcome::EndOfChain {
            return Ok(frames);
        }
    }
    tracing::warn!("Stopped unwinding the stack after {max_frames} frames");
    Ok(frames)
}
