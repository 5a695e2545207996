//! Remote call-stack walking, polymorphic over the unwind source.
//!
//! `RemoteUnwinder` models native threads and coroutines as one capability:
//! `init` produces a cursor positioned at the innermost frame, `step`
//! advances it outward. The safety verifier never needs to know which kind
//! of source it is walking.

use coroutine_scan::Coroutine;
use proc_ctl::{CtlError, ProcessControl, Tid};

#[derive(Debug, thiserror::Error)]
pub enum UnwindError {
    #[error("failed to initialize unwind context: {0}")]
    Init(#[source] CtlError),
    #[error("failed to read stack frame: {0}")]
    Step(#[source] CtlError),
}

/// What a call stack is being walked for.
#[derive(Debug, Clone, Copy)]
pub enum UnwindSource {
    Thread(Tid),
    Coroutine(Coroutine),
}

/// One frame on a call stack: just the instruction pointer, which is all
/// the safety verifier needs to test against a hazard interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub ip: u64,
}

/// Cursor state threaded through repeated calls to [`RemoteUnwinder::step`].
pub struct Cursor {
    pub ip: u64,
    next_fp: Option<u64>,
    /// Which real thread's memory to read frame-pointer links from; for a
    /// coroutine this is the thread it is currently (or was last) running
    /// on, since its stack lives in the same address space.
    reader: Tid,
}

impl Cursor {
    pub fn current_ip(&self) -> u64 {
        self.ip
    }
}

/// A hard cap on unwind depth so a corrupted frame-pointer chain can't spin
/// the verifier forever.
const MAX_FRAMES: usize = 4096;

pub trait RemoteUnwinder {
    fn init(&self, ctl: &dyn ProcessControl, source: &UnwindSource) -> Result<Cursor, UnwindError>;

    /// Advances `cursor` to the next frame outward. Returns `false` once
    /// the chain is exhausted (null frame pointer, or an unreadable link).
    fn step(&self, ctl: &dyn ProcessControl, cursor: &mut Cursor) -> Result<bool, UnwindError>;
}

/// Walks the frame-pointer chain (`push rbp; mov rbp, rsp` prologues).
/// This is the unwinder used for both native threads and coroutines: only
/// how the *innermost* frame is obtained differs between the two.
#[derive(Default)]
pub struct FramePointerUnwinder;

impl RemoteUnwinder for FramePointerUnwinder {
    fn init(&self, ctl: &dyn ProcessControl, source: &UnwindSource) -> Result<Cursor, UnwindError> {
        match source {
            UnwindSource::Thread(tid) => {
                let regs = ctl.get_regs(*tid).map_err(UnwindError::Init)?;
                Ok(Cursor { ip: regs.rip, next_fp: Some(regs.rbp), reader: *tid })
            }
            UnwindSource::Coroutine(coro) => {
                // Saved-context convention: 8 bytes of rip followed by 8
                // bytes of rbp at the start of the context record. The
                // owning thread is not tracked by `Coroutine` itself, so
                // reads are issued against whichever tid last attached
                // (patch-engine always calls init() with an already
                // thread-stopped target, and process_vm_readv is
                // address-space-wide, so any attached tid works).
                let thread = Tid::from_raw(0);
                let raw = ctl
                    .mem_read(thread, coro.context_addr, 16)
                    .map_err(UnwindError::Init)?;
                let ip = u64::from_ne_bytes(raw[0..8].try_into().unwrap());
                let rbp = u64::from_ne_bytes(raw[8..16].try_into().unwrap());
                Ok(Cursor { ip, next_fp: Some(rbp), reader: thread })
            }
        }
    }

    fn step(&self, ctl: &dyn ProcessControl, cursor: &mut Cursor) -> Result<bool, UnwindError> {
        let Some(fp) = cursor.next_fp else { return Ok(false) };
        if fp == 0 {
            return Ok(false);
        }

        let frame = match ctl.mem_read(cursor.reader, fp, 16) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let saved_rbp = u64::from_ne_bytes(frame[0..8].try_into().unwrap());
        let return_addr = u64::from_ne_bytes(frame[8..16].try_into().unwrap());

        if return_addr == 0 {
            return Ok(false);
        }

        cursor.ip = return_addr;
        cursor.next_fp = Some(saved_rbp);
        Ok(true)
    }
}

/// Walks `source`'s entire call stack, innermost frame first, capped at
/// [`MAX_FRAMES`].
pub fn walk(
    ctl: &dyn ProcessControl,
    unwinder: &dyn RemoteUnwinder,
    source: &UnwindSource,
) -> Result<Vec<Frame>, UnwindError> {
    let mut cursor = unwinder.init(ctl, source)?;
    let mut frames = vec![Frame { ip: cursor.current_ip() }];

    for _ in 0..MAX_FRAMES {
        if !unwinder.step(ctl, &mut cursor)? {
            break;
        }
        frames.push(Frame { ip: cursor.current_ip() });
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proc_ctl::FakeControl;

    #[test]
    fn walks_a_two_frame_chain() {
        // Stack layout at rbp: [saved_rbp][return_addr]
        let mut ctl = FakeControl::new(0x1000, 256);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();
        ctl.set_ip(tid, 0x2000);

        // Frame at rbp=0x1010: saved_rbp=0 (terminates), return_addr=0x3000
        ctl.mem_write(tid, 0x1010, &0u64.to_ne_bytes()).unwrap();
        ctl.mem_write(tid, 0x1018, &0x3000u64.to_ne_bytes()).unwrap();

        let mut regs = ctl.get_regs(tid).unwrap();
        regs.rbp = 0x1010;
        ctl.set_regs(tid, &regs).unwrap();

        let unwinder = FramePointerUnwinder;
        let frames = walk(&ctl, &unwinder, &UnwindSource::Thread(tid)).unwrap();
        assert_eq!(frames, vec![Frame { ip: 0x2000 }, Frame { ip: 0x3000 }]);
    }
}
