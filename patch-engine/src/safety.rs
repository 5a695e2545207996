use std::ops::Range;

use coroutine_scan::Coroutine;
use patch_format::PatchHunk;
use proc_ctl::{ProcessControl, Tid};
use remote_unwind::{walk, FramePointerUnwinder, UnwindSource};

use crate::error::PatchEngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Apply,
    Revoke,
}

impl Action {
    fn hazard(self, hunk: &PatchHunk) -> Range<u64> {
        match self {
            Action::Apply => hunk.apply_hazard(),
            Action::Revoke => hunk.revoke_hazard(),
        }
    }
}

/// Per-thread outcome of a safety walk: `None` if the thread's stack never
/// entered a hazard interval, `Some(ip)` with the first safe instruction
/// pointer outside a hazard run otherwise (the *return-hazard*, see
/// spec.md §4.3).
pub type ThreadVerdict = (Tid, Option<u64>);

pub struct VerifyReport {
    pub threads: Vec<ThreadVerdict>,
    pub coroutine_unsafe: bool,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        !self.coroutine_unsafe && self.threads.iter().all(|(_, hazard)| hazard.is_none())
    }
}

/// Walks every thread's and coroutine's call stack in `ctl`, deciding
/// whether `action` would overwrite (or restore) a byte some frame is
/// currently executing.
///
/// `paranoid`, when set, keeps unwinding past the first safe frame to find
/// the outermost unsafe one instead of stopping at the first; it has no
/// CLI surface and exists for tests that need to exercise that path.
pub fn verify(
    ctl: &dyn ProcessControl,
    threads: &[Tid],
    coroutines: &[Coroutine],
    hunks: &[PatchHunk],
    action: Action,
    paranoid: bool,
) -> Result<VerifyReport, PatchEngineError> {
    let unwinder = FramePointerUnwinder;
    let mut thread_verdicts = Vec::with_capacity(threads.len());

    for &tid in threads {
        let frames = walk(ctl, &unwinder, &UnwindSource::Thread(tid))?;
        thread_verdicts.push((tid, return_hazard(&frames.iter().map(|f| f.ip).collect::<Vec<_>>(), hunks, action, paranoid)));
    }

    let mut coroutine_unsafe = false;
    for coro in coroutines {
        let frames = walk(ctl, &unwinder, &UnwindSource::Coroutine(*coro))?;
        if return_hazard(&frames.iter().map(|f| f.ip).collect::<Vec<_>>(), hunks, action, paranoid).is_some() {
            coroutine_unsafe = true;
        }
    }

    Ok(VerifyReport { threads: thread_verdicts, coroutine_unsafe })
}

fn is_unsafe_at(ip: u64, hunks: &[PatchHunk], action: Action) -> bool {
    hunks.iter().filter(|h| !h.is_new_function() && !h.is_end()).any(|h| action.hazard(h).contains(&ip))
}

/// Scans `ips` (innermost frame first) for a hazard, tracking the boundary
/// between unsafe and safe runs the way spec.md's `prev` flag does. Returns
/// the return-hazard IP if any frame was unsafe, `None` if the stack is
/// entirely clean.
fn return_hazard(ips: &[u64], hunks: &[PatchHunk], action: Action, paranoid: bool) -> Option<u64> {
    let mut prev_unsafe = false;
    let mut safe_ip = None;

    for &ip in ips {
        let unsafe_here = is_unsafe_at(ip, hunks, action);
        if prev_unsafe && !unsafe_here {
            safe_ip = Some(ip);
            if !paranoid {
                break;
            }
        }
        prev_unsafe = unsafe_here;
    }

    // A hazard run that never leaves the walked portion of the stack (the
    // chain ended while still inside a hazard) still counts as unsafe; the
    // caller has nowhere safe to drive the thread to, so report the last IP
    // walked as the best available return-hazard.
    if safe_ip.is_none() && prev_unsafe {
        return ips.last().copied();
    }

    safe_ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use proc_ctl::FakeControl;

    fn hunk(daddr: u64, dlen: u32) -> PatchHunk {
        PatchHunk { daddr, dlen, saddr: 0x9000, slen: 5, flags: 0 }
    }

    #[test]
    fn clean_stack_reports_no_hazard() {
        assert_eq!(return_hazard(&[0x1, 0x2, 0x3], &[hunk(0x1000, 16)], Action::Apply, false), None);
    }

    #[test]
    fn unsafe_frame_reports_first_safe_outer_frame() {
        let ips = vec![0x1008, 0x2000];
        assert_eq!(return_hazard(&ips, &[hunk(0x1000, 16)], Action::Apply, false), Some(0x2000));
    }

    #[test]
    fn hazard_with_no_safe_frame_reports_last_ip() {
        let ips = vec![0x1008];
        assert_eq!(return_hazard(&ips, &[hunk(0x1000, 16)], Action::Apply, false), Some(0x1008));
    }

    #[test]
    fn verify_walks_real_control_for_threads() {
        let mut ctl = FakeControl::new(0x1000, 64);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();
        ctl.set_ip(tid, 0x1008);

        let hunks = vec![hunk(0x1000, 16)];
        let report = verify(&ctl, &[tid], &[], &hunks, Action::Apply, false).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.threads[0].1, Some(0x1008));
    }
}
