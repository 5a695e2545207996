use std::time::Duration;

use coroutine_scan::Coroutine;
use patch_format::PatchHunk;
use proc_ctl::{ProcessControl, Tid, DEFAULT_DRIVE_TIMEOUT};

use crate::error::PatchEngineError;
use crate::safety::{self, Action};

/// Drives `ensure_safety`: verify, and if any thread (but no coroutine) is
/// unsafe, push every unsafe thread past its hazard and verify once more.
/// A second failure is fatal for the object; coroutine-unsafety never gets
/// a drive attempt.
pub struct ActionDriver {
    pub drive_timeout: Duration,
    pub paranoid: bool,
}

impl Default for ActionDriver {
    fn default() -> Self {
        Self { drive_timeout: DEFAULT_DRIVE_TIMEOUT, paranoid: false }
    }
}

impl ActionDriver {
    /// `pid` identifies the traced process so a failed first verify can
    /// re-attach: a thread may have spawned while the others were being
    /// driven past their hazard, and the retry must see it rather than
    /// re-checking the stale `threads` list spec.md's re-verify step calls
    /// for.
    pub fn ensure_safety(
        &self,
        ctl: &mut dyn ProcessControl,
        pid: Tid,
        threads: &[Tid],
        coroutines: &[Coroutine],
        hunks: &[PatchHunk],
        action: Action,
    ) -> Result<(), PatchEngineError> {
        let report = safety::verify(ctl, threads, coroutines, hunks, action, self.paranoid)?;
        if report.is_clean() {
            return Ok(());
        }
        if report.coroutine_unsafe {
            return Err(PatchEngineError::SafetyUnsafeCoroutine);
        }

        for (tid, hazard_ip) in &report.threads {
            let Some(target) = hazard_ip else { continue };
            ctl.execute_until(*tid, *target, self.drive_timeout).map_err(|_| PatchEngineError::DriveTimeout(*tid))?;
        }

        let rescanned = ctl.list_threads(pid).map_err(PatchEngineError::ProcessAttach)?;
        for &new_tid in &rescanned {
            if !threads.contains(&new_tid) {
                ctl.attach(new_tid).map_err(PatchEngineError::ProcessAttach)?;
            }
        }

        let retry = safety::verify(ctl, &rescanned, coroutines, hunks, action, self.paranoid)?;
        if retry.coroutine_unsafe {
            return Err(PatchEngineError::SafetyUnsafeCoroutine);
        }
        match retry.threads.iter().find(|(_, hazard)| hazard.is_some()) {
            Some((tid, _)) => Err(PatchEngineError::SafetyUnsafeThread(*tid)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proc_ctl::FakeControl;

    fn hunk() -> PatchHunk {
        PatchHunk { daddr: 0x1000, dlen: 16, saddr: 0x9000, slen: 5, flags: 0 }
    }

    #[test]
    fn drives_an_unsafe_thread_past_the_hazard_and_succeeds() {
        let mut ctl = FakeControl::new(0x1000, 256);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();
        ctl.set_ip(tid, 0x1008);
        // Frame pointer chain: rbp=0x1010 -> saved_rbp=0, return_addr=0x2000
        // (outside the hazard interval), so the verifier finds a safe frame
        // to drive the thread to.
        ctl.mem_write(tid, 0x1010, &0u64.to_ne_bytes()).unwrap();
        ctl.mem_write(tid, 0x1018, &0x2000u64.to_ne_bytes()).unwrap();
        let mut regs = ctl.get_regs(tid).unwrap();
        regs.rbp = 0x1010;
        ctl.set_regs(tid, &regs).unwrap();

        let driver = ActionDriver::default();
        driver.ensure_safety(&mut ctl, tid, &[tid], &[], &[hunk()], Action::Apply).unwrap();
        assert_eq!(ctl.get_regs(tid).unwrap().rip, 0x2000);
    }

    #[test]
    fn coroutine_hazard_is_immediately_fatal() {
        let mut ctl = FakeControl::new(0x1000, 64);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();
        ctl.mem_write(tid, 0x2010, &0u64.to_ne_bytes()).unwrap();
        ctl.mem_write(tid, 0x2008, &0x1008u64.to_ne_bytes()).unwrap();

        let coro = Coroutine { id: 1, context_addr: 0x2008 };
        let driver = ActionDriver::default();
        let err = driver.ensure_safety(&mut ctl, tid, &[], &[coro], &[hunk()], Action::Apply).unwrap_err();
        assert!(matches!(err, PatchEngineError::SafetyUnsafeCoroutine));
    }
}
