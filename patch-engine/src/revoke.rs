use coroutine_scan::Coroutine;
use patch_format::PatchHunk;
use proc_ctl::{ProcessControl, Tid};

use crate::driver::ActionDriver;
use crate::error::PatchEngineError;
use crate::process::ObjectFile;
use crate::safety::Action;

const TRAMPOLINE_SIZE: u64 = 5;

/// Restores every trampoline a patch installed on `object` and unmaps its
/// patch region.
///
/// `check_flag` selects which hunks to restore: `true` (ordinary unpatch)
/// restores only hunks actually marked applied; `false` (superseding an
/// older patch level before applying a newer one) restores all of them
/// unconditionally, since the object is about to be patched again anyway.
///
/// Each hunk's saved original bytes live at a *fixed* offset
/// `user_undo + i * TRAMPOLINE_SIZE`, keyed by the hunk's own index in the
/// table, not by a cursor over the hunks actually restored. Recovering the
/// original code for hunk `i` must always read that hunk's own slot.
///
/// Returns the number of hunks actually restored, for the caller's own
/// reporting.
pub fn revoke_object(
    object: &mut ObjectFile,
    ctl: &mut dyn ProcessControl,
    tid: Tid,
    driver: &ActionDriver,
    threads: &[Tid],
    coroutines: &[Coroutine],
    check_flag: bool,
) -> Result<usize, PatchEngineError> {
    let applied = object.applied.as_ref().ok_or_else(|| {
        PatchEngineError::StorageOpen(format!("{} has no applied patch to revoke", object.name()))
    })?;

    let info = if applied.info.is_empty() {
        recover_applied_info(ctl, tid, applied.kpta + applied.header.user_info as u64)?
    } else {
        applied.info.clone()
    };

    driver.ensure_safety(ctl, tid, threads, coroutines, &info, Action::Revoke)?;

    let undo_base = applied.kpta + applied.header.user_undo as u64;
    let mut restored = 0;
    for (i, hunk) in info.iter().enumerate() {
        if hunk.is_new_function() || hunk.is_end() {
            continue;
        }
        if check_flag && !hunk.is_applied() {
            continue;
        }

        let undo_addr = undo_base + TRAMPOLINE_SIZE * i as u64;
        let original = ctl.mem_read(tid, undo_addr, TRAMPOLINE_SIZE as usize).map_err(PatchEngineError::MemRead)?;
        ctl.mem_write(tid, hunk.daddr, &original).map_err(PatchEngineError::MemWrite)?;
        restored += 1;
    }

    ctl.remote_munmap(tid, applied.kpta, applied.header.total_size as usize).map_err(PatchEngineError::MemWrite)?;

    object.applied = None;
    object.info.clear();
    object.jmp_table = None;
    object.kpta = 0;

    Ok(restored)
}

/// Reads the hunk table directly out of target memory at `remote_info`,
/// for an object whose `AppliedPatch.info` was never populated locally
/// (e.g. an unpatch driven purely by build-id, with no matching storage
/// blob read in this process's lifetime). Grows the buffer 16 records at a
/// time, the way the original scan does, and stops at the first sentinel.
pub(crate) fn recover_applied_info(ctl: &dyn ProcessControl, tid: Tid, remote_info: u64) -> Result<Vec<PatchHunk>, PatchEngineError> {
    let mut info = Vec::new();
    let mut addr = remote_info;

    loop {
        let bytes = ctl.mem_read(tid, addr, PatchHunk::SIZE).map_err(PatchEngineError::MemRead)?;
        let hunk = PatchHunk::parse(&bytes).ok_or_else(|| {
            PatchEngineError::StorageOpen(format!("malformed hunk record at {:#x}", addr))
        })?;
        if hunk.is_end() {
            break;
        }
        info.push(hunk);
        addr += PatchHunk::SIZE as u64;
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use patch_format::{PatchHeader, UNAME_SIZE};
    use proc_ctl::FakeControl;

    fn header(user_info: u32, user_undo: u32) -> PatchHeader {
        let mut h = PatchHeader {
            total_size: 4096,
            kpatch_offset: 0,
            user_info,
            user_undo,
            jmp_offset: 0,
            user_level: 1,
            uname: [0u8; UNAME_SIZE],
        };
        h.set_build_id("deadbeef");
        h
    }

    fn hunk(daddr: u64, saddr: u64, flags: u32) -> PatchHunk {
        PatchHunk { daddr, dlen: 5, saddr, slen: 5, flags }
    }

    #[test]
    fn restores_only_applied_hunks_under_check_flag() {
        let mut ctl = FakeControl::new(0x1000, 0x9000);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();

        let kpta = 0x4000;
        let user_undo = 0x1000;
        let h0 = hunk(0x2000, 0x9000, patch_format::PATCH_APPLIED);
        let h1 = hunk(0x2100, 0x9100, 0);

        ctl.mem_write(tid, kpta + user_undo as u64, &[0xaau8; 5]).unwrap();
        ctl.mem_write(tid, kpta + user_undo as u64 + TRAMPOLINE_SIZE, &[0xbbu8; 5]).unwrap();

        let mut object = ObjectFile::new("libfoo.so".into(), kpta, None);
        object.applied = Some(crate::process::AppliedPatch {
            kpta,
            header: header(0, user_undo),
            info: vec![h0, h1],
        });

        let driver = ActionDriver::default();
        let restored = revoke_object(&mut object, &mut ctl, tid, &driver, &[], &[], true).unwrap();

        assert_eq!(restored, 1);
        assert_eq!(ctl.mem_read(tid, 0x2000, 5).unwrap(), vec![0xaau8; 5]);
        // h1 was not applied and check_flag is set, so its bytes are untouched.
        assert_eq!(ctl.mem_read(tid, 0x2100, 5).unwrap(), vec![0u8; 5]);
        assert!(object.applied.is_none());
    }

    #[test]
    fn each_hunk_reads_its_own_fixed_undo_slot_regardless_of_skips() {
        // Three hunks, only the last is applied. The fixed-offset scheme
        // must still recover hunk 2's original bytes from slot 2, not
        // from the first free slot a cursor-based scan would land on.
        let mut ctl = FakeControl::new(0x1000, 0x9000);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();

        let kpta = 0x4000;
        let user_undo = 0x1000;
        let slot2 = kpta + user_undo as u64 + TRAMPOLINE_SIZE * 2;
        ctl.mem_write(tid, slot2, &[0xccu8; 5]).unwrap();

        let info = vec![
            hunk(0x2000, 0x9000, 0),
            hunk(0x2100, 0x9100, 0),
            hunk(0x2200, 0x9200, patch_format::PATCH_APPLIED),
        ];

        let mut object = ObjectFile::new("libfoo.so".into(), kpta, None);
        object.applied = Some(crate::process::AppliedPatch { kpta, header: header(0, user_undo), info });

        let driver = ActionDriver::default();
        revoke_object(&mut object, &mut ctl, tid, &driver, &[], &[], true).unwrap();

        assert_eq!(ctl.mem_read(tid, 0x2200, 5).unwrap(), vec![0xccu8; 5]);
    }
}
