use coroutine_scan::Coroutine;
use object::{Object, ObjectSection, SectionIndex};
use patch_format::{round_up, PatchHunk};
use patch_reloc::SymbolResolver;
use proc_ctl::{ProcessControl, Tid};

use crate::driver::ActionDriver;
use crate::error::PatchEngineError;
use crate::process::{AppliedPatch, ObjectFile};
use crate::safety::Action;
use crate::storage::PatchBlob;

const TRAMPOLINE_SIZE: u64 = 5;
const PAGE_SIZE: usize = 4096;
const KPATCH_INFO_SECTION: &str = ".kpatch.info";

/// Applies `blob` to `object`, mutating it in place with the working state
/// (duplicate bytes, hunk table, jump table, mapped address) an in-progress
/// apply needs, and returns the resulting `AppliedPatch` on success.
///
/// Follows spec.md §4.5's ordering exactly: duplicate, load info, layout,
/// allocate, resolve, relocate, write blob, write jump table, safety,
/// install trampolines.
///
/// Returns the number of hunks actually installed (excludes new-function
/// and end-sentinel records), for the caller's own reporting.
#[allow(clippy::too_many_arguments)]
pub fn apply_object(
    object: &mut ObjectFile,
    blob: &PatchBlob,
    ctl: &mut dyn ProcessControl,
    tid: Tid,
    resolver: &dyn SymbolResolver,
    driver: &ActionDriver,
    threads: &[Tid],
    coroutines: &[Coroutine],
) -> Result<usize, PatchEngineError> {
    // 1. Duplicate.
    let mut bytes = blob.bytes.clone();
    let header = blob.header;

    // 2. Load hunk info (pre-relocation; addresses are still placeholders
    // until step 5 fills them in via the section's own relocations).
    //
    // Parsed from a snapshot, not `bytes` itself: step 5 needs `elf`'s
    // metadata (section/symbol/relocation tables) alive at the same time
    // it mutably borrows `bytes` to write the relocated values, and
    // `object::File` ties its lifetime to whatever slice it parsed.
    let elf_snapshot = bytes.clone();
    let elf = object::File::parse(&elf_snapshot[header.kpatch_offset as usize..])?;
    let info_section = elf
        .section_by_name(KPATCH_INFO_SECTION)
        .ok_or_else(|| patch_reloc::RelocError::MissingSection(KPATCH_INFO_SECTION.to_string()))?;
    let (info_file_off, _) = info_section
        .file_range()
        .ok_or_else(|| patch_reloc::RelocError::MissingSection(KPATCH_INFO_SECTION.to_string()))?;
    let ninfo = patch_reloc::load_patch_info(&elf)?.len();

    // 3. Lay out the patch region.
    let undef = patch_reloc::count_undefined(&elf);
    let mut jmp_table = patch_reloc::new_jmp_table(undef);

    let mut sz = round_up(header.total_size as usize, 8);
    let jmp_offset = if undef > 0 {
        let offset = sz;
        sz = round_up(sz + jmp_table.size(), 128);
        Some(offset as u32)
    } else {
        None
    };
    let user_info = header.kpatch_offset as u64 + info_file_off;
    let user_undo = sz as u32;
    sz = round_up(sz + TRAMPOLINE_SIZE as usize * ninfo, 16);
    sz = round_up(sz, PAGE_SIZE);

    // 4. Allocate as close to the original code as possible (within ±2GiB
    // of every patched function, so the 5-byte relative trampoline and any
    // jump-table-relayed call both stay in range).
    let near = object.base;
    let kpta = ctl.remote_mmap(tid, near, sz).map_err(PatchEngineError::Remap)?;

    // 5. Resolve, then relocate.
    let resolved = patch_reloc::resolve(&elf, resolver, &mut jmp_table)?;
    let jmp_table_base = kpta + jmp_offset.unwrap_or(0) as u64;
    patch_reloc::relocate(
        &elf,
        &mut bytes,
        kpta,
        |index: SectionIndex| section_base(&elf, index, kpta, header.kpatch_offset as u64),
        &resolved,
        &jmp_table,
        jmp_table_base,
    )?;

    // Hunk addresses live inside `.kpatch.info`, which relocate() has just
    // mutated in place; re-read it now that daddr/saddr hold their final,
    // absolute, post-relocation values.
    let elf = object::File::parse(&bytes[header.kpatch_offset as usize..])?;
    let info = patch_reloc::load_patch_info(&elf)?;

    // 6. Write blob, then jump table.
    ctl.mem_write(tid, kpta, &bytes).map_err(PatchEngineError::MemWrite)?;
    if jmp_offset.is_some() {
        ctl.mem_write(tid, jmp_table_base, &jmp_table.to_bytes()).map_err(PatchEngineError::MemWrite)?;
    }

    // 7. Safety check before any byte of the target's original code moves.
    driver.ensure_safety(ctl, tid, threads, coroutines, &info, Action::Apply)?;

    // 8. Install trampolines.
    let mut applied_info = info.clone();
    let mut installed = 0;
    for (i, hunk) in applied_info.iter_mut().enumerate() {
        if hunk.is_new_function() || hunk.is_end() {
            continue;
        }
        install_trampoline(ctl, tid, kpta, user_undo, i, hunk)?;
        installed += 1;
    }

    let mut final_header = header;
    final_header.total_size = sz as u32;
    final_header.jmp_offset = jmp_offset.unwrap_or(0);
    final_header.user_info = user_info as u32;
    final_header.user_undo = user_undo;

    object.kpta = kpta;
    object.duplicate = Some(bytes);
    object.info = applied_info.clone();
    object.jmp_table = Some(jmp_table);
    object.applied = Some(AppliedPatch { kpta, header: final_header, info: applied_info });

    Ok(installed)
}

fn install_trampoline(
    ctl: &dyn ProcessControl,
    tid: Tid,
    kpta: u64,
    user_undo: u32,
    index: usize,
    hunk: &mut PatchHunk,
) -> Result<(), PatchEngineError> {
    let undo_addr = kpta + user_undo as u64 + TRAMPOLINE_SIZE * index as u64;
    let original = ctl.mem_read(tid, hunk.daddr, TRAMPOLINE_SIZE as usize).map_err(PatchEngineError::MemRead)?;
    ctl.mem_write(tid, undo_addr, &original).map_err(PatchEngineError::MemWrite)?;

    let rel32 = (hunk.saddr as i64 - hunk.daddr as i64 - TRAMPOLINE_SIZE as i64) as i32;
    let mut code = [0xe9u8, 0, 0, 0, 0];
    code[1..5].copy_from_slice(&rel32.to_le_bytes());
    ctl.mem_write(tid, hunk.daddr, &code).map_err(PatchEngineError::MemWrite)?;

    hunk.mark_applied();
    Ok(())
}

fn section_base(elf: &object::File, index: SectionIndex, kpta: u64, kpatch_offset: u64) -> u64 {
    elf.section_by_index(index)
        .ok()
        .and_then(|s| s.file_range())
        .map(|(offset, _)| kpta + kpatch_offset + offset)
        .unwrap_or(kpta)
}

/// Decides whether `live_level` (the currently-applied patch's level) needs
/// upgrading to `storage_level`. Per spec.md §4.5: live >= storage means the
/// object is already current or newer and apply is skipped.
pub fn needs_upgrade(live_level: u32, storage_level: u32) -> bool {
    live_level < storage_level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_is_needed_only_when_storage_is_newer() {
        assert!(!needs_upgrade(5, 3));
        assert!(!needs_upgrade(3, 3));
        assert!(needs_upgrade(2, 3));
    }
}
