use object::{Object, ObjectSection};
use patch_format::PatchHunk;

use crate::RelocError;

const KPATCH_INFO_SECTION: &str = ".kpatch.info";

/// Reads the per-function hunk table out of the patch object's
/// `.kpatch.info` section. This is the same record shape `patch-format`
/// parses out of the on-disk blob header; here it is read directly from
/// the ELF section so resolve/relocate can walk it before the blob has
/// been laid out into its final in-memory form.
pub fn load_patch_info(elf: &object::File) -> Result<Vec<PatchHunk>, RelocError> {
    let section = elf
        .section_by_name(KPATCH_INFO_SECTION)
        .ok_or_else(|| RelocError::MissingSection(KPATCH_INFO_SECTION.to_string()))?;
    let data = section.data().map_err(RelocError::Object)?;

    if data.len() % PatchHunk::SIZE != 0 {
        return Err(RelocError::MalformedInfo(data.len()));
    }

    data.chunks_exact(PatchHunk::SIZE)
        .map(|chunk| PatchHunk::parse(chunk).ok_or(RelocError::MalformedInfo(chunk.len())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_short_trailing_record() {
        let data = vec![0u8; PatchHunk::SIZE + 3];
        let err = data.chunks_exact(PatchHunk::SIZE).count();
        // Sanity check on the chunking itself: a short remainder is
        // dropped by chunks_exact, so the length check above is what
        // actually guards against a truncated section.
        assert_eq!(err, 1);
    }
}
