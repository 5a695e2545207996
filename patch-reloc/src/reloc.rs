use std::collections::HashMap;

use object::{Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget, SectionIndex};

use crate::jmp_table::JmpTable;
use crate::RelocError;

/// Applies every relocation in `elf` against `blob`, the patch region's
/// final in-memory copy.
///
/// `section_base` gives the absolute address each section of the patch
/// object was placed at (the apply engine already knows this from the
/// blob's layout, since the embedded object's sections were copied
/// verbatim starting at `kpatch_offset`). A relocation against a symbol
/// this object does not define is rewritten to target that symbol's
/// jump-table stub instead of the real address directly, keeping every
/// PC-relative displacement within i32 range regardless of how far the
/// real symbol lives.
///
/// `blob_base` is the absolute address `blob[0]` was mapped at (the same
/// `kpta` `section_base` is built from); every write site is computed as
/// an absolute address for the relocation math and then translated back
/// to a `blob`-relative offset before indexing, since `blob` is a local
/// byte buffer, not the remote mapping itself.
pub fn relocate(
    elf: &object::File,
    blob: &mut [u8],
    blob_base: u64,
    section_base: impl Fn(SectionIndex) -> u64,
    resolved: &HashMap<String, u64>,
    jmp_table: &JmpTable,
    jmp_table_base: u64,
) -> Result<(), RelocError> {
    for section in elf.sections() {
        let site_base = section_base(section.index());

        for (offset, reloc) in section.relocations() {
            let site = site_base + offset;

            let (direct_addr, stub_addr) = match reloc.target() {
                RelocationTarget::Symbol(index) => {
                    let symbol = elf.symbol_by_index(index).map_err(RelocError::Object)?;
                    let name = symbol.name().map_err(RelocError::Object)?;

                    if symbol.is_undefined() {
                        let addr = *resolved
                            .get(name)
                            .ok_or_else(|| RelocError::UndefinedSymbol(name.to_string()))?;
                        let slot = jmp_table
                            .slot_of(name)
                            .ok_or_else(|| RelocError::UndefinedSymbol(name.to_string()))?;
                        (addr, Some(jmp_table_base + jmp_table.slot_offset(slot)))
                    } else {
                        let target_section = symbol
                            .section_index()
                            .ok_or_else(|| RelocError::UnresolvedSymbol(name.to_string()))?;
                        (section_base(target_section) + symbol.address(), None)
                    }
                }
                RelocationTarget::Section(index) => (section_base(index), None),
                _ => return Err(RelocError::UnsupportedRelocation(reloc.kind(), site)),
            };

            let addend = reloc.addend();

            match reloc.kind() {
                RelocationKind::Absolute => {
                    let value = (direct_addr as i64).wrapping_add(addend) as u64;
                    write_at(blob, blob_base, site, &value.to_le_bytes())?;
                }
                RelocationKind::Relative | RelocationKind::PltRelative => {
                    let target = stub_addr.unwrap_or(direct_addr);
                    let value = (target as i64).wrapping_add(addend).wrapping_sub(site as i64);
                    let value: i32 = value
                        .try_into()
                        .map_err(|_| RelocError::UnsupportedRelocation(reloc.kind(), site))?;
                    write_at(blob, blob_base, site, &value.to_le_bytes())?;
                }
                other => return Err(RelocError::UnsupportedRelocation(other, site)),
            }
        }
    }

    Ok(())
}

/// `addr` is the absolute write site; `blob[0]` corresponds to `blob_base`,
/// so the actual index into `blob` is `addr - blob_base`.
fn write_at(blob: &mut [u8], blob_base: u64, addr: u64, bytes: &[u8]) -> Result<(), RelocError> {
    let start = addr.checked_sub(blob_base).ok_or(RelocError::OutOfBounds { addr, len: bytes.len() })? as usize;
    let end = start + bytes.len();
    blob.get_mut(start..end)
        .ok_or(RelocError::OutOfBounds { addr, len: bytes.len() })?
        .copy_from_slice(bytes);
    Ok(())
}
