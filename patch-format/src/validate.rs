use crate::{PatchHeader, KPATCH_FILE_MAGIC1};

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("blob does not start with the kpatch magic")]
    InvalidMagic,
    #[error("blob header reports total_size larger than the blob itself")]
    InvalidSize,
    #[error("embedded object at kpatch_offset is not a valid relocatable ELF image")]
    InvalidElf,
}

const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ET_REL: u16 = 1;
/// `sizeof(Elf64_Shdr)`, the platform GElf section-header entry size this
/// tool targets.
const ELF64_SHENTSIZE: u16 = 64;

/// Verifies the framing of a patch blob: magic, size, and the embedded
/// relocatable ELF object's header. Does not interpret sections or symbols;
/// that is `patch-reloc`'s job once this has passed.
pub fn verify(blob: &[u8]) -> Result<(), ValidateError> {
    if blob.len() < KPATCH_FILE_MAGIC1.len() || blob[..KPATCH_FILE_MAGIC1.len()] != KPATCH_FILE_MAGIC1 {
        return Err(ValidateError::InvalidMagic);
    }

    let header = PatchHeader::parse(&blob[KPATCH_FILE_MAGIC1.len()..]).ok_or(ValidateError::InvalidSize)?;
    if header.total_size as usize > blob.len() {
        return Err(ValidateError::InvalidSize);
    }

    let elf_off = header.kpatch_offset as usize;
    let elf = blob.get(elf_off..).ok_or(ValidateError::InvalidElf)?;
    verify_elf_header(elf)
}

fn verify_elf_header(elf: &[u8]) -> Result<(), ValidateError> {
    if elf.len() < 64 || elf[0..4] != ELFMAG {
        return Err(ValidateError::InvalidElf);
    }
    if elf[4] != ELFCLASS64 {
        return Err(ValidateError::InvalidElf);
    }

    let e_type = u16::from_le_bytes(elf[16..18].try_into().unwrap());
    if e_type != ET_REL {
        return Err(ValidateError::InvalidElf);
    }

    let e_shentsize = u16::from_le_bytes(elf[58..60].try_into().unwrap());
    if e_shentsize != ELF64_SHENTSIZE {
        return Err(ValidateError::InvalidElf);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PatchHeader;

    fn fake_elf_rel() -> Vec<u8> {
        let mut e = vec![0u8; 64];
        e[0..4].copy_from_slice(&ELFMAG);
        e[4] = ELFCLASS64;
        e[16..18].copy_from_slice(&ET_REL.to_le_bytes());
        e[58..60].copy_from_slice(&ELF64_SHENTSIZE.to_le_bytes());
        e
    }

    fn sample_blob(total_size_override: Option<u32>) -> Vec<u8> {
        let elf = fake_elf_rel();
        let kpatch_offset = (KPATCH_FILE_MAGIC1.len() + PatchHeader::SIZE) as u32;
        let mut header = PatchHeader {
            total_size: kpatch_offset + elf.len() as u32,
            kpatch_offset,
            user_info: 0,
            user_undo: 0,
            jmp_offset: 0,
            user_level: 0,
            uname: [0u8; crate::UNAME_SIZE],
        };
        header.set_build_id("deadbeef");
        if let Some(t) = total_size_override {
            header.total_size = t;
        }

        let mut blob = Vec::new();
        blob.extend_from_slice(&KPATCH_FILE_MAGIC1);
        let mut hbuf = [0u8; PatchHeader::SIZE];
        header.write_into(&mut hbuf);
        blob.extend_from_slice(&hbuf);
        blob.extend_from_slice(&elf);
        blob
    }

    #[test]
    fn accepts_well_formed_blob() {
        assert!(verify(&sample_blob(None)).is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = sample_blob(None);
        blob[0] = b'X';
        assert!(matches!(verify(&blob), Err(ValidateError::InvalidMagic)));
    }

    #[test]
    fn rejects_total_size_over_blob_len() {
        let blob = sample_blob(Some(u32::MAX));
        assert!(matches!(verify(&blob), Err(ValidateError::InvalidSize)));
    }

    #[test]
    fn rejects_non_relocatable_elf() {
        let mut blob = sample_blob(None);
        let kpatch_offset = PatchHeader::parse(&blob[KPATCH_FILE_MAGIC1.len()..]).unwrap().kpatch_offset as usize;
        blob[kpatch_offset + 16] = 2; // ET_EXEC
        assert!(matches!(verify(&blob), Err(ValidateError::InvalidElf)));
    }

    #[test]
    fn total_size_exactly_file_size_is_boundary_ok() {
        let blob = sample_blob(None);
        assert_eq!(PatchHeader::parse(&blob[KPATCH_FILE_MAGIC1.len()..]).unwrap().total_size as usize, blob.len());
        assert!(verify(&blob).is_ok());
    }
}
