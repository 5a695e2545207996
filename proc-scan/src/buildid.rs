use std::path::Path;

use object::{Object, ObjectSection};
use patch_format::BuildId;

use crate::ScanError;

/// Reads the `.note.gnu.build-id` section of an ELF object on disk and
/// extracts the build-id payload it carries.
pub fn get_buildid(path: &Path) -> Result<BuildId, ScanError> {
    let data = std::fs::read(path).map_err(|e| ScanError::Io(path.to_path_buf(), e))?;
    let file = object::File::parse(&*data).map_err(|e| ScanError::Object(path.to_path_buf(), e))?;

    let section = file
        .section_by_name(".note.gnu.build-id")
        .ok_or_else(|| ScanError::NoBuildId(path.to_path_buf()))?;
    let note_data = section.data().map_err(|e| ScanError::Object(path.to_path_buf(), e))?;

    parse_build_id_note(note_data).ok_or_else(|| ScanError::NoBuildId(path.to_path_buf()))
}

/// Parses the `Elf64_Nhdr`-style note: `namesz`, `descsz`, `type`, name
/// (padded to 4 bytes), then the description bytes (the build-id itself).
fn parse_build_id_note(data: &[u8]) -> Option<BuildId> {
    if data.len() < 12 {
        return None;
    }
    let namesz = u32::from_ne_bytes(data[0..4].try_into().ok()?) as usize;
    let descsz = u32::from_ne_bytes(data[4..8].try_into().ok()?) as usize;

    let name_start = 12;
    let name_end = name_start + namesz;
    let desc_start = patch_format::round_up(name_end, 4);
    let desc_end = desc_start + descsz;

    let desc = data.get(desc_start..desc_end)?;
    Some(BuildId::from_bytes(desc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_note(name: &[u8], desc: &[u8]) -> Vec<u8> {
        let mut note = Vec::new();
        note.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        note.extend_from_slice(&(desc.len() as u32).to_ne_bytes());
        note.extend_from_slice(&0u32.to_ne_bytes()); // NT_GNU_BUILD_ID
        note.extend_from_slice(name);
        while note.len() % 4 != 0 {
            note.push(0);
        }
        note.extend_from_slice(desc);
        note
    }

    #[test]
    fn parses_a_well_formed_note() {
        let note = build_note(b"GNU\0", &[0xde, 0xad, 0xbe, 0xef]);
        let id = parse_build_id_note(&note).unwrap();
        assert_eq!(id.as_str(), "deadbeef");
    }

    #[test]
    fn rejects_truncated_note() {
        assert!(parse_build_id_note(&[0u8; 4]).is_none());
    }
}
