use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use patch_format::{BuildId, PatchHeader};

use crate::error::PatchEngineError;

/// A validated patch blob: the raw bytes plus its parsed header, shared
/// (via `Arc`) between the storage cache and every `ObjectFile` looking it
/// up during a single process-patch operation.
pub struct PatchBlob {
    pub bytes: Vec<u8>,
    pub header: PatchHeader,
}

impl PatchBlob {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, PatchEngineError> {
        patch_format::verify(&bytes)?;
        let header = PatchHeader::parse(&bytes[patch_format::KPATCH_FILE_MAGIC1.len()..])
            .expect("verify() already checked the header parses");
        Ok(Self { bytes, header })
    }

    pub fn build_id(&self) -> &str {
        self.header.build_id()
    }
}

pub enum FindResult {
    Found(Arc<PatchBlob>),
    /// A patch exists for this build-id but `want_bytes` was false, so only
    /// a `fstatat`-equivalent existence check was performed.
    Exists,
    NotFound,
}

enum Backing {
    SingleFile(Arc<PatchBlob>),
    Directory { root: PathBuf, cache: BTreeMap<BuildId, Arc<PatchBlob>> },
}

/// Either a single validated blob, or a directory hierarchy of
/// per-build-id patches with an in-memory lookup cache. See spec §4.2.
pub struct Storage {
    backing: Backing,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, PatchEngineError> {
        let metadata = std::fs::metadata(path).map_err(|e| PatchEngineError::StorageOpen(e.to_string()))?;

        let backing = if metadata.is_dir() {
            Backing::Directory { root: path.to_path_buf(), cache: BTreeMap::new() }
        } else {
            let bytes = std::fs::read(path).map_err(|e| PatchEngineError::StorageOpen(e.to_string()))?;
            Backing::SingleFile(Arc::new(PatchBlob::parse(bytes)?))
        };

        Ok(Self { backing })
    }

    pub fn find(&mut self, build_id: &BuildId, want_bytes: bool) -> Result<FindResult, PatchEngineError> {
        match &mut self.backing {
            Backing::SingleFile(blob) => {
                if blob.build_id() != build_id.as_str() {
                    return Ok(FindResult::NotFound);
                }
                Ok(if want_bytes { FindResult::Found(blob.clone()) } else { FindResult::Exists })
            }
            Backing::Directory { root, cache } => {
                if let Some(blob) = cache.get(build_id) {
                    return Ok(FindResult::Found(blob.clone()));
                }

                for candidate in directory_templates(root, build_id) {
                    match std::fs::symlink_metadata(&candidate) {
                        Ok(_) => {
                            if !want_bytes {
                                return Ok(FindResult::Exists);
                            }
                            let bytes = std::fs::read(&candidate)
                                .map_err(|e| PatchEngineError::StorageOpen(e.to_string()))?;
                            let blob = Arc::new(PatchBlob::parse(bytes)?);
                            cache.insert(build_id.clone(), blob.clone());
                            return Ok(FindResult::Found(blob));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(PatchEngineError::StorageOpen(e.to_string())),
                    }
                }

                Ok(FindResult::NotFound)
            }
        }
    }

    pub fn close(self) {
        // Cache and any open file descriptors are dropped with `self`.
    }
}

/// `<bid>/latest/kpatch.bin` (symlinked to the decimal patch-level
/// directory) before `<bid>.kpatch` (flat), per spec.md's priority order.
fn directory_templates(root: &Path, build_id: &BuildId) -> [PathBuf; 2] {
    [
        root.join(build_id.as_str()).join("latest").join("kpatch.bin"),
        root.join(format!("{}.kpatch", build_id.as_str())),
    ]
}

/// Reads the decimal patch-level a `<bid>/latest` symlink points at.
/// Not called on the hot lookup path: the level actually patched is the
/// one recorded in the resolved blob's own `user_level` header field, so
/// this exists only to surface the directory-layout convention for
/// diagnostics and the `info` verb.
pub fn resolve_symlinked_level(bid_dir: &Path) -> Result<u32, PatchEngineError> {
    let target = std::fs::read_link(bid_dir.join("latest"))
        .map_err(|e| PatchEngineError::StorageOpen(e.to_string()))?;
    target
        .to_string_lossy()
        .parse::<u32>()
        .map_err(|_| PatchEngineError::StorageOpen(format!("non-numeric patch level symlink: {:?}", target)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_elf_rel() -> Vec<u8> {
        let mut e = vec![0u8; 64];
        e[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        e[4] = 2;
        e[16..18].copy_from_slice(&1u16.to_le_bytes());
        e[58..60].copy_from_slice(&64u16.to_le_bytes());
        e
    }

    fn sample_blob(build_id: &str) -> Vec<u8> {
        let elf = fake_elf_rel();
        let kpatch_offset = (patch_format::KPATCH_FILE_MAGIC1.len() + PatchHeader::SIZE) as u32;
        let mut header = PatchHeader {
            total_size: kpatch_offset + elf.len() as u32,
            kpatch_offset,
            user_info: 0,
            user_undo: 0,
            jmp_offset: 0,
            user_level: 1,
            uname: [0u8; patch_format::UNAME_SIZE],
        };
        header.set_build_id(build_id);

        let mut blob = Vec::new();
        blob.extend_from_slice(&patch_format::KPATCH_FILE_MAGIC1);
        let mut hbuf = [0u8; PatchHeader::SIZE];
        header.write_into(&mut hbuf);
        blob.extend_from_slice(&hbuf);
        blob.extend_from_slice(&elf);
        blob
    }

    #[test]
    fn single_file_store_matches_by_build_id() {
        let blob = PatchBlob::parse(sample_blob("deadbeef")).unwrap();
        let mut storage = Storage { backing: Backing::SingleFile(Arc::new(blob)) };

        assert!(matches!(
            storage.find(&BuildId::new("deadbeef"), true).unwrap(),
            FindResult::Found(_)
        ));
        assert!(matches!(
            storage.find(&BuildId::new("cafef00d"), true).unwrap(),
            FindResult::NotFound
        ));
    }

    #[test]
    fn directory_store_finds_flat_file_and_caches_it() {
        let dir = std::env::temp_dir().join(format!("patch-engine-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("deadbeef.kpatch"), sample_blob("deadbeef")).unwrap();

        let mut storage = Storage::open(&dir).unwrap();
        let bid = BuildId::new("deadbeef");
        assert!(matches!(storage.find(&bid, true).unwrap(), FindResult::Found(_)));
        // Second lookup is served from the cache; the file could be deleted
        // here and this would still succeed, but asserting the variant is
        // enough to exercise the cache-hit path.
        assert!(matches!(storage.find(&bid, true).unwrap(), FindResult::Found(_)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
