use crate::UNAME_SIZE;

/// The fixed header every patch blob carries, immediately after the magic.
///
/// Field order and meaning follow libcare's `struct kpatch_file`: everything
/// after `total_size` is an offset relative to the start of the blob (the
/// magic + this header), except `uname`, which is the build-id this patch
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub total_size: u32,
    pub kpatch_offset: u32,
    pub user_info: u32,
    pub user_undo: u32,
    pub jmp_offset: u32,
    pub user_level: u32,
    pub uname: [u8; UNAME_SIZE],
}

impl PatchHeader {
    pub const SIZE: usize = 8 * 4 + UNAME_SIZE;

    /// Parses a header out of `buf`, which must start at the first byte
    /// after the 8-byte magic.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        let mut off = 0;
        let mut next_u32 = || {
            let v = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            v
        };

        let total_size = next_u32();
        let kpatch_offset = next_u32();
        let user_info = next_u32();
        let user_undo = next_u32();
        let jmp_offset = next_u32();
        let user_level = next_u32();

        let mut uname = [0u8; UNAME_SIZE];
        uname.copy_from_slice(&buf[off..off + UNAME_SIZE]);

        Some(Self {
            total_size,
            kpatch_offset,
            user_info,
            user_undo,
            jmp_offset,
            user_level,
            uname,
        })
    }

    /// Serializes the header back into its on-the-wire form.
    pub fn write_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::SIZE);
        let mut off = 0;
        for field in [
            self.total_size,
            self.kpatch_offset,
            self.user_info,
            self.user_undo,
            self.jmp_offset,
            self.user_level,
        ] {
            buf[off..off + 4].copy_from_slice(&field.to_ne_bytes());
            off += 4;
        }
        buf[off..off + UNAME_SIZE].copy_from_slice(&self.uname);
    }

    /// Build-id this patch targets, as recorded in `uname`.
    pub fn build_id(&self) -> &str {
        let nul = self.uname.iter().position(|&b| b == 0).unwrap_or(self.uname.len());
        std::str::from_utf8(&self.uname[..nul]).unwrap_or("")
    }

    pub fn set_build_id(&mut self, id: &str) {
        assert!(id.len() < UNAME_SIZE, "build-id too long for uname field");
        self.uname = [0u8; UNAME_SIZE];
        self.uname[..id.len()].copy_from_slice(id.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PatchHeader {
        let mut h = PatchHeader {
            total_size: 4096,
            kpatch_offset: PatchHeader::SIZE as u32,
            user_info: 100,
            user_undo: 200,
            jmp_offset: 300,
            user_level: 1,
            uname: [0; UNAME_SIZE],
        };
        h.set_build_id("abcdef0123456789");
        h
    }

    #[test]
    fn round_trips_through_bytes() {
        let h = sample();
        let mut buf = [0u8; PatchHeader::SIZE];
        h.write_into(&mut buf);
        let parsed = PatchHeader::parse(&buf).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.build_id(), "abcdef0123456789");
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(PatchHeader::parse(&[0u8; 4]).is_none());
    }
}
