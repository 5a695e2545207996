use crate::RelocError;

/// `ff 25 00000000` (`jmp *(%rip)`) followed by two bytes of padding and
/// the 8-byte absolute target, the same indirect-jump shape glibc's own
/// PLT stubs use. A `call`/`jmp rel32` into the start of a slot reaches any
/// 64-bit target regardless of how far the real symbol lives from the
/// patch region.
pub const JMP_ENTRY_SIZE: usize = 16;

/// A table of indirect-jump stubs for symbols the patch object references
/// but does not define. Allocated with its final slot count up front (from
/// [`count_undefined`](crate::count_undefined)) so the apply engine can
/// compute the patch region's total size before any symbol is resolved.
#[derive(Debug, Clone)]
pub struct JmpTable {
    slots: Vec<Option<(String, u64)>>,
}

impl JmpTable {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity] }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn size(&self) -> usize {
        self.slots.len() * JMP_ENTRY_SIZE
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Some((n, _)) if n == name))
    }

    /// Binds `name` to its first free slot, or returns the slot it already
    /// occupies if `resolve` has seen this symbol before.
    pub fn bind_next(&mut self, name: &str, addr: u64) -> Result<usize, RelocError> {
        if let Some(existing) = self.slot_of(name) {
            return Ok(existing);
        }
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| RelocError::JmpTableFull(name.to_string()))?;
        self.slots[idx] = Some((name.to_string(), addr));
        Ok(idx)
    }

    pub fn slot_offset(&self, index: usize) -> u64 {
        (index * JMP_ENTRY_SIZE) as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size()];
        for (i, slot) in self.slots.iter().enumerate() {
            let Some((_, addr)) = slot else { continue };
            let base = i * JMP_ENTRY_SIZE;
            out[base..base + 6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
            out[base + 8..base + 16].copy_from_slice(&addr.to_le_bytes());
        }
        out
    }
}

/// Allocates a jump table sized for `undef` undefined symbols, with every
/// slot unbound until [`resolve`](crate::resolve) fills it in.
pub fn new_jmp_table(undef: usize) -> JmpTable {
    JmpTable::new(undef)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_each_symbol_once() {
        let mut table = JmpTable::new(2);
        let a = table.bind_next("malloc", 0x1000).unwrap();
        let b = table.bind_next("free", 0x2000).unwrap();
        assert_eq!(table.bind_next("malloc", 0x1000).unwrap(), a);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_binding_past_capacity() {
        let mut table = JmpTable::new(1);
        table.bind_next("malloc", 0x1000).unwrap();
        assert!(table.bind_next("free", 0x2000).is_err());
    }

    #[test]
    fn encodes_stub_bytes_for_bound_slots_only() {
        let mut table = JmpTable::new(2);
        table.bind_next("malloc", 0x1122_3344_5566_7788).unwrap();
        let bytes = table.to_bytes();
        assert_eq!(&bytes[0..6], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[16..32], &[0u8; 16]);
    }
}
