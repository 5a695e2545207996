/// The subset of x86-64 general-purpose registers patch-engine cares about:
/// the instruction pointer (for safety checks and driving threads forward)
/// and the full set needed to save/restore around a remote syscall
/// injection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
    pub orig_rax: u64,
}

#[cfg(target_os = "linux")]
impl From<libc::user_regs_struct> for Registers {
    fn from(r: libc::user_regs_struct) -> Self {
        Self {
            rip: r.rip,
            rsp: r.rsp,
            rbp: r.rbp,
            rax: r.rax,
            rdi: r.rdi,
            rsi: r.rsi,
            rdx: r.rdx,
            r10: r.r10,
            r8: r.r8,
            r9: r.r9,
            orig_rax: r.orig_rax,
        }
    }
}

#[cfg(target_os = "linux")]
impl Registers {
    pub fn apply_to(&self, r: &mut libc::user_regs_struct) {
        r.rip = self.rip;
        r.rsp = self.rsp;
        r.rbp = self.rbp;
        r.rax = self.rax;
        r.rdi = self.rdi;
        r.rsi = self.rsi;
        r.rdx = self.rdx;
        r.r10 = self.r10;
        r.r8 = self.r8;
        r.r9 = self.r9;
        r.orig_rax = self.orig_rax;
    }
}
