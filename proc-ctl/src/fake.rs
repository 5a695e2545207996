use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use crate::{CtlError, ProcessControl, Registers, Tid};

/// A `ProcessControl` backed by a local scratch buffer instead of a traced
/// PID, so the safety verifier, action driver and apply/revoke engines can
/// be exercised without `CAP_SYS_PTRACE` against a real target.
#[derive(Default)]
pub struct FakeControl {
    memory: RefCell<Vec<u8>>,
    base: u64,
    regs: RefCell<HashMap<Tid, Registers>>,
    attached: RefCell<Vec<Tid>>,
}

impl FakeControl {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            memory: RefCell::new(vec![0u8; size]),
            base,
            regs: RefCell::new(HashMap::new()),
            attached: RefCell::new(Vec::new()),
        }
    }

    pub fn set_ip(&self, tid: Tid, ip: u64) {
        self.regs.borrow_mut().entry(tid).or_default().rip = ip;
    }

    fn offset(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, CtlError> {
        let fault = || CtlError::MemRead { tid: Tid::from_raw(0), addr, len, source: nix::errno::Errno::EFAULT };
        let off = addr.checked_sub(self.base).ok_or_else(fault)? as usize;
        if off + len > self.memory.borrow().len() {
            return Err(fault());
        }
        Ok(off..off + len)
    }
}

impl ProcessControl for FakeControl {
    fn attach(&mut self, tid: Tid) -> Result<(), CtlError> {
        self.attached.get_mut().push(tid);
        self.regs.get_mut().entry(tid).or_default();
        Ok(())
    }

    fn detach(&mut self, tid: Tid) -> Result<(), CtlError> {
        self.attached.get_mut().retain(|&t| t != tid);
        Ok(())
    }

    fn list_threads(&self, _pid: Tid) -> Result<Vec<Tid>, CtlError> {
        Ok(self.attached.borrow().clone())
    }

    fn mem_read(&self, tid: Tid, addr: u64, len: usize) -> Result<Vec<u8>, CtlError> {
        let _ = tid;
        let range = self.offset(addr, len)?;
        Ok(self.memory.borrow()[range].to_vec())
    }

    fn mem_write(&self, tid: Tid, addr: u64, data: &[u8]) -> Result<(), CtlError> {
        let _ = tid;
        let range = self.offset(addr, data.len())?;
        self.memory.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }

    fn remote_mmap(&self, _tid: Tid, near: u64, len: usize) -> Result<u64, CtlError> {
        let _ = len;
        Ok(near)
    }

    fn remote_munmap(&self, _tid: Tid, _addr: u64, _len: usize) -> Result<(), CtlError> {
        Ok(())
    }

    fn get_regs(&self, tid: Tid) -> Result<Registers, CtlError> {
        Ok(self.regs.borrow().get(&tid).copied().unwrap_or_default())
    }

    fn set_regs(&self, tid: Tid, regs: &Registers) -> Result<(), CtlError> {
        self.regs.borrow_mut().insert(tid, *regs);
        Ok(())
    }

    fn execute_until(&self, tid: Tid, target_ip: u64, _timeout: Duration) -> Result<(), CtlError> {
        self.regs.borrow_mut().entry(tid).or_default().rip = target_ip;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut ctl = FakeControl::new(0x1000, 64);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();
        ctl.mem_write(tid, 0x1010, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ctl.mem_read(tid, 0x1010, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn execute_until_moves_ip() {
        let mut ctl = FakeControl::new(0x1000, 64);
        let tid = Tid::from_raw(1);
        ctl.attach(tid).unwrap();
        ctl.set_ip(tid, 0x1000);
        ctl.execute_until(tid, 0x1020, Duration::from_secs(1)).unwrap();
        assert_eq!(ctl.get_regs(tid).unwrap().rip, 0x1020);
    }
}
