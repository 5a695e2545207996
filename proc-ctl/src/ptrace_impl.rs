use std::time::{Duration, Instant};

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};

use crate::{CtlError, ProcessControl, Registers, Tid};

/// A `ProcessControl` backed by real Linux `ptrace(2)`/`process_vm_*`
/// syscalls.
#[derive(Default)]
pub struct PtraceControl;

impl PtraceControl {
    pub fn new() -> Self {
        Self
    }

    fn wait_stopped(&self, tid: Tid) -> Result<(), CtlError> {
        match waitpid(tid, Some(WaitPidFlag::WSTOPPED)) {
            Ok(WaitStatus::Stopped(_, _)) => Ok(()),
            Ok(_) => Ok(()),
            Err(e) => Err(CtlError::Wait(tid, e)),
        }
    }

    /// Injects and executes a single syscall in the target, returning its
    /// return value. Clobbers and restores the target's registers and a
    /// few bytes at its current instruction pointer.
    fn inject_syscall(&self, tid: Tid, nr: u64, args: [u64; 6]) -> Result<i64, CtlError> {
        let saved_regs = self.get_regs(tid)?;
        let saved_raw = get_raw_regs(tid)?;

        let pc = saved_regs.rip;
        let saved_code = self.mem_read(tid, pc, 2)?;
        // `syscall` (0x0f 0x05) followed by an int3 to trap right after.
        self.mem_write(tid, pc, &[0x0f, 0x05])?;

        let mut raw = saved_raw;
        raw.orig_rax = nr;
        raw.rax = nr;
        raw.rdi = args[0];
        raw.rsi = args[1];
        raw.rdx = args[2];
        raw.r10 = args[3];
        raw.r8 = args[4];
        raw.r9 = args[5];
        raw.rip = pc;
        set_raw_regs(tid, raw)?;

        // Single-step past the syscall instruction itself.
        ptrace::step(tid, None).map_err(|e| CtlError::Wait(tid, e))?;
        self.wait_stopped(tid)?;

        let result = get_raw_regs(tid)?.rax as i64;

        self.mem_write(tid, pc, &saved_code)?;
        set_raw_regs(tid, saved_raw)?;

        Ok(result)
    }
}

fn get_raw_regs(tid: Tid) -> Result<libc::user_regs_struct, CtlError> {
    ptrace::getregs(tid).map_err(|e| CtlError::GetRegs(tid, e))
}

fn set_raw_regs(tid: Tid, regs: libc::user_regs_struct) -> Result<(), CtlError> {
    ptrace::setregs(tid, regs).map_err(|e| CtlError::SetRegs(tid, e))
}

impl ProcessControl for PtraceControl {
    fn attach(&mut self, tid: Tid) -> Result<(), CtlError> {
        ptrace::attach(tid).map_err(|e| CtlError::Attach(tid, e))?;
        self.wait_stopped(tid)
    }

    fn detach(&mut self, tid: Tid) -> Result<(), CtlError> {
        ptrace::detach(tid, None).map_err(|e| CtlError::Detach(tid, e))
    }

    fn list_threads(&self, pid: Tid) -> Result<Vec<Tid>, CtlError> {
        let dir = format!("/proc/{}/task", pid);
        let entries = std::fs::read_dir(&dir).map_err(|e| CtlError::ListThreads(pid, e))?;
        let mut tids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CtlError::ListThreads(pid, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(raw) = name.parse::<i32>() {
                    tids.push(Pid::from_raw(raw));
                }
            }
        }
        tids.sort();
        Ok(tids)
    }

    fn mem_read(&self, tid: Tid, addr: u64, len: usize) -> Result<Vec<u8>, CtlError> {
        let mut buf = vec![0u8; len];
        let mut local = [IoSliceMut::new(&mut buf)];
        let remote = [RemoteIoVec { base: addr as usize, len }];
        process_vm_readv(tid, &mut local, &remote)
            .map_err(|source| CtlError::MemRead { tid, addr, len, source })?;
        Ok(buf)
    }

    fn mem_write(&self, tid: Tid, addr: u64, data: &[u8]) -> Result<(), CtlError> {
        let local = [IoSlice::new(data)];
        let remote = [RemoteIoVec { base: addr as usize, len: data.len() }];
        process_vm_writev(tid, &local, &remote)
            .map_err(|source| CtlError::MemWrite { tid, addr, len: data.len(), source })?;
        Ok(())
    }

    fn remote_mmap(&self, tid: Tid, near: u64, len: usize) -> Result<u64, CtlError> {
        const PROT_RWX: u64 = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64;
        const MAP_PRIVATE_ANON: u64 = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;

        let ret = self
            .inject_syscall(tid, libc::SYS_mmap as u64, [near, len as u64, PROT_RWX, MAP_PRIVATE_ANON, u64::MAX, 0])
            .map_err(|_| CtlError::Remap { near, source: nix::errno::Errno::UnknownErrno })?;

        if ret < 0 {
            return Err(CtlError::Remap { near, source: nix::errno::Errno::from_i32(-ret as i32) });
        }
        Ok(ret as u64)
    }

    fn remote_munmap(&self, tid: Tid, addr: u64, len: usize) -> Result<(), CtlError> {
        let ret = self
            .inject_syscall(tid, libc::SYS_munmap as u64, [addr, len as u64, 0, 0, 0, 0])
            .map_err(|_| CtlError::Unmap { addr, len, source: nix::errno::Errno::UnknownErrno })?;

        if ret < 0 {
            return Err(CtlError::Unmap { addr, len, source: nix::errno::Errno::from_i32(-ret as i32) });
        }
        Ok(())
    }

    fn get_regs(&self, tid: Tid) -> Result<Registers, CtlError> {
        get_raw_regs(tid).map(Registers::from)
    }

    fn set_regs(&self, tid: Tid, regs: &Registers) -> Result<(), CtlError> {
        let mut raw = get_raw_regs(tid)?;
        regs.apply_to(&mut raw);
        set_raw_regs(tid, raw)
    }

    fn execute_until(&self, tid: Tid, target_ip: u64, timeout: Duration) -> Result<(), CtlError> {
        let saved_byte = self.mem_read(tid, target_ip, 1)?;
        self.mem_write(tid, target_ip, &[0xcc])?;

        let deadline = Instant::now() + timeout;
        let result = (|| -> Result<(), CtlError> {
            loop {
                ptrace::cont(tid, None).map_err(|e| CtlError::Wait(tid, e))?;

                match waitpid(tid, Some(WaitPidFlag::WSTOPPED)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                        let mut raw = get_raw_regs(tid)?;
                        if raw.rip.wrapping_sub(1) == target_ip {
                            raw.rip -= 1;
                            set_raw_regs(tid, raw)?;
                            return Ok(());
                        }
                        // A breakpoint we didn't set; keep going.
                    }
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                        return Err(CtlError::DriveTimeout(tid, target_ip));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(CtlError::Wait(tid, e)),
                }

                if Instant::now() >= deadline {
                    return Err(CtlError::DriveTimeout(tid, target_ip));
                }
            }
        })();

        self.mem_write(tid, target_ip, &saved_byte)?;
        result
    }
}
