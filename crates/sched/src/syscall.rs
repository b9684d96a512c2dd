//! The system-call table and the handlers the core provides.
//!
//! The number is taken from `rax` and arguments from `rdi`, `rsi`, `rdx`,
//! `r10`, `r8`, `r9`. A handler's result is written back to `rax`, errors as
//! a negative errno. An unregistered number is a program bug: the caller is
//! sent SIGSYS and `rax` is left untouched.

use alloc::{sync::Arc, vec::Vec};

use mm::{AddressSpace, FrameUsage, PAGE_SIZE, PageFlags, VirtualAddress};

use crate::{
    Device, Errno, Notification, OpenFile, OpenFlags, Pid, RegisterFrame, Scheduler, SigAction,
    Signal, ThreadHandle, WaitOptions, WaitOutcome, WaitPid, uaccess,
    user_stack::STACK_REGION_START,
};

/// Size of the table; numbers at or above it raise SIGSYS.
pub const SYSCALL_COUNT: usize = 64;

/// Largest single read or write copied through the kernel.
const MAX_IO: usize = 64 * 1024;

/// Anonymous mappings without a hint go at the lowest free range above this.
pub const MMAP_REGION_START: VirtualAddress = VirtualAddress::new(0x1000_0000_0000);

/// `select` timeout meaning "wait forever".
pub const NO_TIMEOUT: u64 = u64::MAX;

pub mod nr {
    pub const READ: usize = 0;
    pub const WRITE: usize = 1;
    pub const CLOSE: usize = 2;
    pub const DUP: usize = 3;
    pub const SELECT: usize = 4;
    pub const MMAP: usize = 5;
    pub const MUNMAP: usize = 6;
    pub const YIELD: usize = 7;
    pub const SLEEP: usize = 8;
    pub const GETPID: usize = 9;
    pub const GETPPID: usize = 10;
    pub const GETTID: usize = 11;
    pub const FORK: usize = 12;
    pub const EXIT: usize = 13;
    pub const WAIT4: usize = 14;
    pub const KILL: usize = 15;
    pub const SIGACTION: usize = 16;
    pub const SIGRETURN: usize = 17;
    pub const SETPGID: usize = 18;
    pub const GETPGID: usize = 19;
    pub const GETUID: usize = 20;
    pub const GETGID: usize = 21;
}

/// `mmap` protection bits.
pub mod prot {
    pub const READ: u64 = 1;
    pub const WRITE: u64 = 1 << 1;
    pub const EXEC: u64 = 1 << 2;
}

/// Everything a handler may touch.
pub struct SyscallContext<'a, 'mm> {
    pub scheduler: &'a Scheduler<'mm>,
    pub thread: ThreadHandle,
    pub pid: Pid,
    /// The caller's saved frame; `rax` receives the result.
    pub frame: &'a mut RegisterFrame,
    /// Gives up the CPU until the thread is scheduled again.
    pub yield_now: &'a mut dyn FnMut(),
}

impl SyscallContext<'_, '_> {
    fn arg(&self, n: usize) -> u64 {
        self.frame.arg(n)
    }

    fn space(&self) -> Arc<AddressSpace> {
        self.scheduler.with_process(self.pid, |p| p.space.clone())
    }

    fn file(&self, fd: u64) -> Result<Arc<OpenFile>, Errno> {
        let fd = usize::try_from(fd).map_err(|_| Errno::EBADF)?;
        Ok(self.scheduler.with_process(self.pid, |p| p.files.get(fd))?)
    }
}

pub type SyscallHandler = fn(&mut SyscallContext<'_, '_>) -> Result<usize, Errno>;

pub struct SyscallTable {
    handlers: [Option<SyscallHandler>; SYSCALL_COUNT],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl SyscallTable {
    pub const fn empty() -> Self {
        Self {
            handlers: [None; SYSCALL_COUNT],
        }
    }

    /// The table with every handler this crate implements.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        let handlers: [(usize, SyscallHandler); 22] = [
            (nr::READ, sys_read),
            (nr::WRITE, sys_write),
            (nr::CLOSE, sys_close),
            (nr::DUP, sys_dup),
            (nr::SELECT, sys_select),
            (nr::MMAP, sys_mmap),
            (nr::MUNMAP, sys_munmap),
            (nr::YIELD, sys_yield),
            (nr::SLEEP, sys_sleep),
            (nr::GETPID, sys_getpid),
            (nr::GETPPID, sys_getppid),
            (nr::GETTID, sys_gettid),
            (nr::FORK, sys_fork),
            (nr::EXIT, sys_exit),
            (nr::WAIT4, sys_wait4),
            (nr::KILL, sys_kill),
            (nr::SIGACTION, sys_sigaction),
            (nr::SIGRETURN, sys_sigreturn),
            (nr::SETPGID, sys_setpgid),
            (nr::GETPGID, sys_getpgid),
            (nr::GETUID, sys_getuid),
            (nr::GETGID, sys_getgid),
        ];
        for (number, handler) in handlers {
            table.register(number, handler);
        }
        table
    }

    /// # Panics
    ///
    /// Panics if `number` is out of range or already taken.
    pub fn register(&mut self, number: usize, handler: SyscallHandler) {
        let slot = match self.handlers.get_mut(number) {
            Some(slot) => slot,
            None => panic!("system call number {number} out of range"),
        };
        assert!(slot.is_none(), "system call {number} registered twice");
        *slot = Some(handler);
    }

    pub fn is_registered(&self, number: usize) -> bool {
        self.handlers.get(number).is_some_and(Option::is_some)
    }

    /// Runs the handler selected by `rax` and stores its result.
    pub fn dispatch(&self, ctx: &mut SyscallContext<'_, '_>) {
        let number = ctx.frame.syscall_number();
        let handler = usize::try_from(number)
            .ok()
            .and_then(|n| self.handlers.get(n).copied().flatten());
        let Some(handler) = handler else {
            log::debug!("process {}: undefined system call {number}", ctx.pid);
            ctx.scheduler.raise(ctx.thread, Signal::SIGSYS);
            return;
        };
        let result = handler(ctx);
        log::trace!("process {}: syscall {number} -> {result:?}", ctx.pid);
        ctx.frame.set_return(match result {
            Ok(value) => value as isize,
            Err(errno) => errno.as_return(),
        });
    }
}

fn io_len(len: u64) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX).min(MAX_IO)
}

fn sys_read(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let file = ctx.file(ctx.arg(0))?;
    let (buf, len) = (ctx.arg(1), io_len(ctx.arg(2)));
    uaccess::user_range(buf, len)?;
    let mut data = alloc::vec![0u8; len];
    loop {
        match file.read(&mut data) {
            Ok(count) => {
                uaccess::copy_to_user(&ctx.space(), buf, &data[..count])?;
                return Ok(count);
            }
            Err(Errno::EAGAIN) if !file.flags().contains(OpenFlags::NONBLOCK) => {
                let Device::Char(device) = file.device() else {
                    return Err(Errno::EAGAIN);
                };
                let ready = device.notification();
                if ctx.scheduler.try_wait_any(ctx.thread, &[ready], None, ctx.yield_now)?
                    == WaitOutcome::Interrupted
                {
                    return Err(Errno::EINTR);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn sys_write(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let file = ctx.file(ctx.arg(0))?;
    let mut data = alloc::vec![0u8; io_len(ctx.arg(2))];
    uaccess::copy_from_user(&ctx.space(), ctx.arg(1), &mut data)?;
    file.write(&data, ctx.scheduler)
}

fn sys_close(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let fd = usize::try_from(ctx.arg(0)).map_err(|_| Errno::EBADF)?;
    ctx.scheduler.with_process_mut(ctx.pid, |p| p.files.close(fd))?;
    Ok(0)
}

fn sys_dup(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let fd = usize::try_from(ctx.arg(0)).map_err(|_| Errno::EBADF)?;
    Ok(ctx.scheduler.with_process_mut(ctx.pid, |p| p.files.dup(fd))?)
}

/// `select(readfds, timeout_ns)`: waits until a descriptor in the bit mask
/// is readable and returns the mask of readable descriptors, or 0 on timeout.
fn sys_select(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let mask = ctx.arg(0);
    let timeout = ctx.arg(1);
    let files = (0..64u64)
        .filter(|&fd| mask & (1 << fd) != 0)
        .map(|fd| ctx.file(fd).map(|file| (fd, file)))
        .collect::<Result<Vec<_>, Errno>>()?;
    let readable = |files: &[(u64, Arc<OpenFile>)]| {
        files
            .iter()
            .filter(|(_, file)| file.is_readable())
            .fold(0u64, |acc, (fd, _)| acc | 1 << *fd)
    };

    let ready = readable(&files);
    if ready != 0 || timeout == 0 {
        return Ok(ready as usize);
    }
    let deadline = (timeout != NO_TIMEOUT).then(|| ctx.scheduler.now().saturating_add(timeout));
    let objects: Vec<&Notification> = files
        .iter()
        .filter_map(|(_, file)| match file.device() {
            Device::Char(device) => Some(device.notification()),
            Device::Block(_) => None,
        })
        .collect();
    match ctx.scheduler.try_wait_any(ctx.thread, &objects, deadline, ctx.yield_now)? {
        WaitOutcome::Interrupted => Err(Errno::EINTR),
        WaitOutcome::Ready(_) | WaitOutcome::TimedOut => Ok(readable(&files) as usize),
    }
}

/// `mmap(hint, length, prot)`: anonymous, private, zero-filled memory.
fn sys_mmap(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let (hint, length, protection) = (ctx.arg(0), ctx.arg(1), ctx.arg(2));
    let length = usize::try_from(length).map_err(|_| Errno::EINVAL)?;
    if length == 0 {
        return Err(Errno::EINVAL);
    }
    let pages = length.div_ceil(PAGE_SIZE);
    let low = if hint == 0 {
        MMAP_REGION_START
    } else {
        uaccess::user_range(hint, length)?.align_down(PAGE_SIZE)
    };

    let mut flags = PageFlags::USER;
    if protection & prot::WRITE != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if protection & prot::EXEC == 0 {
        flags |= PageFlags::NO_EXECUTE;
    }
    let space = ctx.space();
    let mm = ctx.scheduler.memory();
    let addr = space.find_free_range(low, STACK_REGION_START, pages)?;
    space.map_anonymous(mm, addr, pages, flags, FrameUsage::UserPrivate)?;
    Ok(addr.as_usize())
}

fn sys_munmap(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let (addr, length) = (ctx.arg(0), ctx.arg(1));
    let length = usize::try_from(length).map_err(|_| Errno::EINVAL)?;
    let start = uaccess::user_range(addr, length)?;
    if !start.is_page_aligned() || length == 0 {
        return Err(Errno::EINVAL);
    }
    let space = ctx.space();
    space.unmap_range(ctx.scheduler.memory(), start, length.next_multiple_of(PAGE_SIZE));
    Ok(0)
}

fn sys_yield(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    (ctx.yield_now)();
    Ok(0)
}

/// `sleep(ns)`.
fn sys_sleep(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let deadline = ctx.scheduler.now().saturating_add(ctx.arg(0));
    ctx.scheduler.sleep_until(ctx.thread, deadline, ctx.yield_now)?;
    Ok(0)
}

fn sys_getpid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    Ok(ctx.pid as usize)
}

fn sys_getppid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    Ok(ctx.scheduler.with_process(ctx.pid, |p| p.parent.unwrap_or(0)) as usize)
}

fn sys_gettid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    ctx.scheduler
        .with_thread(ctx.thread, |t| t.tid as usize)
        .ok_or(Errno::ESRCH)
}

fn sys_fork(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    Ok(ctx.scheduler.fork(ctx.thread, ctx.frame)? as usize)
}

fn sys_exit(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    ctx.scheduler.exit(ctx.thread, ctx.arg(0) as i32);
    (ctx.yield_now)();
    Ok(0)
}

/// `wait4(pid, status_ptr, options)`.
fn sys_wait4(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let (pid, status_ptr) = (ctx.arg(0) as i64, ctx.arg(1));
    let options = WaitOptions::from_bits(ctx.arg(2) as u32).ok_or(Errno::EINVAL)?;
    let pgid = ctx.scheduler.with_process(ctx.pid, |p| p.pgid);
    let filter = WaitPid::from_raw(pid, pgid);
    let Some((child, status)) = ctx.scheduler.wait(ctx.thread, filter, options, ctx.yield_now)?
    else {
        return Ok(0);
    };
    if status_ptr != 0 {
        uaccess::copy_to_user(&ctx.space(), status_ptr, &status.wait_status().to_le_bytes())?;
    }
    Ok(child as usize)
}

/// `kill(pid, signal)`: a positive pid names a process, 0 the caller's
/// group and a negative pid the group `-pid`.
fn sys_kill(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let (pid, number) = (ctx.arg(0) as i64, ctx.arg(1));
    let signal = match number {
        0 => None,
        n => Some(u8::try_from(n).ok().and_then(Signal::new).ok_or(Errno::EINVAL)?),
    };
    let scheduler = ctx.scheduler;
    match pid {
        p if p > 0 => scheduler.kill(ctx.pid, p as Pid, signal)?,
        0 => scheduler.kill_group(ctx.pid, scheduler.getpgid(ctx.pid, 0)?, signal)?,
        -1 => return Err(Errno::EINVAL),
        p => scheduler.kill_group(ctx.pid, p.unsigned_abs() as Pid, signal)?,
    }
    Ok(0)
}

/// User layout of a disposition: handler, mask, restorer, one word each.
const SIGACTION_SIZE: usize = 24;

fn read_sigaction(space: &AddressSpace, addr: u64) -> Result<SigAction, Errno> {
    let mut raw = [0u8; SIGACTION_SIZE];
    uaccess::copy_from_user(space, addr, &mut raw)?;
    let word = |i: usize| {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&raw[i * 8..i * 8 + 8]);
        u64::from_le_bytes(bytes)
    };
    Ok(SigAction::from_raw(word(0), word(1) as u32, word(2)))
}

fn write_sigaction(space: &AddressSpace, addr: u64, action: &SigAction) -> Result<(), Errno> {
    let mut raw = [0u8; SIGACTION_SIZE];
    let words = [
        action.raw_handler(),
        u64::from(action.mask.bits()),
        action.restorer,
    ];
    for (chunk, word) in raw.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    uaccess::copy_to_user(space, addr, &raw)
}

/// `sigaction(signal, new_ptr, old_ptr)`; either pointer may be null.
fn sys_sigaction(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let signal = u8::try_from(ctx.arg(0))
        .ok()
        .and_then(Signal::new)
        .ok_or(Errno::EINVAL)?;
    let (new_ptr, old_ptr) = (ctx.arg(1), ctx.arg(2));
    let space = ctx.space();
    let new = match new_ptr {
        0 => None,
        addr => Some(read_sigaction(&space, addr)?),
    };
    let old = ctx.scheduler.sigaction(ctx.pid, signal, new)?;
    if old_ptr != 0 {
        write_sigaction(&space, old_ptr, &old)?;
    }
    Ok(0)
}

fn sys_sigreturn(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    ctx.scheduler.sigreturn(ctx.thread, ctx.frame)?;
    // The restored frame's rax is what the interrupted code expects.
    Ok(ctx.frame.rax as usize)
}

fn sys_setpgid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let pid = Pid::try_from(ctx.arg(0)).map_err(|_| Errno::EINVAL)?;
    let pgid = Pid::try_from(ctx.arg(1)).map_err(|_| Errno::EINVAL)?;
    ctx.scheduler.setpgid(ctx.pid, pid, pgid)?;
    Ok(0)
}

fn sys_getpgid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    let pid = Pid::try_from(ctx.arg(0)).map_err(|_| Errno::ESRCH)?;
    Ok(ctx.scheduler.getpgid(ctx.pid, pid)? as usize)
}

fn sys_getuid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    Ok(ctx.scheduler.with_process(ctx.pid, |p| p.credentials.uid) as usize)
}

fn sys_getgid(ctx: &mut SyscallContext<'_, '_>) -> Result<usize, Errno> {
    Ok(ctx.scheduler.with_process(ctx.pid, |p| p.credentials.gid) as usize)
}
