//! Per-CPU round-robin scheduling, the sleep list and the process tree.
//!
//! Locks are always taken in this order, and any prefix of it may be skipped:
//!
//! 1. `processes`
//! 2. `threads`
//! 3. a CPU's ready queue
//! 4. a CPU's slot (current and idle thread)
//! 5. `sleepers`
//!
//! Notification objects are leaves: they are signalled only after every
//! scheduler lock has been released, because signalling wakes a thread and
//! waking takes `threads`.

use alloc::{collections::BTreeMap, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use ksync::IrqSpinlock;
use mm::{AddressSpace, MemoryManager};

use crate::{
    Arena, Credentials, Delivery, Errno, ExitStatus, INIT_PID, KERNEL_PID, Notification, Pid,
    Process, ProcessState, RegisterFrame, SigAction, Signal, SignalSet, Thread, ThreadHandle,
    ThreadState, Tid, Waker, resolve, uaccess,
};

/// Bytes below the interrupted stack pointer a signal frame leaves untouched.
const RED_ZONE: u64 = 128;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        const NOHANG = 1;
    }
}

/// Which children a `wait` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPid {
    Any,
    Pid(Pid),
    Group(Pid),
}

impl WaitPid {
    /// Decodes the `wait4` pid argument; 0 means the caller's own group.
    pub fn from_raw(pid: i64, caller_pgid: Pid) -> Self {
        match pid {
            -1 => WaitPid::Any,
            0 => WaitPid::Group(caller_pgid),
            p if p > 0 => WaitPid::Pid(p as Pid),
            p => WaitPid::Group(p.unsigned_abs() as Pid),
        }
    }

    fn matches(self, process: &Process) -> bool {
        match self {
            WaitPid::Any => true,
            WaitPid::Pid(pid) => process.pid == pid,
            WaitPid::Group(pgid) => process.pgid == pgid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The notification at this index had a nonzero value.
    Ready(usize),
    TimedOut,
    /// A signal became deliverable.
    Interrupted,
}

/// The context a CPU resumes after [`Scheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub thread: ThreadHandle,
    /// Address of the saved frame to pop.
    pub sp: usize,
    /// Kernel stack used on the next ring 3 to ring 0 transition.
    pub kernel_stack_top: usize,
}

#[derive(Debug, Default)]
struct CpuSlot {
    current: Option<ThreadHandle>,
    idle: Option<ThreadHandle>,
}

#[derive(Debug, Default)]
struct PerCpu {
    ready: IrqSpinlock<VecDeque<ThreadHandle>>,
    slot: IrqSpinlock<CpuSlot>,
    /// Set for a CPU that never came online; `add` skips it.
    offline: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct Sleeper {
    thread: ThreadHandle,
    deadline: u64,
}

type Processes = BTreeMap<Pid, Process>;

fn process<'p>(processes: &'p Processes, pid: Pid) -> &'p Process {
    match processes.get(&pid) {
        Some(process) => process,
        None => panic!("process {pid} does not exist"),
    }
}

fn process_mut<'p>(processes: &'p mut Processes, pid: Pid) -> &'p mut Process {
    match processes.get_mut(&pid) {
        Some(process) => process,
        None => panic!("process {pid} does not exist"),
    }
}

pub struct Scheduler<'mm> {
    mm: &'mm MemoryManager,
    processes: IrqSpinlock<Processes>,
    threads: IrqSpinlock<Arena<Thread>>,
    cpus: Vec<PerCpu>,
    sleepers: IrqSpinlock<Vec<Sleeper>>,
    clock: AtomicU64,
    next_pid: AtomicU32,
    next_tid: AtomicU32,
    shutting_down: AtomicBool,
}

impl<'mm> Scheduler<'mm> {
    /// Creates a scheduler for `cpus` processors. The kernel process (pid 0)
    /// owns `kernel_space`.
    pub fn new(cpus: usize, mm: &'mm MemoryManager, kernel_space: Arc<AddressSpace>) -> Self {
        assert!(cpus > 0, "scheduler needs at least one CPU");
        let mut processes = BTreeMap::new();
        processes.insert(KERNEL_PID, Process::new(KERNEL_PID, None, kernel_space));
        log::debug!("scheduler: {cpus} CPUs");
        Self {
            mm,
            processes: IrqSpinlock::new(processes),
            threads: IrqSpinlock::new(Arena::new()),
            cpus: (0..cpus).map(|_| PerCpu::default()).collect(),
            sleepers: IrqSpinlock::new(Vec::new()),
            clock: AtomicU64::new(0),
            next_pid: AtomicU32::new(INIT_PID),
            next_tid: AtomicU32::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn memory(&self) -> &'mm MemoryManager {
        self.mm
    }

    /// Allows init to exit without bringing the kernel down.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// System time as last reported by [`tick`](Self::tick).
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn alloc_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    // Thread and process creation

    fn spawn(&self, pid: Pid, build_frame: impl FnOnce(usize) -> RegisterFrame) -> ThreadHandle {
        let tid = self.alloc_tid();
        let mut processes = self.processes.lock();
        let mut threads = self.threads.lock();
        let process = process_mut(&mut processes, pid);
        let handle = threads.insert(Thread::new(tid, pid, build_frame));
        process.threads.push(handle);
        log::trace!("thread {tid} ({handle:?}) created in process {pid}");
        handle
    }

    /// Creates a ring 0 thread running `entry(arg)` in the kernel process.
    /// The thread is ready but runs only once it is added to a queue.
    pub fn create_kernel_thread(&self, entry: u64, arg: u64) -> ThreadHandle {
        let cr3 = self.with_process(KERNEL_PID, |p| p.space.root().as_u64());
        self.spawn(KERNEL_PID, |stack_top| {
            RegisterFrame::new_kernel(entry, arg, stack_top as u64, cr3)
        })
    }

    /// Creates a process owning `space`. The first process created is init.
    pub fn create_process(&self, parent: Option<Pid>, space: AddressSpace) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let mut processes = self.processes.lock();
        let mut process = Process::new(pid, parent, Arc::new(space));
        if let Some(parent) = parent {
            let parent = process_mut(&mut processes, parent);
            parent.children.push(pid);
            process.pgid = parent.pgid;
            process.credentials = parent.credentials;
        }
        processes.insert(pid, process);
        log::debug!("process {pid} created (parent {parent:?})");
        pid
    }

    /// Creates a ring 3 thread of `pid` entering `entry` with `user_stack`.
    pub fn create_user_thread(&self, pid: Pid, entry: u64, user_stack: u64) -> ThreadHandle {
        let cr3 = self.with_process(pid, |p| p.space.root().as_u64());
        self.spawn(pid, |_| RegisterFrame::new_user(entry, user_stack, cr3))
    }

    /// Makes `thread` the fallback of `cpu` when its queue is empty.
    pub fn set_idle(&self, cpu: usize, thread: ThreadHandle) {
        let mut threads = self.threads.lock();
        let t = &mut threads[thread];
        t.idle = true;
        t.cpu = cpu;
        self.cpus[cpu].slot.lock().idle = Some(thread);
    }

    // Queues

    /// Enqueues `thread` on a specific CPU.
    pub fn add_to(&self, cpu: usize, thread: ThreadHandle) {
        let mut threads = self.threads.lock();
        let t = &mut threads[thread];
        assert!(!t.idle, "idle threads are never queued");
        assert_eq!(t.state, ThreadState::Ready, "only ready threads can be queued");
        t.cpu = cpu;
        self.cpus[cpu].ready.lock().push_back(thread);
        log::trace!("thread {} queued on CPU {cpu}", t.tid);
    }

    /// Enqueues `thread` on the online CPU with the shortest queue; ties go
    /// to the lowest-numbered CPU.
    pub fn add(&self, thread: ThreadHandle) -> usize {
        let cpu = self
            .cpus
            .iter()
            .enumerate()
            .filter(|(_, cpu)| !cpu.offline.load(Ordering::Acquire))
            .min_by_key(|(index, cpu)| (cpu.ready.lock().len(), *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        self.add_to(cpu, thread);
        cpu
    }

    /// Unlinks `thread` from its CPU's queue and stops it.
    ///
    /// # Panics
    ///
    /// Panics if the thread belongs to init and no shutdown was requested.
    pub fn remove(&self, thread: ThreadHandle) {
        let mut threads = self.threads.lock();
        let Some(t) = threads.get_mut(thread) else {
            return;
        };
        if t.pid == INIT_PID && !self.is_shutting_down() {
            panic!("attempted to remove thread {} of init (pid {INIT_PID})", t.tid);
        }
        if t.state == ThreadState::Ready {
            self.cpus[t.cpu].ready.lock().retain(|&h| h != thread);
        }
        t.state = ThreadState::Stopped;
    }

    /// Takes a CPU that failed to start out of load balancing and moves
    /// anything already queued on it elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if this would leave no CPU online.
    pub fn set_offline(&self, cpu: usize) {
        self.cpus[cpu].offline.store(true, Ordering::Release);
        assert!(
            self.cpus.iter().any(|c| !c.offline.load(Ordering::Acquire)),
            "every CPU is offline"
        );
        let stranded: Vec<ThreadHandle> = self.cpus[cpu].ready.lock().drain(..).collect();
        for thread in stranded {
            self.add(thread);
        }
        log::warn!("CPU {cpu} is offline");
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        !self.cpus[cpu].offline.load(Ordering::Acquire)
    }

    pub fn queue_len(&self, cpu: usize) -> usize {
        self.cpus[cpu].ready.lock().len()
    }

    pub fn queued(&self, cpu: usize) -> Vec<ThreadHandle> {
        self.cpus[cpu].ready.lock().iter().copied().collect()
    }

    pub fn current(&self, cpu: usize) -> Option<ThreadHandle> {
        self.cpus[cpu].slot.lock().current
    }

    /// Runs `f` on `thread`, or returns `None` if the handle is stale.
    pub fn with_thread<R>(&self, thread: ThreadHandle, f: impl FnOnce(&Thread) -> R) -> Option<R> {
        self.threads.lock().get(thread).map(f)
    }

    pub fn thread_state(&self, thread: ThreadHandle) -> Option<ThreadState> {
        self.with_thread(thread, |t| t.state)
    }

    /// # Panics
    ///
    /// Panics if `pid` does not exist.
    pub fn with_process<R>(&self, pid: Pid, f: impl FnOnce(&Process) -> R) -> R {
        f(process(&self.processes.lock(), pid))
    }

    /// # Panics
    ///
    /// Panics if `pid` does not exist.
    pub fn with_process_mut<R>(&self, pid: Pid, f: impl FnOnce(&mut Process) -> R) -> R {
        f(process_mut(&mut self.processes.lock(), pid))
    }

    pub fn process_exists(&self, pid: Pid) -> bool {
        self.processes.lock().contains_key(&pid)
    }

    // Context switching

    /// Picks the next thread for `cpu`.
    ///
    /// `sp` is where the trap stub saved the current thread's frame; it is
    /// ignored when the CPU has no current thread yet. A running current
    /// thread goes to the back of the queue. Before a candidate is selected
    /// one pending signal is delivered to it; if that terminates it, the
    /// next candidate is tried. With an empty queue the CPU's idle thread runs.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty and `cpu` has no idle thread.
    pub fn schedule(&self, cpu: usize, sp: usize) -> Switch {
        let per_cpu = &self.cpus[cpu];
        let mut notify = Vec::new();

        let previous = per_cpu.slot.lock().current.take();
        if let Some(previous) = previous {
            let processes = self.processes.lock();
            let mut threads = self.threads.lock();
            if let Some(t) = threads.get_mut(previous) {
                t.save_context(sp);
                t.on_cpu = false;
                match t.state {
                    ThreadState::Running => {
                        t.state = ThreadState::Ready;
                        if !t.idle {
                            per_cpu.ready.lock().push_back(previous);
                        }
                    }
                    // The parent may be waiting for this thread to leave the CPU.
                    ThreadState::Stopped => {
                        let parent = processes.get(&t.pid).and_then(|p| p.parent);
                        if let Some(parent) = parent.and_then(|pid| processes.get(&pid)) {
                            notify.push(parent.child_exit.clone());
                        }
                    }
                    ThreadState::Ready | ThreadState::Blocked => {}
                }
            }
        }

        let switch = loop {
            let candidate = per_cpu.ready.lock().pop_front();
            let Some(next) = candidate.or_else(|| per_cpu.slot.lock().idle) else {
                panic!("CPU {cpu} has no runnable thread and no idle thread");
            };

            let mut processes = self.processes.lock();
            let mut threads = self.threads.lock();
            let Some(t) = threads.get(next) else {
                continue;
            };
            if !t.idle {
                if t.state != ThreadState::Ready {
                    continue;
                }
                if self.deliver_signal(&mut processes, &mut threads, next, &mut notify) {
                    continue;
                }
            }

            let t = &mut threads[next];
            t.state = ThreadState::Running;
            t.on_cpu = true;
            t.cpu = cpu;
            per_cpu.slot.lock().current = Some(next);
            break Switch {
                thread: next,
                sp: t.saved_sp,
                kernel_stack_top: t.kernel_stack_top(),
            };
        };

        for notification in notify {
            notification.signal(self);
        }
        switch
    }

    /// Delivers at most one pending signal to `thread`. Returns whether the
    /// thread's process was terminated by it.
    fn deliver_signal(
        &self,
        processes: &mut Processes,
        threads: &mut Arena<Thread>,
        thread: ThreadHandle,
        notify: &mut Vec<Arc<Notification>>,
    ) -> bool {
        let t = &mut threads[thread];
        let deliverable = t.deliverable();
        let signal = if deliverable.contains(Signal::SIGKILL) {
            Signal::SIGKILL
        } else {
            match deliverable.first() {
                Some(signal) => signal,
                None => return false,
            }
        };
        t.pending.remove(signal);
        let pid = t.pid;
        let delivery = resolve(signal, process(processes, pid).action(signal));

        match delivery {
            Delivery::Discard => {
                log::trace!("signal {signal:?} discarded by process {pid}");
                false
            }
            Delivery::Terminate => {
                self.terminate(processes, threads, pid, ExitStatus::Signaled(signal), notify);
                true
            }
            Delivery::RunHandler(action) => {
                let space = process(processes, pid).space.clone();
                if Self::enter_handler(&space, &mut threads[thread], signal, &action).is_ok() {
                    return false;
                }
                log::debug!("process {pid}: cannot push signal frame for {signal:?}");
                self.terminate(
                    processes,
                    threads,
                    pid,
                    ExitStatus::Signaled(Signal::SIGSEGV),
                    notify,
                );
                true
            }
        }
    }

    /// Redirects the thread's saved user frame into the handler. The
    /// interrupted frame is kept for `sigreturn`; the handler returns to
    /// `action.restorer`, which is pushed as its return address.
    fn enter_handler(
        space: &AddressSpace,
        thread: &mut Thread,
        signal: Signal,
        action: &SigAction,
    ) -> Result<(), Errno> {
        let saved = *thread.frame();
        if !saved.is_user() {
            return Ok(());
        }
        let sp = (saved.rsp.wrapping_sub(RED_ZONE) & !0xF).wrapping_sub(8);
        uaccess::write_u64(space, sp, action.restorer)?;

        let mut blocked = thread.blocked.union(action.mask);
        blocked.insert(signal);
        blocked.remove(Signal::SIGKILL);
        blocked.remove(Signal::SIGSTOP);
        thread.signal_frames.push((saved, thread.blocked));
        thread.blocked = blocked;

        let frame = thread.frame_mut();
        frame.rip = action.raw_handler();
        frame.rdi = u64::from(signal.number());
        frame.rsp = sp;
        log::trace!("thread {} enters handler for {signal:?}", thread.tid);
        Ok(())
    }

    // Blocking and waking

    fn wake_locked(&self, threads: &mut Arena<Thread>, thread: ThreadHandle) {
        let Some(t) = threads.get_mut(thread) else {
            return;
        };
        match t.state {
            ThreadState::Blocked => {
                t.state = ThreadState::Ready;
                if t.idle {
                    return;
                }
                self.cpus[t.cpu].ready.lock().push_back(thread);
            }
            ThreadState::Running => t.wakeup_pending = true,
            ThreadState::Ready | ThreadState::Stopped => {}
        }
    }

    /// Makes a blocked thread ready on its CPU. Waking a running thread
    /// makes its next block return immediately.
    pub fn wake(&self, thread: ThreadHandle) {
        self.wake_locked(&mut self.threads.lock(), thread);
    }

    /// Marks `thread` blocked. Returns false, without blocking, if a wake
    /// arrived since the thread last looked.
    pub fn block(&self, thread: ThreadHandle) -> bool {
        let mut threads = self.threads.lock();
        let t = &mut threads[thread];
        if core::mem::take(&mut t.wakeup_pending) {
            return false;
        }
        if t.state == ThreadState::Running {
            t.state = ThreadState::Blocked;
        }
        true
    }

    /// Advances system time and readies every sleeper whose deadline passed.
    pub fn tick(&self, now: u64) {
        self.clock.fetch_max(now, Ordering::AcqRel);
        let now = self.now();
        let expired: Vec<ThreadHandle> = {
            let mut sleepers = self.sleepers.lock();
            let mut expired = Vec::new();
            sleepers.retain(|sleeper| {
                let due = sleeper.deadline <= now;
                if due {
                    expired.push(sleeper.thread);
                }
                !due
            });
            expired
        };
        for thread in expired {
            self.wake(thread);
        }
    }

    pub fn is_sleeping(&self, thread: ThreadHandle) -> bool {
        self.sleepers.lock().iter().any(|s| s.thread == thread)
    }

    fn unlink_sleeper(&self, thread: ThreadHandle) {
        self.sleepers.lock().retain(|s| s.thread != thread);
    }

    /// Whether `thread` has a signal that should interrupt a blocking wait.
    pub fn has_pending_signal(&self, thread: ThreadHandle) -> bool {
        self.threads
            .lock()
            .get(thread)
            .is_some_and(|t| !t.deliverable().is_empty())
    }

    /// Blocks `thread` until one of `objects` has a nonzero value, the
    /// deadline passes, or a signal arrives. Signals are rechecked on every
    /// iteration. `yield_now` must give up the CPU; it returns once the
    /// thread runs again.
    ///
    /// The caller consumes the value of the object that fired.
    pub fn wait_any(
        &self,
        thread: ThreadHandle,
        objects: &[&Notification],
        deadline: Option<u64>,
        yield_now: &mut dyn FnMut(),
    ) -> WaitOutcome {
        loop {
            for object in objects {
                object.register(thread);
            }
            let outcome = if self.has_pending_signal(thread) {
                Some(WaitOutcome::Interrupted)
            } else if let Some(index) = objects.iter().position(|o| o.value() > 0) {
                Some(WaitOutcome::Ready(index))
            } else if deadline.is_some_and(|d| self.now() >= d) {
                Some(WaitOutcome::TimedOut)
            } else {
                None
            };
            if let Some(outcome) = outcome {
                for object in objects {
                    object.unregister(thread);
                }
                self.unlink_sleeper(thread);
                return outcome;
            }

            if let Some(deadline) = deadline {
                let mut sleepers = self.sleepers.lock();
                if !sleepers.iter().any(|s| s.thread == thread) {
                    sleepers.push(Sleeper { thread, deadline });
                }
            }
            if self.block(thread) {
                yield_now();
            }
        }
    }

    /// [`wait_any`](Self::wait_any) for waits requested by user space. If
    /// another thread already waits on one of `objects`, nothing is
    /// registered and the result is `EBUSY`.
    pub fn try_wait_any(
        &self,
        thread: ThreadHandle,
        objects: &[&Notification],
        deadline: Option<u64>,
        yield_now: &mut dyn FnMut(),
    ) -> Result<WaitOutcome, Errno> {
        for (i, object) in objects.iter().enumerate() {
            if let Err(err) = object.try_register(thread) {
                for claimed in &objects[..i] {
                    claimed.unregister(thread);
                }
                return Err(err);
            }
        }
        // Registrations hold until `wait_any` returns, so no other thread
        // can slip in between.
        Ok(self.wait_any(thread, objects, deadline, yield_now))
    }

    /// Sleeps until system time reaches `deadline`.
    pub fn sleep_until(
        &self,
        thread: ThreadHandle,
        deadline: u64,
        yield_now: &mut dyn FnMut(),
    ) -> Result<(), Errno> {
        match self.wait_any(thread, &[], Some(deadline), yield_now) {
            WaitOutcome::Interrupted => Err(Errno::EINTR),
            _ => Ok(()),
        }
    }

    // Signals

    /// Marks `signal` pending on a thread of `pid` that does not block it
    /// and wakes that thread. Signals the process ignores are dropped.
    fn post_signal(
        &self,
        processes: &Processes,
        threads: &mut Arena<Thread>,
        pid: Pid,
        signal: Signal,
    ) {
        let target = process(processes, pid);
        if target.is_zombie() {
            return;
        }
        if resolve(signal, target.action(signal)) == Delivery::Discard {
            return;
        }
        let chosen = target
            .threads
            .iter()
            .copied()
            .find(|&h| threads.get(h).is_some_and(|t| !t.blocked.contains(signal)))
            .or_else(|| target.threads.first().copied());
        let Some(chosen) = chosen else {
            return;
        };
        let t = &mut threads[chosen];
        t.pending.insert(signal);
        if t.deliverable().contains(signal) {
            self.wake_locked(threads, chosen);
        }
    }

    /// Makes `signal` pending on one specific thread, such as the sender of
    /// a faulting system call.
    pub fn raise(&self, thread: ThreadHandle, signal: Signal) {
        let mut threads = self.threads.lock();
        if let Some(t) = threads.get_mut(thread) {
            t.pending.insert(signal);
        }
    }

    /// Sends `signal` from `sender` to `target`; `None` only checks that the
    /// target exists and may be signalled.
    pub fn kill(&self, sender: Pid, target: Pid, signal: Option<Signal>) -> Result<(), Errno> {
        let processes = self.processes.lock();
        let credentials = process(&processes, sender).credentials;
        let receiver = processes.get(&target).ok_or(Errno::ESRCH)?;
        if target == KERNEL_PID || !credentials.may_signal(&receiver.credentials) {
            return Err(Errno::EPERM);
        }
        if let Some(signal) = signal {
            log::trace!("process {sender} sends {signal:?} to {target}");
            self.post_signal(&processes, &mut self.threads.lock(), target, signal);
        }
        Ok(())
    }

    /// Sends `signal` to every member of a process group the sender may signal.
    pub fn kill_group(&self, sender: Pid, pgid: Pid, signal: Option<Signal>) -> Result<(), Errno> {
        let processes = self.processes.lock();
        let credentials = process(&processes, sender).credentials;
        let members: Vec<Pid> = processes
            .values()
            .filter(|p| p.pgid == pgid && p.pid != KERNEL_PID)
            .map(|p| p.pid)
            .collect();
        if members.is_empty() {
            return Err(Errno::ESRCH);
        }
        let permitted: Vec<Pid> = members
            .into_iter()
            .filter(|&pid| credentials.may_signal(&process(&processes, pid).credentials))
            .collect();
        if permitted.is_empty() {
            return Err(Errno::EPERM);
        }
        if let Some(signal) = signal {
            let mut threads = self.threads.lock();
            for pid in permitted {
                self.post_signal(&processes, &mut threads, pid, signal);
            }
        }
        Ok(())
    }

    /// Installs a disposition, returning the previous one.
    pub fn sigaction(
        &self,
        pid: Pid,
        signal: Signal,
        action: Option<SigAction>,
    ) -> Result<SigAction, Errno> {
        let mut processes = self.processes.lock();
        let target = process_mut(&mut processes, pid);
        let old = *target.action(signal);
        if let Some(action) = action {
            if signal.is_unblockable() {
                return Err(Errno::EINVAL);
            }
            target.actions[usize::from(signal.number())] = action;
        }
        Ok(old)
    }

    /// Replaces the blocked set, never blocking SIGKILL or SIGSTOP.
    pub fn set_blocked(&self, thread: ThreadHandle, mut blocked: SignalSet) -> SignalSet {
        blocked.remove(Signal::SIGKILL);
        blocked.remove(Signal::SIGSTOP);
        let mut threads = self.threads.lock();
        core::mem::replace(&mut threads[thread].blocked, blocked)
    }

    /// Restores the frame interrupted by the innermost signal handler.
    pub fn sigreturn(&self, thread: ThreadHandle, frame: &mut RegisterFrame) -> Result<(), Errno> {
        let mut threads = self.threads.lock();
        let t = &mut threads[thread];
        let (saved, blocked) = t.signal_frames.pop().ok_or(Errno::EINVAL)?;
        *frame = saved;
        t.blocked = blocked;
        Ok(())
    }

    // Process lifecycle

    /// Stops every thread of `pid`, turns it into a zombie, hands its
    /// children to init and tells the parent.
    fn terminate(
        &self,
        processes: &mut Processes,
        threads: &mut Arena<Thread>,
        pid: Pid,
        status: ExitStatus,
        notify: &mut Vec<Arc<Notification>>,
    ) {
        if pid == KERNEL_PID {
            panic!("the kernel process cannot terminate ({status:?})");
        }
        if pid == INIT_PID && !self.is_shutting_down() {
            panic!("init (pid {INIT_PID}) terminated: {status:?}");
        }
        let target = process_mut(processes, pid);
        if target.is_zombie() {
            return;
        }

        for &handle in &target.threads {
            let Some(t) = threads.get_mut(handle) else {
                continue;
            };
            if t.state == ThreadState::Ready {
                self.cpus[t.cpu].ready.lock().retain(|&h| h != handle);
            }
            t.state = ThreadState::Stopped;
            t.pending = SignalSet::EMPTY;
            t.wakeup_pending = false;
        }
        self.sleepers
            .lock()
            .retain(|s| !target.threads.contains(&s.thread));
        target.state = ProcessState::Zombie(status);
        target.files.close_all();
        let orphans = core::mem::take(&mut target.children);
        let parent = target.parent;
        log::debug!("process {pid} terminated: {status:?}");

        let adopter = processes.contains_key(&INIT_PID).then_some(INIT_PID).filter(|&init| init != pid);
        for &child in &orphans {
            let orphan = process_mut(processes, child);
            orphan.parent = adopter;
            let zombie = orphan.is_zombie();
            if let Some(init) = adopter {
                let init = process_mut(processes, init);
                init.children.push(child);
                if zombie {
                    notify.push(init.child_exit.clone());
                }
            }
        }

        if let Some(parent) = parent {
            notify.push(process(processes, parent).child_exit.clone());
            self.post_signal(processes, threads, parent, Signal::SIGCHLD);
        }
    }

    /// Terminates the calling thread's process with an exit code.
    pub fn exit(&self, thread: ThreadHandle, code: i32) {
        let mut notify = Vec::new();
        {
            let mut processes = self.processes.lock();
            let mut threads = self.threads.lock();
            let pid = threads[thread].pid;
            self.terminate(&mut processes, &mut threads, pid, ExitStatus::Exited(code), &mut notify);
        }
        for notification in notify {
            notification.signal(self);
        }
    }

    /// Duplicates the calling process. The child gets a forked address
    /// space, a copy of the descriptor table and dispositions, and a single
    /// thread resuming from `frame` with `rax = 0`.
    pub fn fork(&self, thread: ThreadHandle, frame: &RegisterFrame) -> Result<Pid, Errno> {
        let (pid, space) = {
            let processes = self.processes.lock();
            let threads = self.threads.lock();
            let pid = threads[thread].pid;
            (pid, process(&processes, pid).space.clone())
        };
        if pid == KERNEL_PID {
            return Err(Errno::EPERM);
        }
        let child_space = AddressSpace::fork(self.mm, &space)?;
        let child_pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let tid = self.alloc_tid();

        let mut child_frame = *frame;
        child_frame.rax = 0;
        child_frame.cr3 = child_space.root().as_u64();

        let handle = {
            let mut processes = self.processes.lock();
            let mut threads = self.threads.lock();
            let parent = process_mut(&mut processes, pid);
            let mut child = Process::new(child_pid, Some(pid), Arc::new(child_space));
            child.files = parent.files.clone();
            child.credentials = parent.credentials;
            child.pgid = parent.pgid;
            child.actions = parent.actions;
            parent.children.push(child_pid);

            let (blocked, signal_frames) = {
                let t = &threads[thread];
                (t.blocked, t.signal_frames.clone())
            };
            let mut child_thread = Thread::new(tid, child_pid, |_| child_frame);
            child_thread.blocked = blocked;
            child_thread.signal_frames = signal_frames;
            let handle = threads.insert(child_thread);
            child.threads.push(handle);
            processes.insert(child_pid, child);
            handle
        };
        self.add(handle);
        log::debug!("process {pid} forked {child_pid}");
        Ok(child_pid)
    }

    /// Removes a zombie from the tree and frees its threads. Returns its
    /// address space for the caller to destroy outside the locks.
    fn reap(
        processes: &mut Processes,
        threads: &mut Arena<Thread>,
        pid: Pid,
    ) -> (ExitStatus, Arc<AddressSpace>) {
        let Some(zombie) = processes.remove(&pid) else {
            panic!("reaping unknown process {pid}");
        };
        let ProcessState::Zombie(status) = zombie.state else {
            panic!("reaping live process {pid}");
        };
        if let Some(parent) = zombie.parent.and_then(|p| processes.get_mut(&p)) {
            parent.children.retain(|&c| c != pid);
        }
        for handle in zombie.threads {
            threads.remove(handle);
        }
        (status, zombie.space)
    }

    /// Waits for a child matching `filter` to become a zombie and reaps it.
    /// With `NOHANG`, returns `Ok(None)` instead of blocking.
    pub fn wait(
        &self,
        thread: ThreadHandle,
        filter: WaitPid,
        options: WaitOptions,
        yield_now: &mut dyn FnMut(),
    ) -> Result<Option<(Pid, ExitStatus)>, Errno> {
        loop {
            let child_exit = {
                let mut processes = self.processes.lock();
                let mut threads = self.threads.lock();
                let pid = threads[thread].pid;
                let caller = process(&processes, pid);
                let matching: Vec<Pid> = caller
                    .children
                    .iter()
                    .copied()
                    .filter(|c| processes.get(c).is_some_and(|p| filter.matches(p)))
                    .collect();
                if matching.is_empty() {
                    return Err(Errno::ECHILD);
                }
                let reapable = matching.into_iter().find(|c| {
                    let child = process(&processes, *c);
                    child.is_zombie()
                        && child
                            .threads
                            .iter()
                            .all(|&h| threads.get(h).is_none_or(|t| !t.on_cpu))
                });
                if let Some(child) = reapable {
                    let (status, space) = Self::reap(&mut processes, &mut threads, child);
                    drop(threads);
                    drop(processes);
                    match Arc::try_unwrap(space) {
                        Ok(space) => space.destroy(self.mm),
                        Err(_) => log::warn!("address space of process {child} still in use; not freed"),
                    }
                    log::debug!("process {pid} reaped {child}: {status:?}");
                    return Ok(Some((child, status)));
                }
                if options.contains(WaitOptions::NOHANG) {
                    return Ok(None);
                }
                caller.child_exit.clone()
            };
            match self.wait_any(thread, &[&*child_exit], None, yield_now) {
                WaitOutcome::Interrupted => return Err(Errno::EINTR),
                _ => {
                    child_exit.consume();
                }
            }
        }
    }

    /// Moves `target` (0 for the caller) into group `pgid` (0 for its own pid).
    pub fn setpgid(&self, caller: Pid, target: Pid, pgid: Pid) -> Result<(), Errno> {
        let target = if target == 0 { caller } else { target };
        let pgid = if pgid == 0 { target } else { pgid };
        let mut processes = self.processes.lock();
        let allowed = target == caller || process(&processes, caller).children.contains(&target);
        if !allowed {
            return Err(Errno::ESRCH);
        }
        let joined = processes.get_mut(&target).ok_or(Errno::ESRCH)?;
        joined.pgid = pgid;
        Ok(())
    }

    pub fn getpgid(&self, caller: Pid, target: Pid) -> Result<Pid, Errno> {
        let target = if target == 0 { caller } else { target };
        self.processes
            .lock()
            .get(&target)
            .map(|p| p.pgid)
            .ok_or(Errno::ESRCH)
    }

    pub fn set_credentials(&self, pid: Pid, credentials: Credentials) {
        self.with_process_mut(pid, |p| p.credentials = credentials);
    }

    /// Prepares the calling thread for a new program image: caught signals
    /// revert to their defaults and the frame enters `entry` on `user_stack`.
    pub fn exec_reset(
        &self,
        thread: ThreadHandle,
        frame: &mut RegisterFrame,
        entry: u64,
        user_stack: u64,
    ) {
        let mut processes = self.processes.lock();
        let mut threads = self.threads.lock();
        let t = &mut threads[thread];
        let owner = process_mut(&mut processes, t.pid);
        owner.reset_handlers();
        t.signal_frames.clear();
        *frame = RegisterFrame::new_user(entry, user_stack, owner.space.root().as_u64());
    }

    /// The process owning `thread`.
    pub fn pid_of(&self, thread: ThreadHandle) -> Pid {
        self.threads.lock()[thread].pid
    }
}

impl Waker for Scheduler<'_> {
    fn wake(&self, thread: ThreadHandle) {
        Scheduler::wake(self, thread);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mm::{
        AddressTranslator, FrameAllocator, FrameUsage, MemoryRegion, PAGE_SIZE, PageFlags,
        PageTablePool, PhysicalAddress, VirtualAddress,
    };

    const POOL_PAGES: usize = 128;
    const MEMORY: usize = 4 * 1024 * 1024;

    pub(crate) const USER_STACK_TOP: u64 = 0x7000_0000;
    pub(crate) const HANDLER: u64 = 0x40_1000;
    pub(crate) const RESTORER: u64 = 0x40_2000;

    pub(crate) fn setup_mm() -> &'static MemoryManager {
        AddressTranslator::set_current(AddressTranslator::emulated(MEMORY));
        let pool_base = AddressTranslator::current()
            .allocate(POOL_PAGES * PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        let pool = PageTablePool::new(pool_base, POOL_PAGES);
        let frames = FrameAllocator::new(
            &[MemoryRegion::usable(PhysicalAddress::new(0), MEMORY)],
            pool.end(),
        );
        Box::leak(Box::new(MemoryManager::new(frames, pool)))
    }

    pub(crate) fn scheduler(cpus: usize) -> Scheduler<'static> {
        let mm = setup_mm();
        let kernel = AddressSpace::new(mm).unwrap();
        Scheduler::new(cpus, mm, Arc::new(kernel))
    }

    /// Gives every CPU an idle thread.
    pub(crate) fn with_idle(s: &Scheduler<'_>) {
        for cpu in 0..s.cpu_count() {
            let idle = s.create_kernel_thread(0xFFFF_8000_0000_1000, cpu as u64);
            s.set_idle(cpu, idle);
        }
    }

    /// Creates init with one user thread whose stack page is mapped.
    pub(crate) fn init_process(s: &Scheduler<'_>) -> (Pid, ThreadHandle) {
        let space = AddressSpace::new(s.memory()).unwrap();
        space
            .map_anonymous(
                s.memory(),
                VirtualAddress::new(USER_STACK_TOP as usize - PAGE_SIZE),
                1,
                PageFlags::WRITABLE | PageFlags::USER,
                FrameUsage::UserPrivate,
            )
            .unwrap();
        let pid = s.create_process(None, space);
        let thread = s.create_user_thread(pid, 0x40_0000, USER_STACK_TOP);
        (pid, thread)
    }

    /// Schedules on `cpu` until `thread` is current; returns its switch.
    pub(crate) fn run(s: &Scheduler<'_>, cpu: usize, thread: ThreadHandle) -> Switch {
        for _ in 0..16 {
            let sp = current_sp(s, cpu);
            let switch = s.schedule(cpu, sp);
            if switch.thread == thread {
                return switch;
            }
        }
        panic!("{thread:?} never got CPU {cpu}");
    }

    pub(crate) fn current_sp(s: &Scheduler<'_>, cpu: usize) -> usize {
        s.current(cpu)
            .and_then(|h| s.with_thread(h, |t| t.saved_sp))
            .unwrap_or(0)
    }

    mod queues {
        use super::*;

        #[test]
        fn add_balances_across_cpus() {
            let s = scheduler(2);
            let a = s.create_kernel_thread(0x1000, 0);
            let b = s.create_kernel_thread(0x1000, 1);
            assert_eq!(s.add(a), 0);
            assert_eq!(s.add(b), 1);
            assert_eq!(s.queue_len(0), 1);
            assert_eq!(s.queue_len(1), 1);
        }

        #[test]
        fn add_to_pins() {
            let s = scheduler(4);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add_to(3, t);
            assert_eq!(s.queued(3), vec![t]);
            assert_eq!(s.with_thread(t, |t| t.cpu), Some(3));
        }

        #[test]
        fn offline_cpus_are_skipped_and_drained() {
            let s = scheduler(3);
            let pinned = s.create_kernel_thread(0x1000, 0);
            s.add_to(1, pinned);
            s.set_offline(1);
            assert!(!s.is_online(1));
            assert_eq!(s.queue_len(1), 0);
            assert_eq!(s.queued(0), vec![pinned]);

            let t = s.create_kernel_thread(0x1000, 1);
            assert_eq!(s.add(t), 2);
        }

        #[test]
        #[should_panic(expected = "every CPU is offline")]
        fn last_cpu_cannot_go_offline() {
            let s = scheduler(1);
            s.set_offline(0);
        }

        #[test]
        fn remove_unlinks() {
            let s = scheduler(1);
            let a = s.create_kernel_thread(0x1000, 0);
            let b = s.create_kernel_thread(0x1000, 0);
            s.add(a);
            s.add(b);
            s.remove(a);
            assert_eq!(s.queued(0), vec![b]);
            assert_eq!(s.thread_state(a), Some(ThreadState::Stopped));
        }

        #[test]
        #[should_panic(expected = "of init")]
        fn removing_init_panics() {
            let s = scheduler(1);
            let (_, thread) = init_process(&s);
            s.add(thread);
            s.remove(thread);
        }

        #[test]
        fn removing_init_during_shutdown_is_allowed() {
            let s = scheduler(1);
            let (_, thread) = init_process(&s);
            s.add(thread);
            s.begin_shutdown();
            s.remove(thread);
            assert_eq!(s.queue_len(0), 0);
        }
    }

    mod scheduling {
        use super::*;

        #[test]
        fn round_robin_visits_every_thread() {
            let s = scheduler(1);
            with_idle(&s);
            let threads: Vec<_> = (0..4).map(|i| s.create_kernel_thread(0x1000, i)).collect();
            for &t in &threads {
                s.add_to(0, t);
            }

            let mut sp = 0;
            let mut order = Vec::new();
            for _ in 0..threads.len() * 2 {
                let switch = s.schedule(0, sp);
                order.push(switch.thread);
                sp = switch.sp;
            }
            assert_eq!(order[..4], threads[..]);
            assert_eq!(order[4..], threads[..]);
        }

        #[test]
        fn empty_queue_runs_idle() {
            let s = scheduler(2);
            with_idle(&s);
            let idle = s.schedule(1, 0);
            assert!(s.with_thread(idle.thread, Thread::is_idle).unwrap());

            // The idle thread is not queued when preempted.
            let again = s.schedule(1, idle.sp);
            assert_eq!(again.thread, idle.thread);
            assert_eq!(s.queue_len(1), 0);
        }

        #[test]
        #[should_panic(expected = "no idle thread")]
        fn no_idle_thread_panics() {
            let s = scheduler(1);
            s.schedule(0, 0);
        }

        #[test]
        fn switch_reports_saved_frame_and_stack() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0xFFFF_8000_0020_0000, 9);
            s.add(t);
            let switch = s.schedule(0, 0);
            assert_eq!(switch.thread, t);
            let frame = unsafe { &*(switch.sp as *const RegisterFrame) };
            assert_eq!(frame.rip, 0xFFFF_8000_0020_0000);
            assert_eq!(frame.rdi, 9);
            assert_eq!(frame.rsp, switch.kernel_stack_top as u64 - 8);
            assert_eq!(s.thread_state(t), Some(ThreadState::Running));
            assert_eq!(s.current(0), Some(t));
        }

        #[test]
        fn blocked_thread_is_not_requeued() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add(t);
            let running = s.schedule(0, 0);
            assert!(s.block(t));
            let next = s.schedule(0, running.sp);
            assert_ne!(next.thread, t);
            assert_eq!(s.queue_len(0), 0);

            s.wake(t);
            assert_eq!(s.queued(0), vec![t]);
        }

        #[test]
        fn wake_while_running_cancels_the_next_block() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add(t);
            s.schedule(0, 0);
            s.wake(t);
            assert!(!s.block(t));
            assert_eq!(s.thread_state(t), Some(ThreadState::Running));
        }
    }

    mod sleeping {
        use super::*;

        #[test]
        fn sleeper_wakes_at_its_deadline_and_not_before() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add(t);
            s.schedule(0, 0);

            let mut yields = 0;
            let result = s.sleep_until(t, 100, &mut || {
                yields += 1;
                let idle = s.schedule(0, current_sp(&s, 0));
                assert_ne!(idle.thread, t);

                s.tick(50);
                assert_eq!(s.thread_state(t), Some(ThreadState::Blocked));
                s.tick(99);
                assert_eq!(s.thread_state(t), Some(ThreadState::Blocked));
                assert!(s.is_sleeping(t));

                s.tick(100);
                assert_eq!(s.thread_state(t), Some(ThreadState::Ready));
                assert!(!s.is_sleeping(t));
                assert_eq!(s.schedule(0, idle.sp).thread, t);
            });
            assert_eq!(result, Ok(()));
            assert_eq!(yields, 1);
        }

        #[test]
        fn past_deadline_returns_immediately() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add(t);
            s.schedule(0, 0);
            s.tick(500);
            let result = s.sleep_until(t, 200, &mut || panic!("must not block"));
            assert_eq!(result, Ok(()));
        }

        #[test]
        fn tick_only_wakes_expired_sleepers() {
            let s = scheduler(1);
            with_idle(&s);
            let early = s.create_kernel_thread(0x1000, 0);
            let late = s.create_kernel_thread(0x1000, 1);
            for (t, deadline) in [(early, 10), (late, 20)] {
                s.add(t);
                run(&s, 0, t);
                assert!(s.block(t));
                s.sleepers.lock().push(Sleeper { thread: t, deadline });
            }
            let idle = s.cpus[0].slot.lock().idle.unwrap();
            run(&s, 0, idle);

            s.tick(15);
            assert_eq!(s.thread_state(early), Some(ThreadState::Ready));
            assert_eq!(s.thread_state(late), Some(ThreadState::Blocked));
            assert!(s.is_sleeping(late));

            s.tick(20);
            assert_eq!(s.thread_state(late), Some(ThreadState::Ready));
            assert_eq!(s.queued(0), vec![early, late]);
        }

        #[test]
        fn signal_interrupts_sleep() {
            let s = scheduler(1);
            with_idle(&s);
            let (pid, t) = init_process(&s);
            s.add(t);
            s.schedule(0, 0);
            let result = s.sleep_until(t, 1_000, &mut || {
                s.kill(pid, pid, Some(Signal::SIGUSR1)).unwrap();
                assert_eq!(s.thread_state(t), Some(ThreadState::Ready));
            });
            assert_eq!(result, Err(Errno::EINTR));
            assert!(!s.is_sleeping(t));
        }
    }

    mod notifications {
        use super::*;

        #[test]
        fn wait_any_reports_which_object_fired() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add(t);
            s.schedule(0, 0);
            let a = Notification::new();
            let b = Notification::new();

            let outcome = s.wait_any(t, &[&a, &b], None, &mut || {
                assert_eq!(s.thread_state(t), Some(ThreadState::Blocked));
                assert_eq!(b.waiter(), Some(t));
                b.signal(&s);
                assert_eq!(s.thread_state(t), Some(ThreadState::Ready));
            });
            assert_eq!(outcome, WaitOutcome::Ready(1));
            assert_eq!(a.waiter(), None);
            assert_eq!(b.consume(), 1);
        }

        #[test]
        fn signal_before_block_is_not_lost() {
            let s = scheduler(1);
            with_idle(&s);
            let t = s.create_kernel_thread(0x1000, 0);
            s.add(t);
            s.schedule(0, 0);
            let n = Notification::new();
            n.signal(&s);
            let outcome = s.wait_any(t, &[&n], None, &mut || panic!("must not block"));
            assert_eq!(outcome, WaitOutcome::Ready(0));
        }
    }

    mod signals {
        use super::*;

        #[test]
        fn handler_is_entered_and_sigreturn_restores() {
            let s = scheduler(1);
            with_idle(&s);
            let (pid, t) = init_process(&s);
            s.sigaction(pid, Signal::SIGUSR1, Some(SigAction::from_raw(HANDLER, 0, RESTORER)))
                .unwrap();
            s.add(t);
            let first = s.schedule(0, 0);
            let original = unsafe { *(first.sp as *const RegisterFrame) };

            s.kill(pid, pid, Some(Signal::SIGUSR1)).unwrap();
            let switch = s.schedule(0, first.sp);
            assert_eq!(switch.thread, t);
            let frame = unsafe { &mut *(switch.sp as *mut RegisterFrame) };
            assert_eq!(frame.rip, HANDLER);
            assert_eq!(frame.rdi, u64::from(Signal::SIGUSR1.number()));
            assert_eq!(frame.rsp % 16, 8);
            assert!(frame.rsp < USER_STACK_TOP - RED_ZONE);

            let space = s.with_process(pid, |p| p.space.clone());
            assert_eq!(uaccess::read_u64(&space, frame.rsp), Ok(RESTORER));
            assert!(s.with_thread(t, |t| t.blocked.contains(Signal::SIGUSR1)).unwrap());

            s.sigreturn(t, frame).unwrap();
            assert_eq!(*frame, original);
            assert!(s.with_thread(t, |t| t.blocked.is_empty()).unwrap());
            assert_eq!(s.sigreturn(t, frame), Err(Errno::EINVAL));
        }

        #[test]
        fn lowest_signal_is_delivered_first_one_per_selection() {
            let s = scheduler(1);
            with_idle(&s);
            let (pid, t) = init_process(&s);
            for signal in [Signal::SIGUSR1, Signal::SIGUSR2] {
                s.sigaction(pid, signal, Some(SigAction::from_raw(HANDLER, 0, RESTORER)))
                    .unwrap();
            }
            s.kill(pid, pid, Some(Signal::SIGUSR2)).unwrap();
            s.kill(pid, pid, Some(Signal::SIGUSR1)).unwrap();
            s.add(t);
            let switch = s.schedule(0, 0);
            let frame = unsafe { &*(switch.sp as *const RegisterFrame) };
            assert_eq!(frame.rdi, u64::from(Signal::SIGUSR1.number()));
            let pending = s.with_thread(t, |t| t.pending).unwrap();
            assert!(pending.contains(Signal::SIGUSR2));
            assert!(!pending.contains(Signal::SIGUSR1));
        }

        #[test]
        fn ignored_signals_are_dropped() {
            let s = scheduler(1);
            let (pid, t) = init_process(&s);
            s.kill(pid, pid, Some(Signal::SIGCHLD)).unwrap();
            s.sigaction(pid, Signal::SIGTERM, Some(SigAction::from_raw(1, 0, 0)))
                .unwrap();
            s.kill(pid, pid, Some(Signal::SIGTERM)).unwrap();
            assert!(s.with_thread(t, |t| t.pending.is_empty()).unwrap());
        }

        #[test]
        fn sigkill_cannot_be_caught() {
            let s = scheduler(1);
            let (pid, _) = init_process(&s);
            let action = SigAction::from_raw(HANDLER, 0, RESTORER);
            assert_eq!(s.sigaction(pid, Signal::SIGKILL, Some(action)), Err(Errno::EINVAL));
            assert_eq!(s.sigaction(pid, Signal::SIGSTOP, Some(action)), Err(Errno::EINVAL));
            assert_eq!(s.sigaction(pid, Signal::SIGKILL, None), Ok(SigAction::default()));
        }

        #[test]
        fn default_terminate_makes_a_zombie_and_skips_it() {
            let s = scheduler(1);
            with_idle(&s);
            let (init, init_thread) = init_process(&s);
            s.add(init_thread);
            let running = s.schedule(0, 0);
            let frame = unsafe { *(running.sp as *const RegisterFrame) };
            let child = s.fork(init_thread, &frame).unwrap();
            let child_thread = s.with_process(child, |p| p.threads[0]);

            s.kill(init, child, Some(Signal::SIGTERM)).unwrap();
            let next = s.schedule(0, running.sp);
            assert_eq!(next.thread, init_thread);
            assert_eq!(s.thread_state(child_thread), Some(ThreadState::Stopped));
            assert_eq!(
                s.with_process(child, |p| p.state),
                ProcessState::Zombie(ExitStatus::Signaled(Signal::SIGTERM))
            );
        }

        #[test]
        fn unwritable_stack_kills_with_sigsegv() {
            let s = scheduler(1);
            with_idle(&s);
            let (init, init_thread) = init_process(&s);
            let space = AddressSpace::new(s.memory()).unwrap();
            let pid = s.create_process(Some(init), space);
            let t = s.create_user_thread(pid, 0x40_0000, 0x1000_0000);
            s.sigaction(pid, Signal::SIGUSR1, Some(SigAction::from_raw(HANDLER, 0, RESTORER)))
                .unwrap();
            s.kill(init, pid, Some(Signal::SIGUSR1)).unwrap();
            s.add(t);
            s.add(init_thread);
            assert_eq!(s.schedule(0, 0).thread, init_thread);
            assert_eq!(
                s.with_process(pid, |p| p.state),
                ProcessState::Zombie(ExitStatus::Signaled(Signal::SIGSEGV))
            );
        }

        #[test]
        fn permission_is_checked() {
            let s = scheduler(1);
            let (init, _) = init_process(&s);
            let a = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            let b = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            s.set_credentials(a, Credentials { uid: 1000, gid: 1000 });
            s.set_credentials(b, Credentials { uid: 1001, gid: 1001 });
            assert_eq!(s.kill(a, b, None), Err(Errno::EPERM));
            assert_eq!(s.kill(a, a, None), Ok(()));
            assert_eq!(s.kill(init, b, None), Ok(()));
            assert_eq!(s.kill(a, 999, None), Err(Errno::ESRCH));
            assert_eq!(s.kill(init, KERNEL_PID, None), Err(Errno::EPERM));
        }

        #[test]
        fn group_kill_reaches_every_member() {
            let s = scheduler(1);
            let (init, _) = init_process(&s);
            let members: Vec<Pid> = (0..2)
                .map(|_| {
                    let pid = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
                    s.create_user_thread(pid, 0x40_0000, USER_STACK_TOP);
                    s.setpgid(init, pid, 50).unwrap();
                    pid
                })
                .collect();
            s.kill_group(init, 50, Some(Signal::SIGUSR1)).unwrap();
            for pid in members {
                let thread = s.with_process(pid, |p| p.threads[0]);
                assert!(s.with_thread(thread, |t| t.pending.contains(Signal::SIGUSR1)).unwrap());
            }
            assert_eq!(s.kill_group(init, 77, None), Err(Errno::ESRCH));
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn fork_copies_state_and_zeroes_rax() {
            let s = scheduler(2);
            with_idle(&s);
            let (init, t) = init_process(&s);
            s.sigaction(init, Signal::SIGUSR1, Some(SigAction::from_raw(HANDLER, 0, RESTORER)))
                .unwrap();
            s.add(t);
            let running = s.schedule(0, 0);
            let mut frame = unsafe { *(running.sp as *const RegisterFrame) };
            frame.rax = 12;

            let child = s.fork(t, &frame).unwrap();
            assert_ne!(child, init);
            let (parent, child_thread, root, action) = s.with_process(child, |p| {
                (p.parent, p.threads[0], p.space.root(), *p.action(Signal::SIGUSR1))
            });
            assert_eq!(parent, Some(init));
            assert_eq!(action.raw_handler(), HANDLER);
            assert!(s.with_process(init, |p| p.children.contains(&child)));

            // Both queues are empty, so the lowest CPU wins.
            assert_eq!(s.with_thread(child_thread, |t| t.cpu), Some(0));
            let child_frame = s.with_thread(child_thread, |t| *t.frame()).unwrap();
            assert_eq!(child_frame.rax, 0);
            assert_eq!(child_frame.cr3, root.as_u64());
            assert_eq!(child_frame.rip, frame.rip);

            // The child's stack is a copy, not a share.
            let child_space = s.with_process(child, |p| p.space.clone());
            let parent_space = s.with_process(init, |p| p.space.clone());
            uaccess::write_u64(&parent_space, USER_STACK_TOP - 8, 1).unwrap();
            assert_eq!(uaccess::read_u64(&child_space, USER_STACK_TOP - 8), Ok(0));
        }

        #[test]
        fn exit_then_wait_reaps_the_child() {
            let s = scheduler(1);
            with_idle(&s);
            let (_, t) = init_process(&s);
            s.add(t);
            let running = s.schedule(0, 0);
            let frame = unsafe { *(running.sp as *const RegisterFrame) };
            let child = s.fork(t, &frame).unwrap();
            let child_thread = s.with_process(child, |p| p.threads[0]);
            let free_tables = s.memory().pool().free_pages();

            assert_eq!(
                s.wait(t, WaitPid::Any, WaitOptions::NOHANG, &mut || unreachable!()),
                Ok(None)
            );

            s.exit(child_thread, 3);
            let status = s
                .wait(t, WaitPid::Pid(child), WaitOptions::empty(), &mut || unreachable!())
                .unwrap();
            assert_eq!(status, Some((child, ExitStatus::Exited(3))));
            assert_eq!(ExitStatus::Exited(3).wait_status(), 0x300);
            assert!(!s.process_exists(child));
            assert_eq!(s.thread_state(child_thread), None);
            assert!(s.memory().pool().free_pages() > free_tables);
            assert_eq!(
                s.wait(t, WaitPid::Any, WaitOptions::NOHANG, &mut || unreachable!()),
                Err(Errno::ECHILD)
            );
        }

        #[test]
        fn blocking_wait_sleeps_until_the_child_exits() {
            let s = scheduler(1);
            with_idle(&s);
            let (_, t) = init_process(&s);
            s.add(t);
            let running = s.schedule(0, 0);
            let frame = unsafe { *(running.sp as *const RegisterFrame) };
            let child = s.fork(t, &frame).unwrap();
            let child_thread = s.with_process(child, |p| p.threads[0]);

            let mut yields = 0;
            let status = s.wait(t, WaitPid::Any, WaitOptions::empty(), &mut || {
                yields += 1;
                // The child runs and exits while init is blocked.
                let switch = s.schedule(0, current_sp(&s, 0));
                assert_eq!(switch.thread, child_thread);
                s.exit(child_thread, 7);
                assert_eq!(s.schedule(0, switch.sp).thread, t);
            });
            assert_eq!(status, Ok(Some((child, ExitStatus::Exited(7)))));
            assert_eq!(yields, 1);
        }

        #[test]
        fn zombie_on_cpu_is_not_reaped() {
            let s = scheduler(2);
            with_idle(&s);
            let (_, t) = init_process(&s);
            s.add_to(0, t);
            let running = s.schedule(0, 0);
            let frame = unsafe { *(running.sp as *const RegisterFrame) };
            let child = s.fork(t, &frame).unwrap();
            let child_thread = s.with_process(child, |p| p.threads[0]);
            let child_switch = run(&s, 0, child_thread);
            s.exit(child_thread, 0);

            assert_eq!(
                s.wait(t, WaitPid::Any, WaitOptions::NOHANG, &mut || unreachable!()),
                Ok(None)
            );
            s.schedule(1, child_switch.sp);
            assert_eq!(
                s.wait(t, WaitPid::Any, WaitOptions::NOHANG, &mut || unreachable!()),
                Ok(Some((child, ExitStatus::Exited(0))))
            );
        }

        #[test]
        fn orphans_are_adopted_by_init() {
            let s = scheduler(1);
            let (init, _) = init_process(&s);
            let middle = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            let middle_thread = s.create_user_thread(middle, 0x40_0000, USER_STACK_TOP);
            let grandchild = s.create_process(Some(middle), AddressSpace::new(s.memory()).unwrap());

            s.exit(middle_thread, 0);
            assert_eq!(s.with_process(grandchild, |p| p.parent), Some(init));
            assert!(s.with_process(init, |p| p.children.contains(&grandchild)));
            assert!(s.with_process(init, |p| p.child_exit.value()) > 0);
        }

        #[test]
        fn exit_sends_sigchld_when_caught() {
            let s = scheduler(1);
            let (init, init_thread) = init_process(&s);
            s.sigaction(init, Signal::SIGCHLD, Some(SigAction::from_raw(HANDLER, 0, RESTORER)))
                .unwrap();
            let child = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            let child_thread = s.create_user_thread(child, 0x40_0000, USER_STACK_TOP);
            s.exit(child_thread, 0);
            assert!(s.with_thread(init_thread, |t| t.pending.contains(Signal::SIGCHLD)).unwrap());
        }

        #[test]
        fn wait_filters_by_group() {
            let s = scheduler(1);
            let (init, init_thread) = init_process(&s);
            let a = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            let a_thread = s.create_user_thread(a, 0x40_0000, USER_STACK_TOP);
            let b = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            let b_thread = s.create_user_thread(b, 0x40_0000, USER_STACK_TOP);
            s.setpgid(init, b, 0).unwrap();
            assert_eq!(s.getpgid(init, b), Ok(b));
            assert_eq!(s.getpgid(a, 0), Ok(init));

            s.exit(a_thread, 1);
            s.exit(b_thread, 2);
            let reaped = s
                .wait(init_thread, WaitPid::Group(b), WaitOptions::NOHANG, &mut || unreachable!())
                .unwrap();
            assert_eq!(reaped, Some((b, ExitStatus::Exited(2))));
        }

        #[test]
        fn setpgid_is_limited_to_self_and_children() {
            let s = scheduler(1);
            let (init, _) = init_process(&s);
            let a = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            let b = s.create_process(Some(init), AddressSpace::new(s.memory()).unwrap());
            assert_eq!(s.setpgid(a, b, a), Err(Errno::ESRCH));
            assert_eq!(s.getpgid(init, 4242), Err(Errno::ESRCH));
        }

        #[test]
        #[should_panic(expected = "init (pid 1) terminated")]
        fn init_exit_is_fatal() {
            let s = scheduler(1);
            let (_, t) = init_process(&s);
            s.exit(t, 0);
        }

        #[test]
        fn exec_reset_installs_entry_and_clears_handlers() {
            let s = scheduler(1);
            let (init, t) = init_process(&s);
            s.sigaction(init, Signal::SIGUSR1, Some(SigAction::from_raw(HANDLER, 0, RESTORER)))
                .unwrap();
            s.sigaction(init, Signal::SIGUSR2, Some(SigAction::from_raw(1, 0, 0)))
                .unwrap();
            let mut frame = RegisterFrame::default();
            s.exec_reset(t, &mut frame, 0x50_0000, 0x6FFF_FF00);
            assert_eq!(frame.rip, 0x50_0000);
            assert_eq!(frame.rsp, 0x6FFF_FF00);
            assert!(frame.is_user());
            assert_eq!(s.sigaction(init, Signal::SIGUSR1, None), Ok(SigAction::default()));
            assert_eq!(
                s.sigaction(init, Signal::SIGUSR2, None).unwrap().raw_handler(),
                1
            );
        }
    }
}
