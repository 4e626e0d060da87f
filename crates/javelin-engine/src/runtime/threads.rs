//! Guest threads, the thread list, and stop-the-world suspension
//!
//! OS threads map one-to-one to guest threads; a thread attaches before
//! touching the runtime and detaches on exit, handing its lock-record pool
//! to the global free list. The coordinator stops the world cooperatively:
//! it flags every running thread and waits for each to checkpoint at a
//! safepoint poll; a checkpointed PC inside a registered critical section is
//! rewound to the section's restart PC before the thread parks. A thread
//! blocked in native waiting (sleep, `Object.wait`, contended monitor
//! acquisition) counts as already safe: it flips to `Blocked` before
//! parking, is excluded from the acknowledgement tally, and re-checks the
//! stop-the-world flag before it may become runnable again.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use super::monitor::LockRecord;
use super::object::ObjectHeader;
use super::sync::Semaphore;
use crate::error::{JavaKind, JavaThrowable};

/// Guest thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but not yet running; its stack is not meaningful and the
    /// coordinator skips it.
    New = 0,
    Runnable = 1,
    Suspended = 2,
    /// Parked in native waiting; already safe for the coordinator.
    Blocked = 3,
    Terminated = 4,
}

/// Wait/notify and interrupt flags, guarded by the thread's wait mutex.
#[derive(Default)]
pub(crate) struct WaitFlags {
    pub notified: bool,
    pub interrupted: bool,
}

/// Registers checkpointed when a thread parks for the collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checkpoint {
    pub pc: usize,
    pub sp: usize,
}

/// One guest thread.
pub struct JavaThread {
    pub id: u64,
    state: AtomicU8,
    /// Set by the coordinator; polled at safepoints.
    suspend_requested: AtomicBool,
    checkpoint: Mutex<Checkpoint>,
    /// Wait/notify/interrupt machinery.
    pub(crate) wait_mutex: Mutex<WaitFlags>,
    pub(crate) wait_cond: Condvar,
    /// Next thread in a monitor wait chain.
    pub(crate) next_waiter: AtomicPtr<JavaThread>,
    /// Object this thread is waiting on, for diagnostics.
    pub(crate) waiting_on: AtomicPtr<ObjectHeader>,
    /// Free lock records owned by this thread.
    pub(crate) free_lrs: Mutex<Vec<&'static LockRecord>>,
    /// Pending exception as (object, faulting pc).
    pending: Mutex<Option<(usize, usize)>>,
}

impl JavaThread {
    fn new(id: u64) -> Self {
        JavaThread {
            id,
            state: AtomicU8::new(ThreadState::New as u8),
            suspend_requested: AtomicBool::new(false),
            checkpoint: Mutex::new(Checkpoint::default()),
            wait_mutex: Mutex::new(WaitFlags::default()),
            wait_cond: Condvar::new(),
            next_waiter: AtomicPtr::new(std::ptr::null_mut()),
            waiting_on: AtomicPtr::new(std::ptr::null_mut()),
            free_lrs: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::New,
            1 => ThreadState::Runnable,
            2 => ThreadState::Suspended,
            3 => ThreadState::Blocked,
            _ => ThreadState::Terminated,
        }
    }

    fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn set_pending(&self, xptr: usize, xpc: usize) {
        *self.pending.lock() = Some((xptr, xpc));
    }

    pub fn take_pending(&self) -> Option<(usize, usize)> {
        self.pending.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Set the interrupt flag and wake the thread out of wait/sleep.
    pub fn interrupt(&self) {
        let mut flags = self.wait_mutex.lock();
        flags.interrupted = true;
        self.wait_cond.notify_all();
    }

    pub fn take_interrupted(&self) -> bool {
        let mut flags = self.wait_mutex.lock();
        std::mem::take(&mut flags.interrupted)
    }

    /// Block until notified, interrupted, or the deadline passes. A zero
    /// timeout waits indefinitely. Returns true on timeout.
    pub(crate) fn park(&self, millis: i64, nanos: i32) -> bool {
        let deadline = if millis == 0 && nanos == 0 {
            None
        } else {
            Some(
                Instant::now()
                    + Duration::from_millis(millis as u64)
                    + Duration::from_nanos(nanos as u64),
            )
        };
        let mut flags = self.wait_mutex.lock();
        loop {
            if flags.notified {
                flags.notified = false;
                return false;
            }
            if flags.interrupted {
                return false;
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return true;
                    }
                    if self.wait_cond.wait_until(&mut flags, d).timed_out() {
                        return !flags.notified;
                    }
                }
                None => self.wait_cond.wait(&mut flags),
            }
        }
    }
}

/// A PC range whose suspension point is rewound to a designated restart.
#[derive(Debug, Clone, Copy)]
pub struct CriticalSection {
    pub start: usize,
    pub restart: usize,
    pub end: usize,
}

/// Registered critical sections, consulted when checkpointing.
pub struct CriticalSections {
    sections: RwLock<Vec<CriticalSection>>,
}

impl CriticalSections {
    pub fn new() -> Self {
        CriticalSections {
            sections: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, section: CriticalSection) {
        debug_assert!(section.start <= section.restart && section.restart <= section.end);
        self.sections.write().push(section);
    }

    /// The PC a suspended thread must be restarted at.
    pub fn restart_pc(&self, pc: usize) -> usize {
        for s in self.sections.read().iter() {
            if pc >= s.start && pc < s.end {
                return s.restart;
            }
        }
        pc
    }
}

impl Default for CriticalSections {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<JavaThread>>> =
        const { std::cell::RefCell::new(None) };
}

/// The mutator registry plus the stop-the-world coordinator.
pub struct ThreadList {
    threads: Mutex<Vec<Arc<JavaThread>>>,
    next_id: AtomicU64,
    /// Serializes coordinators.
    stop_world: Mutex<()>,
    world_stopped: AtomicBool,
    ack_sem: Semaphore,
    resume_mutex: Mutex<u64>,
    resume_cond: Condvar,
    /// Lock records reclaimed from exited threads.
    global_lr_pool: Mutex<Vec<&'static LockRecord>>,
    pub critical_sections: CriticalSections,
}

impl ThreadList {
    pub fn new() -> Self {
        ThreadList {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stop_world: Mutex::new(()),
            world_stopped: AtomicBool::new(false),
            ack_sem: Semaphore::new(0),
            resume_mutex: Mutex::new(0),
            resume_cond: Condvar::new(),
            global_lr_pool: Mutex::new(Vec::new()),
            critical_sections: CriticalSections::new(),
        }
    }

    /// Attach the calling OS thread as a guest thread.
    pub fn attach(self: &Arc<Self>) -> Arc<JavaThread> {
        if let Some(t) = Self::try_current() {
            return t;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let t = Arc::new(JavaThread::new(id));
        t.set_state(ThreadState::Runnable);
        self.threads.lock().push(t.clone());
        CURRENT.with(|c| *c.borrow_mut() = Some(t.clone()));
        debug!(id, "thread attached");
        t
    }

    /// Detach the calling thread; its lock-record pool moves to the global
    /// free list for reuse.
    pub fn detach(&self) {
        let Some(t) = CURRENT.with(|c| c.borrow_mut().take()) else {
            return;
        };
        t.set_state(ThreadState::Terminated);
        let mut pool = t.free_lrs.lock();
        self.global_lr_pool.lock().append(&mut pool);
        drop(pool);
        self.threads.lock().retain(|x| !Arc::ptr_eq(x, &t));
        debug!(id = t.id, "thread detached");
    }

    pub fn try_current() -> Option<Arc<JavaThread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn take_global_lock_record(&self) -> Option<&'static LockRecord> {
        self.global_lr_pool.lock().pop()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn global_lr_pool_len(&self) -> usize {
        self.global_lr_pool.lock().len()
    }

    /// Number of registered threads currently in `state`.
    pub fn count_state(&self, state: ThreadState) -> usize {
        self.threads.lock().iter().filter(|t| t.state() == state).count()
    }

    /// Enter native blocking: the coordinator treats the thread as already
    /// stopped and skips it in the acknowledgement tally.
    pub fn block_begin(&self, t: &JavaThread) {
        t.set_state(ThreadState::Blocked);
    }

    /// Leave native blocking. Parks while the world is stopped so a thread
    /// waking mid-pause cannot become runnable under the coordinator; the
    /// transition is taken under the resume lock, so the coordinator either
    /// observes the thread still blocked or sees it runnable before it
    /// raises the stop flag.
    pub fn block_end(&self, t: &JavaThread) {
        let mut epoch = self.resume_mutex.lock();
        while self.world_stopped.load(Ordering::Acquire) {
            self.resume_cond.wait(&mut epoch);
        }
        t.set_state(ThreadState::Runnable);
    }

    /// Interruptible sleep using the same machinery as monitor wait. The
    /// sleeping thread counts as natively blocked.
    pub fn sleep(&self, t: &JavaThread, millis: i64, nanos: i32) -> Result<(), JavaThrowable> {
        self.block_begin(t);
        t.park(millis.max(1), nanos);
        self.block_end(t);
        if t.take_interrupted() {
            return Err(JavaThrowable::new(JavaKind::InterruptedException));
        }
        Ok(())
    }

    /// Safepoint poll: park here while the world is stopped.
    pub fn safepoint(&self, t: &JavaThread, checkpoint: Checkpoint) {
        if !t.suspend_requested.load(Ordering::Acquire) {
            return;
        }
        // Rewind PCs inside critical sections to their restart point.
        let mut cp = checkpoint;
        cp.pc = self.critical_sections.restart_pc(cp.pc);
        *t.checkpoint.lock() = cp;
        t.set_state(ThreadState::Suspended);
        self.ack_sem.post();

        let mut epoch = self.resume_mutex.lock();
        let my_epoch = *epoch;
        while self.world_stopped.load(Ordering::Acquire) && *epoch == my_epoch {
            self.resume_cond.wait(&mut epoch);
        }
        drop(epoch);

        t.suspend_requested.store(false, Ordering::Release);
        t.set_state(ThreadState::Runnable);
        // Re-acknowledge the resume.
        self.ack_sem.post();
    }

    /// Stop every running mutator except the caller. Threads in state New
    /// or Blocked are already safe and are not awaited. Returns the number
    /// of threads suspended.
    pub fn suspend_all(&self, me: &JavaThread) -> usize {
        let _guard = self.stop_world.lock();
        {
            // Raise the flag under the resume lock: a thread leaving native
            // blocking either sees the stop and stays parked, or went
            // runnable before the snapshot below and is counted.
            let _epoch = self.resume_mutex.lock();
            self.world_stopped.store(true, Ordering::Release);
        }

        let targets: Vec<Arc<JavaThread>> = self
            .threads
            .lock()
            .iter()
            .filter(|t| t.id != me.id && t.state() == ThreadState::Runnable)
            .cloned()
            .collect();
        for t in &targets {
            t.suspend_requested.store(true, Ordering::Release);
        }
        for _ in &targets {
            self.ack_sem.wait();
        }
        debug!(count = targets.len(), "world stopped");
        targets.len()
    }

    /// Wake all suspended threads and wait for their re-acknowledgement.
    pub fn resume_all(&self, count: usize) {
        {
            let mut epoch = self.resume_mutex.lock();
            *epoch += 1;
            self.world_stopped.store(false, Ordering::Release);
            self.resume_cond.notify_all();
        }
        for _ in 0..count {
            self.ack_sem.wait();
        }
        debug!(count, "world resumed");
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach() {
        let list = Arc::new(ThreadList::new());
        let t = list.attach();
        assert_eq!(t.state(), ThreadState::Runnable);
        assert_eq!(list.thread_count(), 1);
        // Attach is idempotent per OS thread.
        let t2 = list.attach();
        assert!(Arc::ptr_eq(&t, &t2));
        list.detach();
        assert_eq!(list.thread_count(), 0);
    }

    #[test]
    fn test_interrupt_wakes_park() {
        let list = Arc::new(ThreadList::new());
        let t = list.attach();
        let t2 = t.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t2.interrupt();
        });
        // Indefinite wait ends via interrupt.
        let timed_out = t.park(0, 0);
        assert!(!timed_out);
        assert!(t.take_interrupted());
        h.join().unwrap();
        list.detach();
    }

    #[test]
    fn test_timed_park_expires() {
        let list = Arc::new(ThreadList::new());
        let t = list.attach();
        let start = Instant::now();
        let timed_out = t.park(30, 0);
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(25));
        list.detach();
    }

    #[test]
    fn test_critical_section_restart() {
        let cs = CriticalSections::new();
        cs.register(CriticalSection {
            start: 0x1000,
            restart: 0x1004,
            end: 0x1020,
        });
        assert_eq!(cs.restart_pc(0x1010), 0x1004);
        assert_eq!(cs.restart_pc(0x1020), 0x1020);
        assert_eq!(cs.restart_pc(0x900), 0x900);
    }

    #[test]
    fn test_suspend_skips_natively_blocked_threads() {
        let list = Arc::new(ThreadList::new());
        let me = list.attach();

        let list2 = list.clone();
        let h = std::thread::spawn(move || {
            let t = list2.attach();
            // Long enough to still be parked when the coordinator runs.
            list2.sleep(&t, 100, 0).unwrap();
            list2.detach();
        });

        while list.count_state(ThreadState::Blocked) == 0 {
            std::thread::yield_now();
        }
        // The sleeper counts as already safe; no acknowledgement is
        // awaited, so this must return instead of deadlocking.
        let n = list.suspend_all(&me);
        assert_eq!(n, 0);
        list.resume_all(n);

        h.join().unwrap();
        list.detach();
    }

    #[test]
    fn test_blocked_thread_waits_for_resume() {
        let list = Arc::new(ThreadList::new());
        let me = list.attach();
        let resumed = Arc::new(AtomicBool::new(false));

        let list2 = list.clone();
        let resumed2 = resumed.clone();
        let h = std::thread::spawn(move || {
            let t = list2.attach();
            list2.sleep(&t, 20, 0).unwrap();
            // Only reachable once block_end let the thread go runnable.
            resumed2.store(true, Ordering::Release);
            list2.detach();
        });

        while list.count_state(ThreadState::Blocked) == 0 {
            std::thread::yield_now();
        }
        let n = list.suspend_all(&me);
        assert_eq!(n, 0);
        // The sleep expires mid-pause; the thread must stay parked in
        // block_end until the world resumes.
        std::thread::sleep(Duration::from_millis(80));
        assert!(!resumed.load(Ordering::Acquire));
        list.resume_all(n);

        h.join().unwrap();
        assert!(resumed.load(Ordering::Acquire));
        list.detach();
    }

    #[test]
    fn test_stop_the_world() {
        let list = Arc::new(ThreadList::new());
        let me = list.attach();

        let mut handles = Vec::new();
        let stop = Arc::new(AtomicBool::new(false));
        for _ in 0..3 {
            let list2 = list.clone();
            let stop2 = stop.clone();
            handles.push(std::thread::spawn(move || {
                let t = list2.attach();
                while !stop2.load(Ordering::Acquire) {
                    list2.safepoint(&t, Checkpoint { pc: 0, sp: 0 });
                    std::hint::spin_loop();
                }
                list2.detach();
            }));
        }

        // Give workers time to attach.
        while list.thread_count() < 4 {
            std::thread::yield_now();
        }
        let n = list.suspend_all(&me);
        assert_eq!(n, 3);
        // All three are parked now.
        list.resume_all(n);

        stop.store(true, Ordering::Release);
        for h in handles {
            h.join().unwrap();
        }
        list.detach();
    }
}
