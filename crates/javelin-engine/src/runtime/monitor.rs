//! Monitor lock records
//!
//! Hybrid thin/fat locking over per-thread lock records. Every object header
//! starts out pointing at the shared dummy record, so the fast path never
//! tests for null: enter CASes the header from whatever record is installed
//! to the acquiring thread's own, recursion bumps the count on the installed
//! record, and contenders queue on its semaphore. A released record is never
//! destroyed (stale pointers are disarmed by the `o` field check), and a
//! record whose wait chain is still populated is orphaned in place until the
//! next acquirer migrates the chain.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use once_cell::sync::Lazy;

use super::object::ObjectHeader;
use super::sync::Semaphore;
use super::threads::{JavaThread, ThreadList};
use crate::error::{JavaKind, JavaThrowable};

/// One lock record. Allocated leaked so stale pointers stay dereferenceable
/// for the lifetime of the VM.
pub struct LockRecord {
    /// Owning thread while locked; compared by address.
    owner: AtomicUsize,
    /// Recursion count.
    lock_count: AtomicU32,
    /// Locked object, or null when the record is free.
    o: AtomicPtr<ObjectHeader>,
    /// Contenders block here.
    queue_sem: Semaphore,
    /// Number of contenders between increment and decrement.
    queuers: AtomicI32,
    /// Head of the wait chain rooted at this record.
    waiter: AtomicPtr<JavaThread>,
    /// Object the owner is waiting on, when parked in `wait`.
    waiting: AtomicPtr<ObjectHeader>,
    /// Released with a live wait chain; reclaimed by the next acquirer.
    orphan: AtomicBool,
}

impl LockRecord {
    fn new() -> &'static LockRecord {
        Box::leak(Box::new(LockRecord {
            owner: AtomicUsize::new(0),
            lock_count: AtomicU32::new(0),
            o: AtomicPtr::new(std::ptr::null_mut()),
            queue_sem: Semaphore::new(0),
            queuers: AtomicI32::new(0),
            waiter: AtomicPtr::new(std::ptr::null_mut()),
            waiting: AtomicPtr::new(std::ptr::null_mut()),
            orphan: AtomicBool::new(false),
        }))
    }

    fn reset(&self, owner: usize, obj: *mut ObjectHeader) {
        self.owner.store(owner, Ordering::Relaxed);
        self.lock_count.store(1, Ordering::Relaxed);
        self.waiter.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.waiting.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.orphan.store(false, Ordering::Relaxed);
        self.o.store(obj, Ordering::Release);
    }
}

static DUMMY: Lazy<&'static LockRecord> = Lazy::new(LockRecord::new);

/// The placeholder record every fresh object header points at.
pub fn dummy_lock_record() -> *mut LockRecord {
    *DUMMY as *const LockRecord as *mut LockRecord
}

fn thread_key(t: &JavaThread) -> usize {
    t as *const JavaThread as usize
}

fn take_record(list: &ThreadList, t: &JavaThread) -> &'static LockRecord {
    if let Some(lr) = t.free_lrs.lock().pop() {
        return lr;
    }
    if let Some(lr) = list.take_global_lock_record() {
        return lr;
    }
    LockRecord::new()
}

fn recycle_record(t: &JavaThread, lr: &'static LockRecord) {
    lr.owner.store(0, Ordering::Relaxed);
    lr.lock_count.store(0, Ordering::Relaxed);
    lr.waiter.store(std::ptr::null_mut(), Ordering::Relaxed);
    lr.waiting.store(std::ptr::null_mut(), Ordering::Relaxed);
    t.free_lrs.lock().push(lr);
}

fn header(obj: *mut ObjectHeader) -> &'static AtomicPtr<LockRecord> {
    unsafe { &(*obj).monitor }
}

/// Acquire the monitor of `obj`, blocking on contention.
pub fn enter(list: &ThreadList, t: &Arc<JavaThread>, obj: *mut ObjectHeader) {
    let key = thread_key(t);
    let hdr = header(obj);
    let mlr = take_record(list, t);
    mlr.reset(key, obj);

    let backoff = Backoff::new();
    loop {
        let lr_ptr = hdr.load(Ordering::SeqCst);
        let lr = unsafe { &*lr_ptr };

        if lr.o.load(Ordering::SeqCst) == obj {
            if lr.owner.load(Ordering::Acquire) == key {
                // Recursive acquisition; the fresh record goes back.
                lr.lock_count.fetch_add(1, Ordering::Relaxed);
                recycle_record(t, mlr);
                return;
            }
            // Contended: announce, re-check, block. The park counts as a
            // native block so the stop-the-world coordinator never waits
            // on a queued contender.
            lr.queuers.fetch_add(1, Ordering::SeqCst);
            if hdr.load(Ordering::SeqCst) == lr_ptr && lr.o.load(Ordering::SeqCst) == obj {
                list.block_begin(t);
                lr.queue_sem.wait();
                list.block_end(t);
            }
            lr.queuers.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        // Record looks free; try to install ours.
        if hdr
            .compare_exchange(lr_ptr, mlr as *const _ as *mut _, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Migrate the wait chain from the displaced record and reclaim
            // it if its owner left it orphaned.
            let chain = lr.waiter.swap(std::ptr::null_mut(), Ordering::SeqCst);
            mlr.waiter.store(chain, Ordering::SeqCst);
            if lr.orphan.swap(false, Ordering::SeqCst) {
                recycle_record(t, lr);
            }
            return;
        }
        backoff.spin();
    }
}

/// Release the monitor of `obj`.
pub fn exit(t: &Arc<JavaThread>, obj: *mut ObjectHeader) -> Result<(), JavaThrowable> {
    let key = thread_key(t);
    let hdr = header(obj);
    let lr_ptr = hdr.load(Ordering::SeqCst);
    let lr = unsafe { &*lr_ptr };

    if lr.o.load(Ordering::SeqCst) != obj || lr.owner.load(Ordering::Acquire) != key {
        return Err(JavaThrowable::new(JavaKind::IllegalMonitorStateException));
    }

    let count = lr.lock_count.load(Ordering::Relaxed);
    if count > 1 {
        lr.lock_count.store(count - 1, Ordering::Relaxed);
        return Ok(());
    }

    let keep_for_waiters = !lr.waiter.load(Ordering::SeqCst).is_null();
    if keep_for_waiters {
        lr.orphan.store(true, Ordering::SeqCst);
    }

    // Full release: clear the object first, then drain the queue the
    // announced contenders built up.
    lr.o.store(std::ptr::null_mut(), Ordering::SeqCst);
    let q = lr.queuers.load(Ordering::SeqCst);
    for _ in 0..q {
        lr.queue_sem.post();
    }
    if !keep_for_waiters {
        let lr_static: &'static LockRecord = unsafe { &*(lr_ptr as *const LockRecord) };
        recycle_record(t, lr_static);
    }
    Ok(())
}

/// Does `t` currently own the monitor of `obj`?
pub fn held_by(t: &JavaThread, obj: *mut ObjectHeader) -> bool {
    let lr = unsafe { &*header(obj).load(Ordering::SeqCst) };
    lr.o.load(Ordering::SeqCst) == obj && lr.owner.load(Ordering::Acquire) == thread_key(t)
}

fn owned_record(
    t: &JavaThread,
    obj: *mut ObjectHeader,
) -> Result<&'static LockRecord, JavaThrowable> {
    let lr_ptr = header(obj).load(Ordering::SeqCst);
    let lr = unsafe { &*lr_ptr };
    if lr.o.load(Ordering::SeqCst) != obj || lr.owner.load(Ordering::Acquire) != thread_key(t) {
        return Err(JavaThrowable::new(JavaKind::IllegalMonitorStateException));
    }
    Ok(unsafe { &*(lr_ptr as *const LockRecord) })
}

/// `Object.wait`: release fully, park, re-acquire, restore recursion.
/// Zero millis and nanos wait indefinitely.
pub fn wait(
    list: &ThreadList,
    t: &Arc<JavaThread>,
    obj: *mut ObjectHeader,
    millis: i64,
    nanos: i32,
) -> Result<(), JavaThrowable> {
    let lr = owned_record(t, obj)?;
    let count = lr.lock_count.load(Ordering::Relaxed);

    // Join the wait chain while still owning the monitor.
    {
        let mut flags = t.wait_mutex.lock();
        flags.notified = false;
    }
    t.next_waiter.store(std::ptr::null_mut(), Ordering::SeqCst);
    append_waiter(lr, t);
    t.waiting_on.store(obj, Ordering::SeqCst);
    lr.waiting.store(obj, Ordering::Relaxed);

    lr.lock_count.store(1, Ordering::Relaxed);
    exit(t, obj).expect("owner releases its own monitor");

    list.block_begin(t);
    t.park(millis, nanos);
    list.block_end(t);

    enter(list, t, obj);
    let lr2 = owned_record(t, obj).expect("re-acquired");
    lr2.lock_count.store(count, Ordering::Relaxed);
    // Gone from the chain if notified; after a timeout we remove ourselves.
    remove_waiter(lr2, t);
    t.waiting_on.store(std::ptr::null_mut(), Ordering::SeqCst);

    if t.take_interrupted() {
        return Err(JavaThrowable::new(JavaKind::InterruptedException));
    }
    Ok(())
}

/// `Object.notify` / `notifyAll`.
pub fn notify(t: &Arc<JavaThread>, obj: *mut ObjectHeader, all: bool) -> Result<(), JavaThrowable> {
    let lr = owned_record(t, obj)?;
    loop {
        let head = lr.waiter.load(Ordering::SeqCst);
        if head.is_null() {
            return Ok(());
        }
        let target = unsafe { &*head };
        lr.waiter
            .store(target.next_waiter.load(Ordering::SeqCst), Ordering::SeqCst);
        target.next_waiter.store(std::ptr::null_mut(), Ordering::SeqCst);
        {
            let mut flags = target.wait_mutex.lock();
            flags.notified = true;
            target.wait_cond.notify_all();
        }
        if !all {
            return Ok(());
        }
    }
}

fn append_waiter(lr: &LockRecord, t: &JavaThread) {
    let t_ptr = t as *const JavaThread as *mut JavaThread;
    let head = lr.waiter.load(Ordering::SeqCst);
    if head.is_null() {
        lr.waiter.store(t_ptr, Ordering::SeqCst);
        return;
    }
    let mut cur = head;
    loop {
        let next = unsafe { (*cur).next_waiter.load(Ordering::SeqCst) };
        if next.is_null() {
            unsafe { (*cur).next_waiter.store(t_ptr, Ordering::SeqCst) };
            return;
        }
        cur = next;
    }
}

fn remove_waiter(lr: &LockRecord, t: &JavaThread) {
    let t_ptr = t as *const JavaThread as *mut JavaThread;
    let head = lr.waiter.load(Ordering::SeqCst);
    if head.is_null() {
        return;
    }
    if head == t_ptr {
        lr.waiter
            .store(t.next_waiter.load(Ordering::SeqCst), Ordering::SeqCst);
        t.next_waiter.store(std::ptr::null_mut(), Ordering::SeqCst);
        return;
    }
    let mut cur = head;
    loop {
        let next = unsafe { (*cur).next_waiter.load(Ordering::SeqCst) };
        if next.is_null() {
            return;
        }
        if next == t_ptr {
            unsafe {
                (*cur)
                    .next_waiter
                    .store(t.next_waiter.load(Ordering::SeqCst), Ordering::SeqCst);
            }
            t.next_waiter.store(std::ptr::null_mut(), Ordering::SeqCst);
            return;
        }
        cur = next;
    }
}
