//! Counting semaphore
//!
//! The monitor queue and the suspend acknowledgement protocol both need a
//! plain counting semaphore; parking_lot supplies the mutex and condvar.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Release one permit.
    pub fn post(&self) {
        let mut p = self.permits.lock();
        *p += 1;
        self.cond.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut p = self.permits.lock();
        while *p == 0 {
            self.cond.wait(&mut p);
        }
        *p -= 1;
    }

    /// Take a permit if one is available.
    pub fn try_wait(&self) -> bool {
        let mut p = self.permits.lock();
        if *p > 0 {
            *p -= 1;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_post_wait() {
        let s = Semaphore::new(0);
        s.post();
        s.post();
        s.wait();
        assert_eq!(s.available(), 1);
        assert!(s.try_wait());
        assert!(!s.try_wait());
    }

    #[test]
    fn test_cross_thread() {
        let s = Arc::new(Semaphore::new(0));
        let s2 = s.clone();
        let h = std::thread::spawn(move || {
            for _ in 0..100 {
                s2.post();
            }
        });
        for _ in 0..100 {
            s.wait();
        }
        h.join().unwrap();
        assert_eq!(s.available(), 0);
    }
}
