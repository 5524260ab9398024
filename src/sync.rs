//! Blocking primitives shared by the thread pool and its callers.

use std::sync::{Condvar, Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Auto-reset event. A `set` stays pending until exactly one `wait`
/// consumes it; repeated sets before that collapse into one.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.signaled) = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut signaled = lock(&self.signaled);
        while !*signaled {
            signaled = wait(&self.cond, signaled);
        }
        *signaled = false;
    }
}

#[derive(Debug)]
struct LatchState {
    remaining: usize,
    failed: bool,
}

/// Count-down barrier for the fragments of one bulk request.
#[derive(Debug)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Latch {
            state: Mutex::new(LatchState { remaining: count, failed: false }),
            cond: Condvar::new(),
        }
    }

    /// Marks one participant done. `failed` is sticky for the whole latch.
    pub fn count_down(&self, failed: bool) {
        let mut state = lock(&self.state);
        state.failed |= failed;
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until the count reaches zero. Returns false if any participant
    /// reported a failure.
    pub fn wait(&self) -> bool {
        let mut state = lock(&self.state);
        while state.remaining > 0 {
            state = wait(&self.cond, state);
        }
        !state.failed
    }
}

/// Waits on a latch when dropped, so borrowed buffers handed to workers
/// outlive every fragment even if the caller unwinds.
pub struct LatchGuard<'a> {
    latch: &'a Latch,
    armed: bool,
}

impl<'a> LatchGuard<'a> {
    pub fn new(latch: &'a Latch) -> Self {
        LatchGuard { latch, armed: true }
    }

    pub fn finish(mut self) -> bool {
        self.armed = false;
        self.latch.wait()
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.latch.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn event_signal_survives_until_waited() {
        let event = Event::new();
        event.set();
        event.set();
        event.wait();
        assert!(!*lock(&event.signaled));
    }

    #[test]
    fn event_wakes_other_thread() {
        let event = Arc::new(Event::new());
        let setter = Arc::clone(&event);
        let handle = thread::spawn(move || setter.set());
        event.wait();
        handle.join().unwrap();
    }

    #[test]
    fn latch_releases_after_last_count() {
        let latch = Arc::new(Latch::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.count_down(false))
            })
            .collect();
        assert!(latch.wait());
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn latch_reports_failure() {
        let latch = Latch::new(2);
        latch.count_down(true);
        latch.count_down(false);
        assert!(!LatchGuard::new(&latch).finish());
    }
}
