//! ExitPromise: a single-shot signal the main task blocks on, deliverable
//! from any task to request orderly shutdown. Delivering it more than once
//! is a no-op, not an error.

use std::sync::{Condvar, Mutex};

pub struct ExitPromise {
    delivered: Mutex<bool>,
    cvar: Condvar,
}

impl ExitPromise {
    pub fn new() -> Self {
        ExitPromise {
            delivered: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Deliver the exit signal. Idempotent: a second (or concurrent) delivery
    /// is dropped silently.
    pub fn deliver(&self) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        if !*delivered {
            *delivered = true;
            self.cvar.notify_all();
        }
    }

    /// Block the calling thread until the promise is delivered.
    pub fn wait(&self) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        while !*delivered {
            delivered = self
                .cvar
                .wait(delivered)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn is_delivered(&self) -> bool {
        *self.delivered.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ExitPromise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_after_deliver() {
        let promise = Arc::new(ExitPromise::new());
        let p2 = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            p2.deliver();
        });
        promise.wait();
        assert!(promise.is_delivered());
        handle.join().unwrap();
    }

    #[test]
    fn test_double_delivery_is_noop() {
        let promise = ExitPromise::new();
        promise.deliver();
        promise.deliver();
        assert!(promise.is_delivered());
    }
}
