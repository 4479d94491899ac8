//! Cross-thread wake signal for the driver's one blocking step.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Edge-triggered wake flag shared with worker threads.
///
/// Workers set it after publishing a job result; the driver consumes it when
/// it would otherwise block. The flag stays up until consumed, so concurrent
/// sets cannot lose a wake.
pub(crate) struct WakeSignal {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        WakeSignal {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Raise the flag and rouse the driver if it is blocked.
    pub fn notify(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.condvar.notify_one();
    }

    /// Block until notified. Consumes the flag.
    pub fn wait(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.condvar.wait(&mut woken);
        }
        *woken = false;
    }

    /// Block until notified or `timeout` elapses. Consumes the flag either
    /// way; a spurious early return only costs the caller one extra loop
    /// iteration.
    pub fn wait_timeout(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.condvar.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
}
