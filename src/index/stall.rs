//! Backpressure gate for indexing threads.
//!
//! Flush control stalls the gate when flushing falls behind indexing. While
//! stalled, threads entering [`StallControl::wait_if_stalled`] block until the
//! gate is released or closed. The flag and the wait share one mutex, so a
//! thread can never miss the release it is waiting for.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::info_stream::{InfoStream, NoOutputInfoStream};

const COMPONENT: &str = "DWSC";

#[derive(Debug, Default)]
struct StallState {
    stalled: bool,
    closed: bool,
    num_waiting: usize,
    /// Set once any thread had to wait.
    was_stalled: bool,
}

/// Blocks indexing threads while the writer is stalled.
#[derive(Debug)]
pub struct StallControl {
    state: Mutex<StallState>,
    cond: Condvar,
    info_stream: Arc<dyn InfoStream>,
}

impl Default for StallControl {
    fn default() -> Self {
        Self::new(Arc::new(NoOutputInfoStream))
    }
}

impl StallControl {
    pub fn new(info_stream: Arc<dyn InfoStream>) -> Self {
        StallControl {
            state: Mutex::new(StallState::default()),
            cond: Condvar::new(),
            info_stream,
        }
    }

    /// Set the gate; releasing it wakes every waiter.
    pub fn update_stalled(&self, stalled: bool) {
        let mut state = self.state.lock();
        if state.stalled == stalled {
            return;
        }
        state.stalled = stalled;
        if self.info_stream.is_enabled(COMPONENT) {
            self.info_stream.message(
                COMPONENT,
                if stalled {
                    "now stalled"
                } else {
                    "now unstalled"
                },
            );
        }
        if !stalled {
            self.cond.notify_all();
        }
    }

    /// Block while stalled. Returns immediately if not stalled or closed.
    pub fn wait_if_stalled(&self) {
        let mut state = self.state.lock();
        if !state.stalled || state.closed {
            return;
        }
        state.num_waiting += 1;
        state.was_stalled = true;
        if self.info_stream.is_enabled(COMPONENT) {
            self.info_stream.message(
                COMPONENT,
                &format!("thread blocked; {} waiting", state.num_waiting),
            );
        }
        while state.stalled && !state.closed {
            self.cond.wait(&mut state);
        }
        state.num_waiting -= 1;
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.state.lock().stalled
    }

    /// Whether any thread is blocked right now.
    pub fn has_blocked(&self) -> bool {
        self.state.lock().num_waiting > 0
    }

    pub fn num_waiting(&self) -> usize {
        self.state.lock().num_waiting
    }

    /// Whether any thread ever had to wait.
    pub fn was_stalled(&self) -> bool {
        self.state.lock().was_stalled
    }

    /// Release all waiters for good; later calls never block.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::info_stream::RecordingInfoStream;

    fn wait_for_waiters(control: &StallControl, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while control.num_waiting() != expected {
            assert!(Instant::now() < deadline, "waiters never arrived");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_not_stalled_returns_immediately() {
        let control = StallControl::default();
        control.wait_if_stalled();
        assert!(!control.any_stalled_threads());
        assert!(!control.was_stalled());
    }

    #[test]
    fn test_release_wakes_all_waiters() {
        let stream = Arc::new(RecordingInfoStream::new());
        let control = Arc::new(StallControl::new(stream.clone()));
        control.update_stalled(true);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let control = Arc::clone(&control);
                thread::spawn(move || control.wait_if_stalled())
            })
            .collect();
        wait_for_waiters(&control, 8);
        assert!(control.has_blocked());

        control.update_stalled(false);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(control.num_waiting(), 0);
        assert!(control.was_stalled());
        assert!(stream.contains("DWSC", "now unstalled"));
    }

    #[test]
    fn test_flapping_never_strands_a_waiter() {
        let control = Arc::new(StallControl::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let control = Arc::clone(&control);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        control.wait_if_stalled();
                    }
                })
            })
            .collect();
        for i in 0..2000 {
            control.update_stalled(i % 2 == 0);
        }
        control.update_stalled(false);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_close_releases_waiters() {
        let control = Arc::new(StallControl::default());
        control.update_stalled(true);
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_if_stalled())
        };
        wait_for_waiters(&control, 1);
        control.close();
        waiter.join().unwrap();
        // Closed gates never block, even when stalled.
        control.wait_if_stalled();
    }
}
