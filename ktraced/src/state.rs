use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Stop requests wait this long for the loop thread to acknowledge.
const STATE_WAIT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Idle,
    Running,
    /// Cache loop paused so a snapshot can borrow the capture facility.
    Interrupt,
    Stopping,
}

/// Mode state machine shared between the control surface and the
/// capture loop thread. Transitions are serialized by one mutex; the
/// loop thread parks on the condvar and stop is cooperative with a
/// bounded wait.
#[derive(Debug)]
pub struct TraceDumpState {
    state: Mutex<DumpState>,
    cond: Condvar,
    /// The loop thread is parked in [`TraceDumpState::wait_while_interrupted`];
    /// its in-flight slice, trailer included, is on disk.
    paused: AtomicBool,
}

impl Default for TraceDumpState {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceDumpState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DumpState::Idle),
            cond: Condvar::new(),
            paused: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> DumpState {
        *self.state.lock().unwrap()
    }

    /// Atomic test-and-set from `Idle` to `Running`; the only way a
    /// capture (loop or single snapshot) may begin.
    pub fn start_capture(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != DumpState::Idle {
            return false;
        }
        *state = DumpState::Running;
        true
    }

    pub fn is_loop_running(&self) -> bool {
        *self.state.lock().unwrap() == DumpState::Running
    }

    /// Loop thread (or single capture) signalling its own completion.
    pub fn end_capture_self(&self) {
        {
            let mut state = self.state.lock().unwrap();
            *state = DumpState::Idle;
        }
        self.cond.notify_all();
    }

    /// Request the loop to stop, then wait (bounded) until the loop
    /// thread reports `Idle`. Returns `false` when the wait timed out.
    pub fn end_capture(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == DumpState::Running || *state == DumpState::Interrupt {
            *state = DumpState::Stopping;
            self.cond.notify_all();
        }
        let (state, timeout) = self
            .cond
            .wait_timeout_while(
                state,
                Duration::from_millis(STATE_WAIT_TIMEOUT_MS),
                |s| *s != DumpState::Idle,
            )
            .unwrap();
        drop(state);
        !timeout.timed_out()
    }

    /// Pause a running cache loop so a snapshot can run. `false` when no
    /// loop is running.
    pub fn interrupt_cache(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != DumpState::Running {
            return false;
        }
        *state = DumpState::Interrupt;
        self.cond.notify_all();
        true
    }

    /// Resume the cache loop after the interrupting snapshot finished.
    pub fn continue_cache(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != DumpState::Interrupt {
            return false;
        }
        *state = DumpState::Running;
        self.cond.notify_all();
        true
    }

    pub fn is_interrupted(&self) -> bool {
        *self.state.lock().unwrap() == DumpState::Interrupt
    }

    /// Whether the loop thread has parked on the interrupt; the slice in
    /// flight when the interrupt was raised is complete on disk.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Parks the cache loop thread while interrupted. Returns the state
    /// that ended the wait: `Running` to continue, anything else to shut
    /// the loop down.
    pub fn wait_while_interrupted(&self) -> DumpState {
        let state = self.state.lock().unwrap();
        self.paused.store(true, Ordering::Release);
        let (state, _) = self
            .cond
            .wait_timeout_while(
                state,
                Duration::from_millis(STATE_WAIT_TIMEOUT_MS),
                |s| *s == DumpState::Interrupt,
            )
            .unwrap();
        self.paused.store(false, Ordering::Release);
        *state
    }
}
