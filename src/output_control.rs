//! Hand-off between the thread that runs the DAQ and the thread that writes
//! run files.
//!
//! The controller publishes a target [`OutputState`] and, for a new run, the
//! title and number. The worker follows the published state and reports back
//! through four acknowledgement flags that the controller may poll.

use log::debug;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Condvar, Mutex, MutexGuard,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// The worker must close its file and exit.
    Terminate = 0,
    /// New run title and number are ready to be picked up.
    NewRunParams = 1,
    /// No file open.
    Waiting = 2,
    /// Run data is being written; the run parameters are fixed.
    Writing = 3,
}

impl OutputState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Terminate,
            1 => Self::NewRunParams,
            2 => Self::Waiting,
            _ => Self::Writing,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    title: String,
    number: i32,
    /// Bumped on every controller notification.
    generation: u64,
}

#[derive(Debug)]
pub struct FileOutputThreadController {
    state: AtomicU8,
    shared: Mutex<Shared>,
    wake: Condvar,
    /// Last notification the worker has seen.
    worker_seen: AtomicU64,

    thread_running: AtomicBool,
    thread_waiting: AtomicBool,
    thread_has_new_params: AtomicBool,
    thread_done: AtomicBool,
}

impl Default for FileOutputThreadController {
    fn default() -> Self {
        Self::new()
    }
}

impl FileOutputThreadController {
    /// A controller in the `Waiting` state with an empty run title.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(OutputState::Waiting as u8),
            shared: Mutex::new(Shared::default()),
            wake: Condvar::new(),
            worker_seen: AtomicU64::new(0),
            thread_running: AtomicBool::new(false),
            thread_waiting: AtomicBool::new(false),
            thread_has_new_params: AtomicBool::new(false),
            thread_done: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> OutputState {
        OutputState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Publishes `state` and wakes the worker. If the state changes, `ack`
    /// is cleared before the worker can observe the new state.
    fn publish(&self, state: OutputState, ack: &AtomicBool) {
        let mut shared = self.lock();
        if self.state.swap(state as u8, Ordering::SeqCst) != state as u8 {
            ack.store(false, Ordering::SeqCst);
        }
        shared.generation += 1;
        drop(shared);
        self.wake.notify_all();
    }

    // ---- controller side ----

    pub fn set_to_terminate(&self) {
        self.publish(OutputState::Terminate, &self.thread_done);
        debug!("output controller: terminate");
    }

    /// Hands a new run title and number to the worker. Only allowed while the
    /// worker is idle; returns `false` and changes nothing otherwise.
    pub fn set_new_run_parameters(&self, title: &str, number: i32) -> bool {
        let mut shared = self.lock();
        if self.state() != OutputState::Waiting {
            return false;
        }
        self.thread_waiting.store(false, Ordering::SeqCst);
        self.thread_has_new_params.store(false, Ordering::SeqCst);
        shared.title.clear();
        shared.title.push_str(title);
        shared.number = number;
        // parameters are in place before the worker can see the new state
        self.state.store(OutputState::NewRunParams as u8, Ordering::SeqCst);
        shared.generation += 1;
        drop(shared);
        self.wake.notify_all();
        debug!("output controller: run parameters {title:?} #{number}");
        true
    }

    pub fn set_to_waiting(&self) {
        self.publish(OutputState::Waiting, &self.thread_waiting);
    }

    pub fn set_to_writing(&self) {
        self.publish(OutputState::Writing, &self.thread_running);
    }

    /// Title and number of the most recent run.
    pub fn run_params(&self) -> (String, i32) {
        let shared = self.lock();
        (shared.title.clone(), shared.number)
    }

    pub fn is_done(&self) -> bool {
        self.thread_done.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread_running.load(Ordering::SeqCst)
    }

    pub fn is_waiting(&self) -> bool {
        self.thread_waiting.load(Ordering::SeqCst)
    }

    pub fn has_read_params(&self) -> bool {
        self.thread_has_new_params.load(Ordering::SeqCst)
    }

    // ---- worker side ----

    /// Current state, without blocking. Counts as having seen every
    /// notification published so far.
    pub fn get_current_state(&self) -> OutputState {
        let shared = self.lock();
        self.worker_seen.store(shared.generation, Ordering::SeqCst);
        self.state()
    }

    /// Blocks until the controller publishes something the worker has not
    /// seen yet, then returns the current state.
    pub fn wait_for_new_state(&self) -> OutputState {
        let seen = self.worker_seen.load(Ordering::SeqCst);
        let mut shared = self.lock();
        while shared.generation == seen {
            shared = self
                .wake
                .wait(shared)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.worker_seen.store(shared.generation, Ordering::SeqCst);
        self.state()
    }

    /// Takes the new run parameters and returns the controller to `Waiting`,
    /// unless the controller has published another state in the meantime.
    pub fn get_new_run_params(&self) -> (String, i32) {
        let params = {
            let shared = self.lock();
            let _ = self.state.compare_exchange(
                OutputState::NewRunParams as u8,
                OutputState::Waiting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            (shared.title.clone(), shared.number)
        };
        self.thread_has_new_params.store(true, Ordering::SeqCst);
        params
    }

    pub fn acknowledge_start(&self) {
        self.thread_running.store(true, Ordering::SeqCst);
    }

    pub fn acknowledge_stop(&self) {
        self.thread_waiting.store(true, Ordering::SeqCst);
    }

    pub fn set_thread_done(&self) {
        self.thread_done.store(true, Ordering::SeqCst);
    }
}
