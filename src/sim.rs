//! An in-memory stand-in for a V1730 on the vendor link.
//!
//! `SimulatedBoard` is a cheap handle over shared state, so a clone kept by a
//! test (or by the binary in `--simulate` mode) can inject readout data and
//! inspect register writes after the first handle has been moved into the engine.

use crate::registers::{
    ACQUISITION_CONTROL, AC_RUN, EVENT_SIZE, READOUT_STATUS, RS_EVENT_READY, SOFTWARE_CLEAR,
    SOFTWARE_RESET,
};
use crate::{CommStatus, Handle, LinkAddress, Transport};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

/// Produces random aggregates while the simulated acquisition is running.
struct Generator {
    rng: StdRng,
    min_words: usize,
    max_words: usize,
    interval: Duration,
}

impl Generator {
    fn aggregate(&mut self) -> Vec<u32> {
        let size = self.rng.random_range(self.min_words..=self.max_words).max(1);
        let mut words = Vec::with_capacity(size);
        // board aggregate header: 0xA in the top nibble, size below
        words.push(0xA000_0000 | (size as u32 & 0x0FFF_FFFF));
        words.extend((1..size).map(|_| self.rng.random::<u32>()));
        words
    }
}

#[derive(Default)]
struct BoardState {
    session: Option<Handle>,
    next_handle: i32,
    close_count: usize,
    open_failure: Option<CommStatus>,
    registers: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    /// Writes that succeed before every further write fails.
    writes_before_failure: Option<usize>,
    fifo: VecDeque<Vec<u32>>,
    on_interrupt: VecDeque<Vec<u32>>,
    scripted_timeouts: u32,
    /// Added to `EVENT_SIZE` while an aggregate is queued.
    event_size_padding: u32,
    generator: Option<Generator>,
}

impl BoardState {
    fn check_handle(&self, handle: Handle) -> Result<(), CommStatus> {
        match self.session {
            Some(open) if open == handle => Ok(()),
            _ => Err(CommStatus::InvalidHandler),
        }
    }

    fn running(&self) -> bool {
        self.registers.get(&ACQUISITION_CONTROL).copied().unwrap_or(0) & AC_RUN != 0
    }

    fn write(&mut self, address: u32, value: u32) -> CommStatus {
        if let Some(remaining) = self.writes_before_failure {
            if remaining == 0 {
                return CommStatus::CommError;
            }
            self.writes_before_failure = Some(remaining - 1);
        }
        self.writes.push((address, value));
        match address {
            SOFTWARE_RESET => self.registers.clear(),
            SOFTWARE_CLEAR => self.fifo.clear(),
            _ => {
                self.registers.insert(address, value);
            }
        }
        CommStatus::Success
    }

    fn read(&self, address: u32) -> u32 {
        match address {
            READOUT_STATUS => {
                if self.fifo.is_empty() {
                    0
                } else {
                    RS_EVENT_READY
                }
            }
            EVENT_SIZE => self
                .fifo
                .front()
                .map_or(0, |agg| agg.len() as u32 + self.event_size_padding),
            _ => self.registers.get(&address).copied().unwrap_or(0),
        }
    }
}

#[derive(Clone, Default)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // a panicked test thread must not hide the board from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `open` fail with `status`.
    pub fn fail_open(&self, status: CommStatus) {
        self.lock().open_failure = Some(status);
    }

    /// Let `count` more register writes succeed, then fail every write with
    /// `CommError`.
    pub fn fail_writes_after(&self, count: usize) {
        self.lock().writes_before_failure = Some(count);
    }

    /// Queue an aggregate that is readable right away.
    pub fn push_aggregate(&self, words: Vec<u32>) {
        self.lock().fifo.push_back(words);
    }

    /// Queue an aggregate that only becomes readable with the next interrupt.
    pub fn push_on_interrupt(&self, words: Vec<u32>) {
        self.lock().on_interrupt.push_back(words);
    }

    /// The next `count` interrupt waits time out regardless of pending data.
    pub fn script_timeouts(&self, count: u32) {
        self.lock().scripted_timeouts = count;
    }

    /// Make `EVENT_SIZE` announce `extra` words more than the FIFO holds.
    pub fn overstate_event_size(&self, extra: u32) {
        self.lock().event_size_padding = extra;
    }

    /// Generate random aggregates of `min_words..=max_words` every `interval`
    /// while acquisition is running.
    pub fn start_generator(&self, seed: u64, min_words: usize, max_words: usize, interval: Duration) {
        self.lock().generator = Some(Generator {
            rng: StdRng::seed_from_u64(seed),
            min_words,
            max_words: max_words.max(min_words),
            interval,
        });
    }

    pub fn register(&self, address: u32) -> Option<u32> {
        self.lock().registers.get(&address).copied()
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.lock().writes.clone()
    }

    pub fn clear_write_log(&self) {
        self.lock().writes.clear();
    }

    pub fn is_open(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn pending_aggregates(&self) -> usize {
        self.lock().fifo.len()
    }
}

impl Transport for SimulatedBoard {
    fn open(&mut self, address: &LinkAddress) -> Result<Handle, CommStatus> {
        let mut state = self.lock();
        if let Some(status) = state.open_failure {
            return Err(status);
        }
        if state.session.is_some() {
            return Err(CommStatus::DeviceAlreadyOpen);
        }
        state.next_handle += 1;
        let handle = Handle(state.next_handle);
        state.session = Some(handle);
        debug!("simulated board opened at {address:?} as {handle:?}");
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) -> Result<(), CommStatus> {
        let mut state = self.lock();
        state.check_handle(handle)?;
        state.session = None;
        state.close_count += 1;
        Ok(())
    }

    fn write_register(&mut self, handle: Handle, address: u32, value: u32) -> Result<(), CommStatus> {
        let mut state = self.lock();
        state.check_handle(handle)?;
        state.write(address, value).check()
    }

    fn read_register(&mut self, handle: Handle, address: u32) -> Result<u32, CommStatus> {
        let state = self.lock();
        state.check_handle(handle)?;
        Ok(state.read(address))
    }

    fn multi_write(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &[u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus> {
        let mut state = self.lock();
        state.check_handle(handle)?;
        if addresses.len() != values.len() || statuses.len() < addresses.len() {
            return Err(CommStatus::InvalidParam);
        }
        for ((&address, &value), status) in addresses.iter().zip(values).zip(statuses.iter_mut()) {
            *status = state.write(address, value);
        }
        Ok(())
    }

    fn multi_read(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &mut [u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus> {
        let state = self.lock();
        state.check_handle(handle)?;
        if values.len() < addresses.len() || statuses.len() < addresses.len() {
            return Err(CommStatus::InvalidParam);
        }
        let cycles = addresses.iter().zip(values.iter_mut()).zip(statuses.iter_mut());
        for ((&address, value), status) in cycles {
            *value = state.read(address);
            *status = CommStatus::Success;
        }
        Ok(())
    }

    fn wait_for_interrupt(&mut self, handle: Handle, timeout_ms: u32) -> Result<(), CommStatus> {
        let nap = {
            let mut state = self.lock();
            state.check_handle(handle)?;
            if state.scripted_timeouts > 0 {
                state.scripted_timeouts -= 1;
                return Err(CommStatus::CommTimeout);
            }
            if !state.on_interrupt.is_empty() {
                let arrived: Vec<_> = state.on_interrupt.drain(..).collect();
                state.fifo.extend(arrived);
                return Ok(());
            }
            if !state.fifo.is_empty() {
                return Ok(());
            }
            match state.generator {
                Some(ref generator) => generator.interval,
                None => return Err(CommStatus::CommTimeout),
            }
        };

        let timeout = Duration::from_millis(timeout_ms as u64);
        thread::sleep(nap.min(timeout));
        let mut state = self.lock();
        if nap > timeout || !state.running() {
            return Err(CommStatus::CommTimeout);
        }
        let aggregate = state.generator.as_mut().map(Generator::aggregate);
        state.fifo.extend(aggregate);
        Ok(())
    }

    fn read_fifo_block(&mut self, handle: Handle, words: &mut [u32]) -> Result<usize, CommStatus> {
        let mut state = self.lock();
        state.check_handle(handle)?;
        let Some(front) = state.fifo.front_mut() else {
            return Ok(0);
        };
        let n = words.len().min(front.len());
        words[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            state.fifo.pop_front();
        }
        Ok(n)
    }
}
