use crate::codec::{self, ReadoutSizes};
use crate::registers::*;
use crate::{
    ChannelConfig, CommStatus, DaqError, Handle, ModuleConfig, PulserSetting, Result, Transport,
    CHANNELS_PER_BOARD,
};
use log::{debug, error, info, warn};
use std::{thread, time::Duration};

/// Upper bound on cycles handed to one multi-cycle register access.
const MAX_MULTI_CYCLES: usize = 64;
/// Per-attempt interrupt wait.
const DEFAULT_IRQ_TIMEOUT_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitizerState {
    Closed,
    Configured,
    Running,
    Stopped,
    /// A fatal error hit the session. Only dropping the engine is left.
    Faulted,
}

/// Interrupt-wait bookkeeping. Diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptStats {
    pub attempts: u64,
    pub timeouts: u64,
}

/// Waits the board needs during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTimes {
    pub reset: Duration,
    /// DC offset DACs must settle before the ADCs are calibrated.
    pub dc_offset: Duration,
    pub calibration: Duration,
}

impl Default for SettleTimes {
    fn default() -> Self {
        Self {
            reset: Duration::from_millis(10),
            dc_offset: Duration::from_millis(500),
            calibration: Duration::from_millis(100),
        }
    }
}

impl SettleTimes {
    pub fn none() -> Self {
        Self {
            reset: Duration::ZERO,
            dc_offset: Duration::ZERO,
            calibration: Duration::ZERO,
        }
    }
}

fn comm_error(module: usize, operation: &'static str, status: CommStatus) -> DaqError {
    error!("Module {module}: {operation} failed with {status:?}");
    DaqError::HardwareComm { operation, status }
}

/// One V1730 board running DPP-PSD firmware.
///
/// The engine owns the transport and the session handle; the module and
/// channel settings are borrowed for its whole lifetime. Dropping the engine
/// stops a running acquisition and closes the session.
pub struct Vx1730Digitizer<'a, T: Transport> {
    module_number: usize,
    channel_start: usize,
    transport: T,
    module: &'a ModuleConfig,
    channels: &'a [ChannelConfig],
    session: Option<Handle>,
    state: DigitizerState,
    events_per_interrupt: u32,
    irq_timeout_ms: u32,
    settle: SettleTimes,

    // scratch space for multi-cycle reads and writes
    addresses: Vec<u32>,
    values: Vec<u32>,
    statuses: Vec<CommStatus>,

    stats: InterruptStats,
    sizes: ReadoutSizes,
    acquisition_ctrl_base: u32,
    dpp_ctrl: [u32; CHANNELS_PER_BOARD],
}

impl<'a, T: Transport> Vx1730Digitizer<'a, T> {
    pub fn new(
        module_number: usize,
        transport: T,
        module: &'a ModuleConfig,
        channels: &'a [ChannelConfig],
    ) -> Self {
        Self {
            module_number,
            channel_start: module_number * CHANNELS_PER_BOARD,
            transport,
            module,
            channels,
            session: None,
            state: DigitizerState::Closed,
            events_per_interrupt: module.irq_threshold as u32,
            irq_timeout_ms: DEFAULT_IRQ_TIMEOUT_MS,
            settle: SettleTimes::default(),
            addresses: Vec::with_capacity(MAX_MULTI_CYCLES),
            values: Vec::with_capacity(MAX_MULTI_CYCLES),
            statuses: vec![CommStatus::Unknown; MAX_MULTI_CYCLES],
            stats: InterruptStats::default(),
            sizes: ReadoutSizes::default(),
            acquisition_ctrl_base: 0,
            dpp_ctrl: [0; CHANNELS_PER_BOARD],
        }
    }

    pub fn with_settle_times(mut self, settle: SettleTimes) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_irq_timeout(mut self, timeout_ms: u32) -> Self {
        self.irq_timeout_ms = timeout_ms;
        self
    }

    /// Opens the session and programs the board.
    ///
    /// All register values are computed first, so bad settings are reported
    /// without touching the hardware. A failed register write closes the
    /// session again and leaves the engine `Closed`.
    pub fn setup_digitizer(&mut self) -> Result<()> {
        if self.state != DigitizerState::Closed || self.session.is_some() {
            return Err(self.misuse("setup_digitizer"));
        }

        let common = codec::common_registers(self.module, self.channels)?;
        let group = codec::group_registers(self.channels)?;
        let individual = codec::individual_registers(self.channels)?;
        let sizes = codec::readout_sizes(self.module, self.channels)?;
        let mut dpp_ctrl = [0; CHANNELS_PER_BOARD];
        for (i, ch) in self.channels.iter().enumerate() {
            dpp_ctrl[i] = codec::dpp_algorithm_control_word(i, ch)?;
        }

        let handle = self
            .transport
            .open(&self.module.link)
            .map_err(|status| comm_error(self.module_number, "open", status))?;
        self.session = Some(handle);
        info!(
            "Module {}: opened {:?} link {} node {}",
            self.module_number,
            self.module.link.link_type,
            self.module.link.link_number,
            self.module.link.conet_node
        );

        let programmed = self
            .write_register(SOFTWARE_RESET, 1, "software reset")
            .and_then(|_| {
                thread::sleep(self.settle.reset);
                self.write_common_register_data(&common)
            })
            .and_then(|_| self.write_group_register_data(&group))
            .and_then(|_| self.write_individual_register_data(&individual))
            .and_then(|_| self.calibrate());
        if let Err(e) = programmed {
            self.close_session();
            return Err(e);
        }

        self.sizes = sizes;
        self.acquisition_ctrl_base = codec::acquisition_control_base(self.module);
        self.dpp_ctrl = dpp_ctrl;
        self.state = DigitizerState::Configured;
        info!(
            "Module {}: configured, IRQ every {} aggregates, read buffer {} words",
            self.module_number, self.events_per_interrupt, self.sizes.read_buffer_words
        );
        Ok(())
    }

    pub fn start_acquisition(&mut self) -> Result<()> {
        match self.state {
            DigitizerState::Configured | DigitizerState::Stopped => {}
            _ => return Err(self.misuse("start_acquisition")),
        }
        self.faulting(|dig| {
            dig.write_register(SOFTWARE_CLEAR, 1, "software clear")?;
            dig.write_register(
                ACQUISITION_CONTROL,
                dig.acquisition_ctrl_base | AC_RUN,
                "start acquisition",
            )
        })?;
        self.state = DigitizerState::Running;
        info!("Module {}: acquisition started", self.module_number);
        Ok(())
    }

    pub fn stop_acquisition(&mut self) -> Result<()> {
        if self.state != DigitizerState::Running {
            return Err(self.misuse("stop_acquisition"));
        }
        self.faulting(|dig| {
            dig.write_register(
                ACQUISITION_CONTROL,
                dig.acquisition_ctrl_base & !AC_RUN,
                "stop acquisition",
            )
        })?;
        self.state = DigitizerState::Stopped;
        info!(
            "Module {}: acquisition stopped, {} interrupt waits, {} timeouts",
            self.module_number, self.stats.attempts, self.stats.timeouts
        );
        Ok(())
    }

    /// Programs the internal test pulser of every channel.
    pub fn setup_pulsing(&mut self, pulser: &PulserSetting) -> Result<()> {
        match self.state {
            DigitizerState::Configured | DigitizerState::Stopped => {}
            _ => return Err(self.misuse("setup_pulsing")),
        }
        let dpp_ctrl: [u32; CHANNELS_PER_BOARD] = std::array::from_fn(|i| {
            (self.dpp_ctrl[i] & !DPP_TEST_PULSE_MASK)
                | codec::test_pulse_bits(pulser.rates[i], pulser.active[i])
        });
        let plan: Vec<(u32, u32)> = dpp_ctrl
            .iter()
            .enumerate()
            .map(|(i, &word)| (channel_register(DPP_ALGORITHM_CONTROL, i), word))
            .collect();
        self.faulting(|dig| dig.write_plan(&plan, "setup pulsing"))?;
        self.dpp_ctrl = dpp_ctrl;
        debug!(
            "Module {}: pulser active on {} channels",
            self.module_number,
            pulser.active.iter().filter(|&&a| a).count()
        );
        Ok(())
    }

    /// Reads whatever the board holds, waiting for an interrupt if nothing is
    /// ready. Interrupt timeouts are counted and the wait is retried.
    ///
    /// Returns the number of words written to `buffer`.
    pub fn get_data(&mut self, buffer: &mut [u32]) -> Result<usize> {
        loop {
            if let Some(words) = self.try_get_data(buffer)? {
                return Ok(words);
            }
        }
    }

    /// Like [`get_data`](Self::get_data) but gives up after a single interrupt
    /// wait, returning `None` if nothing arrived.
    pub fn try_get_data(&mut self, buffer: &mut [u32]) -> Result<Option<usize>> {
        self.check_read("get_data", DigitizerState::Running, buffer)?;
        self.faulting(|dig| {
            if dig.event_ready()? {
                return dig.read_impromptu_data_available(buffer).map(Some);
            }
            dig.wait_for_interrupt_to_read_data(buffer)
        })
    }

    /// Drains aggregates still buffered on the board after a stop. Never
    /// waits for an interrupt.
    pub fn perform_final_readout(&mut self, buffer: &mut [u32]) -> Result<usize> {
        self.check_read("perform_final_readout", DigitizerState::Stopped, buffer)?;
        self.faulting(|dig| dig.read_available(buffer))
    }

    pub fn get_size_of_read_buffer_in_32bit_ints(&self) -> usize {
        self.sizes.read_buffer_words
    }

    pub fn get_module_start_channel(&self) -> usize {
        self.channel_start
    }

    pub fn get_module_number(&self) -> usize {
        self.module_number
    }

    pub fn state(&self) -> DigitizerState {
        self.state
    }

    pub fn interrupt_stats(&self) -> InterruptStats {
        self.stats
    }

    pub fn readout_sizes(&self) -> &ReadoutSizes {
        &self.sizes
    }

    /// Reads back the common registers and logs them.
    pub fn log_register_dump(&mut self) -> Result<()> {
        let mut dump = String::new();
        for chunk in DUMPED_REGISTERS.chunks(MAX_MULTI_CYCLES) {
            let addresses: Vec<u32> = chunk.iter().map(|&(_, addr)| addr).collect();
            self.multi_read(&addresses, "register dump")?;
            for (&(name, addr), value) in chunk.iter().zip(&self.values) {
                dump.push_str(&format!("{name} (0x{addr:04X}): 0x{value:08X}\n"));
            }
        }
        if dump.ends_with('\n') {
            dump.pop();
        }
        info!("Digitizer {} registers:\n{}", self.module_number, dump);
        Ok(())
    }

    fn misuse(&self, operation: &'static str) -> DaqError {
        DaqError::ProtocolMisuse {
            operation,
            state: self.state,
        }
    }

    /// Runs `op`, moving the engine to `Faulted` if it fails fatally.
    fn faulting<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Module {}: {}, refusing further I/O", self.module_number, e);
                self.state = DigitizerState::Faulted;
            }
        }
        result
    }

    fn session_handle(&self, operation: &'static str) -> Result<Handle> {
        self.session.ok_or_else(|| self.misuse(operation))
    }

    fn close_session(&mut self) {
        if let Some(handle) = self.session.take() {
            match self.transport.close(handle) {
                Ok(()) => info!("Module {}: session closed", self.module_number),
                Err(status) => warn!(
                    "Module {}: closing the session failed with {:?}",
                    self.module_number, status
                ),
            }
        }
        self.state = DigitizerState::Closed;
    }

    fn write_register(&mut self, address: u32, value: u32, operation: &'static str) -> Result<()> {
        let handle = self.session_handle(operation)?;
        self.transport
            .write_register(handle, address, value)
            .map_err(|status| comm_error(self.module_number, operation, status))
    }

    /// Writes `plan` with as few multi-cycle writes as possible. Any failing
    /// cycle aborts the rest.
    fn write_plan(&mut self, plan: &[(u32, u32)], operation: &'static str) -> Result<()> {
        let handle = self.session_handle(operation)?;
        for chunk in plan.chunks(MAX_MULTI_CYCLES) {
            self.addresses.clear();
            self.values.clear();
            for &(address, value) in chunk {
                self.addresses.push(address);
                self.values.push(value);
            }
            let statuses = &mut self.statuses[..chunk.len()];
            statuses.fill(CommStatus::Unknown);
            self.transport
                .multi_write(handle, &self.addresses, &self.values, statuses)
                .map_err(|status| comm_error(self.module_number, operation, status))?;
            if let Some((i, &status)) = statuses.iter().enumerate().find(|(_, s)| !s.is_success())
            {
                error!(
                    "Module {}: writing 0x{:08X} to register 0x{:04X} failed",
                    self.module_number, chunk[i].1, chunk[i].0
                );
                return Err(comm_error(self.module_number, operation, status));
            }
        }
        Ok(())
    }

    /// Fills `self.values` with one multi-cycle read of `addresses`.
    fn multi_read(&mut self, addresses: &[u32], operation: &'static str) -> Result<()> {
        let handle = self.session_handle(operation)?;
        self.addresses.clear();
        self.addresses.extend_from_slice(addresses);
        self.values.clear();
        self.values.resize(addresses.len(), 0);
        let statuses = &mut self.statuses[..addresses.len()];
        statuses.fill(CommStatus::Unknown);
        self.transport
            .multi_read(handle, &self.addresses, &mut self.values, statuses)
            .map_err(|status| comm_error(self.module_number, operation, status))?;
        match statuses.iter().find(|s| !s.is_success()) {
            Some(&status) => Err(comm_error(self.module_number, operation, status)),
            None => Ok(()),
        }
    }

    fn write_common_register_data(&mut self, plan: &[(u32, u32)]) -> Result<()> {
        debug!("Module {}: writing {} common registers", self.module_number, plan.len());
        self.write_plan(plan, "common register write")
    }

    fn write_group_register_data(&mut self, plan: &[(u32, u32)]) -> Result<()> {
        debug!("Module {}: writing {} pair registers", self.module_number, plan.len());
        self.write_plan(plan, "pair register write")
    }

    fn write_individual_register_data(&mut self, plan: &[(u32, u32)]) -> Result<()> {
        debug!("Module {}: writing {} channel registers", self.module_number, plan.len());
        self.write_plan(plan, "channel register write")
    }

    fn calibrate(&mut self) -> Result<()> {
        thread::sleep(self.settle.dc_offset);
        self.write_register(CHANNEL_CALIBRATION, 1, "ADC calibration")?;
        thread::sleep(self.settle.calibration);
        debug!("Module {}: ADC calibration done", self.module_number);
        Ok(())
    }

    fn check_read(
        &self,
        operation: &'static str,
        required: DigitizerState,
        buffer: &[u32],
    ) -> Result<()> {
        if self.state != required {
            return Err(self.misuse(operation));
        }
        if buffer.len() < self.sizes.read_buffer_words {
            return Err(DaqError::BufferTooSmall {
                required: self.sizes.read_buffer_words,
                provided: buffer.len(),
            });
        }
        Ok(())
    }

    fn event_ready(&mut self) -> Result<bool> {
        self.multi_read(&[READOUT_STATUS, EVENT_SIZE], "readout status")?;
        Ok(self.values[0] & RS_EVENT_READY != 0 || self.values[1] > 0)
    }

    fn read_impromptu_data_available(&mut self, buffer: &mut [u32]) -> Result<usize> {
        self.read_available(buffer)
    }

    fn wait_for_interrupt_to_read_data(&mut self, buffer: &mut [u32]) -> Result<Option<usize>> {
        let handle = self.session_handle("get_data")?;
        self.stats.attempts += 1;
        match self.transport.wait_for_interrupt(handle, self.irq_timeout_ms) {
            Ok(()) => self.read_interrupt_data_available(buffer),
            Err(CommStatus::CommTimeout) => {
                self.stats.timeouts += 1;
                Ok(None)
            }
            Err(status) => Err(comm_error(self.module_number, "interrupt wait", status)),
        }
    }

    fn read_interrupt_data_available(&mut self, buffer: &mut [u32]) -> Result<Option<usize>> {
        match self.read_available(buffer)? {
            0 => {
                debug!("Module {}: interrupt with nothing to read", self.module_number);
                Ok(None)
            }
            words => Ok(Some(words)),
        }
    }

    /// Reads aggregate after aggregate while the board has data and another
    /// worst-case aggregate still fits.
    fn read_available(&mut self, buffer: &mut [u32]) -> Result<usize> {
        let handle = self.session_handle("read")?;
        let mut filled = 0;
        loop {
            let pending = self
                .transport
                .read_register(handle, EVENT_SIZE)
                .map_err(|status| comm_error(self.module_number, "event size read", status))?
                as usize;
            if pending == 0 {
                break;
            }
            let available = buffer.len() - filled;
            if pending > available {
                if filled > 0 {
                    break;
                }
                error!(
                    "Module {}: {} words pending, buffer holds {}",
                    self.module_number, pending, available
                );
                return Err(DaqError::BufferOverrun { pending, available });
            }
            let start = filled;
            let end = filled + pending;
            while filled < end {
                let words = self
                    .transport
                    .read_fifo_block(handle, &mut buffer[filled..end])
                    .map_err(|status| comm_error(self.module_number, "FIFO read", status))?;
                if words == 0 {
                    return Err(DaqError::ShortRead {
                        expected: pending,
                        received: filled - start,
                    });
                }
                filled += words;
            }
            if filled > self.sizes.max_fill_for_another_read {
                break;
            }
        }
        Ok(filled)
    }
}

impl<T: Transport> Drop for Vx1730Digitizer<'_, T> {
    fn drop(&mut self) {
        let stopped = match self.state {
            DigitizerState::Running => self.stop_acquisition(),
            DigitizerState::Faulted => self.write_register(
                ACQUISITION_CONTROL,
                self.acquisition_ctrl_base & !AC_RUN,
                "stop acquisition",
            ),
            _ => Ok(()),
        };
        if let Err(e) = stopped {
            warn!("Module {}: stop on drop failed: {}", self.module_number, e);
        }
        self.close_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBoard;
    use crate::CHANNEL_PAIRS;

    fn settings() -> (ModuleConfig, Vec<ChannelConfig>) {
        let module = ModuleConfig {
            aggregates_per_blt: 2,
            ..ModuleConfig::default()
        };
        (module, vec![ChannelConfig::default(); CHANNELS_PER_BOARD])
    }

    fn engine<'a>(
        board: &SimulatedBoard,
        module: &'a ModuleConfig,
        channels: &'a [ChannelConfig],
    ) -> Vx1730Digitizer<'a, SimulatedBoard> {
        Vx1730Digitizer::new(1, board.clone(), module, channels)
            .with_settle_times(SettleTimes::none())
            .with_irq_timeout(1)
    }

    fn running<'a>(
        board: &SimulatedBoard,
        module: &'a ModuleConfig,
        channels: &'a [ChannelConfig],
    ) -> Vx1730Digitizer<'a, SimulatedBoard> {
        let mut dig = engine(board, module, channels);
        dig.setup_digitizer().unwrap();
        dig.start_acquisition().unwrap();
        dig
    }

    #[test]
    fn setup_programs_the_board() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        dig.setup_digitizer().unwrap();

        assert_eq!(dig.state(), DigitizerState::Configured);
        assert!(board.is_open());
        let writes = board.writes();
        assert_eq!(writes.first(), Some(&(SOFTWARE_RESET, 1)));
        assert_eq!(writes.last(), Some(&(CHANNEL_CALIBRATION, 1)));
        assert_eq!(
            board.register(BOARD_CONFIG),
            Some(codec::board_config_word(&module).unwrap())
        );
        assert_eq!(board.register(CHANNEL_ENABLE_MASK), Some(0xFFFF));
        assert_eq!(board.register(ACQUISITION_CONTROL).unwrap() & AC_RUN, 0);
        assert_eq!(
            board.register(channel_register(DPP_ALGORITHM_CONTROL, 15)),
            Some(codec::dpp_algorithm_control_word(15, &channels[15]).unwrap())
        );
        // 1 reset + 10 common + 24 pair + 240 channel + 1 calibration
        assert_eq!(writes.len(), 1 + 10 + 3 * CHANNEL_PAIRS + 15 * CHANNELS_PER_BOARD + 1);
    }

    #[test]
    fn setup_twice_is_misuse() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        dig.setup_digitizer().unwrap();
        assert!(matches!(
            dig.setup_digitizer(),
            Err(DaqError::ProtocolMisuse {
                operation: "setup_digitizer",
                state: DigitizerState::Configured
            })
        ));
        dig.start_acquisition().unwrap();
        assert!(matches!(
            dig.setup_digitizer(),
            Err(DaqError::ProtocolMisuse { .. })
        ));
    }

    #[test]
    fn write_failure_leaves_engine_closed() {
        let (module, channels) = settings();
        for good_writes in [0, 1, 5, 40, 200, 275] {
            let board = SimulatedBoard::new();
            board.fail_writes_after(good_writes);
            let mut dig = engine(&board, &module, &channels);

            let err = dig.setup_digitizer().unwrap_err();
            assert!(
                matches!(
                    err,
                    DaqError::HardwareComm {
                        status: CommStatus::CommError,
                        ..
                    }
                ),
                "{good_writes}: {err:?}"
            );
            assert!(err.is_fatal());
            assert_eq!(dig.state(), DigitizerState::Closed);
            assert!(!board.is_open());
            assert_eq!(board.close_count(), 1);
            assert_eq!(dig.get_size_of_read_buffer_in_32bit_ints(), 0);
            assert!(dig.start_acquisition().is_err());
        }
    }

    #[test]
    fn open_failure_is_reported() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        board.fail_open(CommStatus::DeviceNotFound);
        let mut dig = engine(&board, &module, &channels);
        assert_eq!(
            dig.setup_digitizer(),
            Err(DaqError::HardwareComm {
                operation: "open",
                status: CommStatus::DeviceNotFound
            })
        );
        assert_eq!(dig.state(), DigitizerState::Closed);
        assert!(board.writes().is_empty());
    }

    #[test]
    fn bad_settings_never_reach_the_board() {
        let (module, mut channels) = settings();
        channels[3].cfd_interpolation_points = 9;
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        assert!(matches!(
            dig.setup_digitizer(),
            Err(DaqError::Configuration(_))
        ));
        assert!(!board.is_open());
        assert!(board.writes().is_empty());
        assert_eq!(board.close_count(), 0);
    }

    #[test]
    fn start_and_stop_toggle_only_the_run_bit() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        dig.setup_digitizer().unwrap();
        let base = codec::acquisition_control_base(&module);
        board.clear_write_log();

        dig.start_acquisition().unwrap();
        assert_eq!(dig.state(), DigitizerState::Running);
        assert_eq!(
            board.writes(),
            vec![(SOFTWARE_CLEAR, 1), (ACQUISITION_CONTROL, base | AC_RUN)]
        );
        assert!(matches!(
            dig.start_acquisition(),
            Err(DaqError::ProtocolMisuse { .. })
        ));

        board.clear_write_log();
        dig.stop_acquisition().unwrap();
        assert_eq!(dig.state(), DigitizerState::Stopped);
        assert_eq!(board.writes(), vec![(ACQUISITION_CONTROL, base)]);
        assert!(dig.stop_acquisition().is_err());
        assert_eq!(board.writes().len(), 1);

        dig.start_acquisition().unwrap();
        assert_eq!(board.register(ACQUISITION_CONTROL), Some(base | AC_RUN));
    }

    #[test]
    fn stop_before_setup_is_misuse() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        assert_eq!(
            dig.stop_acquisition(),
            Err(DaqError::ProtocolMisuse {
                operation: "stop_acquisition",
                state: DigitizerState::Closed
            })
        );
        assert!(board.writes().is_empty());
    }

    #[test]
    fn read_buffer_covers_every_pair() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        dig.setup_digitizer().unwrap();
        let sizes = *dig.readout_sizes();
        let pairs: usize = sizes.pair_aggregate_words.iter().sum();
        assert!(dig.get_size_of_read_buffer_in_32bit_ints() >= pairs);
        assert_eq!(
            dig.get_size_of_read_buffer_in_32bit_ints(),
            2 * sizes.board_aggregate_words
        );
    }

    #[test]
    fn ready_data_is_read_without_waiting() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        board.push_aggregate(vec![0xA000_0003, 1, 2]);

        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        assert_eq!(dig.get_data(&mut buffer), Ok(3));
        assert_eq!(&buffer[..3], &[0xA000_0003, 1, 2]);
        assert_eq!(dig.interrupt_stats(), InterruptStats::default());
    }

    #[test]
    fn interrupt_timeouts_are_counted_and_retried() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        board.script_timeouts(3);
        board.push_on_interrupt(vec![9; 10]);

        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        assert_eq!(dig.get_data(&mut buffer), Ok(10));
        assert_eq!(
            dig.interrupt_stats(),
            InterruptStats {
                attempts: 4,
                timeouts: 3
            }
        );
    }

    #[test]
    fn try_get_data_gives_up_after_one_wait() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        assert_eq!(dig.try_get_data(&mut buffer), Ok(None));
        assert_eq!(dig.try_get_data(&mut buffer), Ok(None));
        assert_eq!(
            dig.interrupt_stats(),
            InterruptStats {
                attempts: 2,
                timeouts: 2
            }
        );
    }

    #[test]
    fn several_aggregates_fill_one_buffer() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        let board_aggregate = dig.readout_sizes().board_aggregate_words;
        board.push_aggregate(vec![1; 5]);
        board.push_aggregate(vec![2; 7]);

        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        assert_eq!(dig.get_data(&mut buffer), Ok(12));
        assert_eq!(&buffer[4..6], &[1, 2]);

        // a full worst-case aggregate leaves no room for another one
        board.push_aggregate(vec![3; board_aggregate]);
        board.push_aggregate(vec![4; board_aggregate]);
        board.push_aggregate(vec![5; 4]);
        assert_eq!(dig.get_data(&mut buffer), Ok(2 * board_aggregate));
        assert_eq!(board.pending_aggregates(), 1);
    }

    #[test]
    fn reads_need_a_running_board_and_a_full_size_buffer() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        let mut buffer = vec![0; 16];
        assert!(matches!(
            dig.get_data(&mut buffer),
            Err(DaqError::ProtocolMisuse { .. })
        ));

        dig.setup_digitizer().unwrap();
        dig.start_acquisition().unwrap();
        let required = dig.get_size_of_read_buffer_in_32bit_ints();
        assert_eq!(
            dig.get_data(&mut buffer),
            Err(DaqError::BufferTooSmall {
                required,
                provided: 16
            })
        );
        let mut buffer = vec![0; required];
        assert!(matches!(
            dig.perform_final_readout(&mut buffer),
            Err(DaqError::ProtocolMisuse { .. })
        ));
    }

    #[test]
    fn oversized_aggregate_is_an_overrun() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        let size = dig.get_size_of_read_buffer_in_32bit_ints();
        board.push_aggregate(vec![0; size + 1]);
        let mut buffer = vec![0; size];
        assert_eq!(
            dig.get_data(&mut buffer),
            Err(DaqError::BufferOverrun {
                pending: size + 1,
                available: size
            })
        );
        assert_eq!(dig.state(), DigitizerState::Faulted);
    }

    #[test]
    fn fifo_running_dry_is_a_short_read() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        board.overstate_event_size(6);
        board.push_aggregate(vec![0xA000_0004, 1, 2, 3]);

        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        let err = dig.get_data(&mut buffer).unwrap_err();
        assert_eq!(
            err,
            DaqError::ShortRead {
                expected: 10,
                received: 4
            }
        );
        assert!(err.is_fatal());
        assert_eq!(dig.state(), DigitizerState::Faulted);
        assert_eq!(
            dig.get_data(&mut buffer),
            Err(DaqError::ProtocolMisuse {
                operation: "get_data",
                state: DigitizerState::Faulted
            })
        );
    }

    #[test]
    fn comm_failure_while_acquiring_refuses_further_io() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        dig.setup_digitizer().unwrap();
        board.clear_write_log();
        board.fail_writes_after(1);

        assert!(matches!(
            dig.start_acquisition(),
            Err(DaqError::HardwareComm {
                operation: "start acquisition",
                status: CommStatus::CommError
            })
        ));
        assert_eq!(dig.state(), DigitizerState::Faulted);

        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        let refused = [
            dig.start_acquisition().unwrap_err(),
            dig.stop_acquisition().unwrap_err(),
            dig.setup_pulsing(&PulserSetting::default()).unwrap_err(),
            dig.get_data(&mut buffer).unwrap_err(),
            dig.perform_final_readout(&mut buffer).unwrap_err(),
        ];
        for err in refused {
            assert!(
                matches!(
                    err,
                    DaqError::ProtocolMisuse {
                        state: DigitizerState::Faulted,
                        ..
                    }
                ),
                "{err:?}"
            );
        }
        assert_eq!(board.writes(), vec![(SOFTWARE_CLEAR, 1)]);

        drop(dig);
        assert!(!board.is_open());
        assert_eq!(board.close_count(), 1);
    }

    #[test]
    fn failed_stop_faults_the_engine() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        board.fail_writes_after(0);
        assert!(dig.stop_acquisition().unwrap_err().is_fatal());
        assert_eq!(dig.state(), DigitizerState::Faulted);
        drop(dig);
        assert!(!board.is_open());
    }

    #[test]
    fn final_readout_drains_without_waiting() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = running(&board, &module, &channels);
        dig.stop_acquisition().unwrap();
        board.push_aggregate(vec![7; 6]);
        board.push_aggregate(vec![8; 2]);

        let mut buffer = vec![0; dig.get_size_of_read_buffer_in_32bit_ints()];
        assert_eq!(dig.perform_final_readout(&mut buffer), Ok(8));
        assert_eq!(dig.perform_final_readout(&mut buffer), Ok(0));
        assert_eq!(dig.interrupt_stats().attempts, 0);
    }

    #[test]
    fn pulsing_rewrites_only_the_test_pulse_bits() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        dig.setup_digitizer().unwrap();

        let mut pulser = PulserSetting::default();
        pulser.distribute_rates(0, 8, 0, 4).unwrap();
        dig.setup_pulsing(&pulser).unwrap();

        for ch in 0..CHANNELS_PER_BOARD {
            let base = codec::dpp_algorithm_control_word(ch, &channels[ch]).unwrap();
            let expected = base | codec::test_pulse_bits(pulser.rates[ch], pulser.active[ch]);
            assert_eq!(
                board.register(channel_register(DPP_ALGORITHM_CONTROL, ch)),
                Some(expected),
                "channel {ch}"
            );
        }
        assert_eq!(
            board.register(channel_register(DPP_ALGORITHM_CONTROL, 4)).unwrap()
                & DPP_TEST_PULSE_MASK,
            DPP_TEST_PULSE_ENABLE | (3 << DPP_TEST_PULSE_RATE_SHIFT)
        );
        assert_eq!(
            board.register(channel_register(DPP_ALGORITHM_CONTROL, 0)).unwrap()
                & DPP_TEST_PULSE_MASK,
            0
        );

        // switching the pulser off restores the configured words
        dig.setup_pulsing(&PulserSetting::default()).unwrap();
        assert_eq!(
            board.register(channel_register(DPP_ALGORITHM_CONTROL, 4)),
            Some(codec::dpp_algorithm_control_word(4, &channels[4]).unwrap())
        );

        dig.start_acquisition().unwrap();
        assert!(dig.setup_pulsing(&pulser).is_err());
    }

    #[test]
    fn drop_stops_and_closes() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let dig = running(&board, &module, &channels);
        assert!(board.is_open());
        drop(dig);
        assert!(!board.is_open());
        assert_eq!(board.register(ACQUISITION_CONTROL).unwrap() & AC_RUN, 0);
    }

    #[test]
    fn register_dump_reads_back() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let mut dig = engine(&board, &module, &channels);
        assert!(dig.log_register_dump().is_err());
        dig.setup_digitizer().unwrap();
        dig.log_register_dump().unwrap();
    }

    #[test]
    fn module_numbering() {
        let (module, channels) = settings();
        let board = SimulatedBoard::new();
        let dig = engine(&board, &module, &channels);
        assert_eq!(dig.get_module_number(), 1);
        assert_eq!(dig.get_module_start_channel(), 16);
    }
}
