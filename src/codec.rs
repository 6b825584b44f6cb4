//! Translation of module and channel settings into V1730 register words.
//!
//! Nothing in here touches hardware. Every function either returns the value
//! to write or a [`DaqError::Configuration`] naming the offending setting, so
//! a whole register plan can be built and checked before a session is opened.

use crate::registers::*;
use crate::{
    AcquisitionMode, AnalogProbe, BaselineSamples, CfdFraction, ChannelConfig,
    ChannelTriggerMode, ClockSource, DaqError, Discrimination, InputRange, IoLevel,
    LocalShapedTrigger, LocalValidation, ModuleConfig, Polarity, Result, Smoothing, StartMode,
    TriggerCounting, TriggerLogic, CHANNELS_PER_BOARD, CHANNEL_PAIRS,
};

/// Ordered `(address, value)` writes for one setup stage.
pub type RegisterPlan = Vec<(u32, u32)>;

const MAX_RECORD_LENGTH_WORD: u32 = 0x3FFF;
const MAX_PRE_TRIGGER_WORD: u32 = 0x1FF;
const MAX_EVENTS_PER_AGGREGATE: u32 = 0x3FF;

/// Words of the board aggregate header.
pub const BOARD_HEADER_WORDS: usize = 4;
/// Words of the channel-pair aggregate header.
pub const PAIR_HEADER_WORDS: usize = 2;
/// Trigger time tag plus the charge/PSD word.
const EVENT_BASE_WORDS: usize = 2;

fn check_max(name: &str, channel: Option<usize>, value: u32, max: u32) -> Result<u32> {
    if value > max {
        return Err(match channel {
            Some(ch) => DaqError::config(format!(
                "channel {ch}: {name} = {value} exceeds the maximum of {max}"
            )),
            None => DaqError::config(format!("{name} = {value} exceeds the maximum of {max}")),
        });
    }
    Ok(value)
}

fn check_range(name: &str, value: u32, min: u32, max: u32) -> Result<u32> {
    if value < min || value > max {
        return Err(DaqError::config(format!(
            "{name} = {value} is outside {min}..={max}"
        )));
    }
    Ok(value)
}

fn logic_code(logic: TriggerLogic) -> u32 {
    match logic {
        TriggerLogic::Or => 0,
        TriggerLogic::And => 1,
        TriggerLogic::Majority => 2,
    }
}

fn pair(channels: &[ChannelConfig], pair: usize) -> (&ChannelConfig, &ChannelConfig) {
    (&channels[2 * pair], &channels[2 * pair + 1])
}

/// Checks the shape of the configuration: channel count, at least one enabled
/// channel and the board-level ranges that are not tied to a single register.
pub fn validate_layout(module: &ModuleConfig, channels: &[ChannelConfig]) -> Result<()> {
    if channels.len() != CHANNELS_PER_BOARD {
        return Err(DaqError::config(format!(
            "expected {CHANNELS_PER_BOARD} channel settings, got {}",
            channels.len()
        )));
    }
    if !channels.iter().any(|ch| ch.enabled) {
        return Err(DaqError::config("no channel is enabled"));
    }
    check_range("irq_threshold", module.irq_threshold as u32, 1, 1023)?;
    check_range("aggregates_per_blt", module.aggregates_per_blt as u32, 1, 1023)?;
    check_range("aggregate_organization", module.aggregate_organization as u32, 2, 10)?;
    Ok(())
}

pub fn board_config_word(module: &ModuleConfig) -> Result<u32> {
    let mut word = BC_REQUIRED | BC_TIMESTAMP_RECORDING | BC_CHARGE_RECORDING;
    if module.auto_flush {
        word |= BC_AUTO_FLUSH;
    }
    if module.propagate_trigger {
        word |= BC_TRIGGER_PROPAGATION;
    }
    if module.dual_trace {
        word |= BC_DUAL_TRACE;
    }
    let probe = match module.analog_probe {
        AnalogProbe::Input => 0,
        AnalogProbe::Cfd => 1,
        AnalogProbe::Baseline => 2,
        AnalogProbe::Smoothed => 3,
    };
    word |= probe << BC_ANALOG_PROBE_SHIFT;
    if module.acquisition_mode == AcquisitionMode::Mixed {
        word |= BC_WAVEFORM_RECORDING;
    }
    if module.record_extras {
        word |= BC_EXTRAS_RECORDING;
    }
    let probe1 = check_max("digital_probe1", None, module.digital_probe1 as u32, 7)?;
    let probe2 = check_max("digital_probe2", None, module.digital_probe2 as u32, 7)?;
    word |= probe1 << BC_DIGITAL_PROBE1_SHIFT;
    word |= probe2 << BC_DIGITAL_PROBE2_SHIFT;
    if module.digital_trace {
        word |= BC_DIGITAL_TRACE;
    }
    Ok(word)
}

/// Acquisition control without the run bit. Start and stop OR/mask
/// [`AC_RUN`] into this value.
pub fn acquisition_control_base(module: &ModuleConfig) -> u32 {
    let mut word = match module.start_mode {
        StartMode::Software => 0,
        StartMode::SIn => 1,
        StartMode::FirstTrigger => 2,
        StartMode::Lvds => 3,
    } & AC_START_MODE_MASK;
    if module.trigger_counting == TriggerCounting::All {
        word |= AC_COUNT_ALL_TRIGGERS;
    }
    if module.clock_source == ClockSource::External {
        word |= AC_EXTERNAL_CLOCK;
    }
    word
}

/// Bit `i` set when an enabled channel of pair `i` satisfies `participates`.
fn pair_participation(channels: &[ChannelConfig], participates: fn(&ChannelConfig) -> bool) -> u32 {
    (0..CHANNEL_PAIRS).fold(0, |mask, p| {
        let (even, odd) = pair(channels, p);
        let hit = [even, odd].iter().any(|ch| ch.enabled && participates(ch));
        if hit {
            mask | (1 << p)
        } else {
            mask
        }
    })
}

pub fn global_trigger_mask(module: &ModuleConfig, channels: &[ChannelConfig]) -> Result<u32> {
    let mut word = pair_participation(channels, |ch| ch.global_trigger) & TM_PAIR_MASK;
    let window = check_max(
        "global_trigger_majority_window",
        None,
        module.global_trigger_majority_window as u32,
        0xF,
    )?;
    let level = check_max(
        "global_trigger_majority_level",
        None,
        module.global_trigger_majority_level as u32,
        7,
    )?;
    word |= window << GT_MAJORITY_WINDOW_SHIFT;
    word |= level << GT_MAJORITY_LEVEL_SHIFT;
    if module.global_trigger_lvds {
        word |= TM_LVDS;
    }
    if module.global_trigger_external {
        word |= TM_EXTERNAL;
    }
    if module.global_trigger_software {
        word |= TM_SOFTWARE;
    }
    Ok(word)
}

pub fn trigger_out_enable_mask(module: &ModuleConfig, channels: &[ChannelConfig]) -> Result<u32> {
    let mut word = pair_participation(channels, |ch| ch.trigger_out) & TM_PAIR_MASK;
    word |= logic_code(module.trigger_out_logic) << TM_LOGIC_SHIFT;
    let level = check_max(
        "trigger_out_majority_level",
        None,
        module.trigger_out_majority_level as u32,
        7,
    )?;
    word |= level << TM_LOGIC_MAJORITY_SHIFT;
    if module.trigger_out_lvds {
        word |= TM_LVDS;
    }
    if module.trigger_out_external {
        word |= TM_EXTERNAL;
    }
    if module.trigger_out_software {
        word |= TM_SOFTWARE;
    }
    Ok(word)
}

pub fn channel_enable_mask(channels: &[ChannelConfig]) -> u32 {
    channels
        .iter()
        .enumerate()
        .filter(|(_, ch)| ch.enabled)
        .fold(0, |mask, (i, _)| mask | (1 << i))
}

pub fn readout_control_word(module: &ModuleConfig) -> Result<u32> {
    let mut word = RC_BERR_ENABLE;
    if module.link.link_type.is_optical() {
        word |= RC_OPTICAL_IRQ;
    } else {
        word |= check_max("irq_level", None, module.irq_level as u32, RC_IRQ_LEVEL_MASK)?;
    }
    Ok(word)
}

/// Pair-level half of DPP algorithm control 2: local shaped trigger,
/// local trigger validation and the extras word format.
pub fn local_trigger_management_word(channels: &[ChannelConfig], pair_index: usize) -> u32 {
    let (even, _) = pair(channels, pair_index);
    let mut word = DPP2_EXTRAS_TIMESTAMP_FINE << DPP2_EXTRAS_SHIFT;
    let shaped = match even.local_shaped_trigger {
        LocalShapedTrigger::Disabled => None,
        LocalShapedTrigger::And => Some(0),
        LocalShapedTrigger::EvenOnly => Some(1),
        LocalShapedTrigger::OddOnly => Some(2),
        LocalShapedTrigger::Or => Some(3),
    };
    if let Some(mode) = shaped {
        word |= (mode & DPP2_LOCAL_SHAPED_MODE_MASK) | DPP2_LOCAL_SHAPED_ENABLE;
    }
    let validation = match even.local_validation {
        LocalValidation::Disabled => None,
        LocalValidation::MotherBoard => Some(0),
        LocalValidation::Paired => Some(1),
        LocalValidation::And => Some(2),
    };
    if let Some(mode) = validation {
        word |= (mode << DPP2_LOCAL_VALIDATION_SHIFT) | DPP2_LOCAL_VALIDATION_ENABLE;
    }
    word
}

pub fn trigger_validation_mask(channels: &[ChannelConfig], pair_index: usize) -> Result<u32> {
    let (even, _) = pair(channels, pair_index);
    let mut word = even.validation_mask as u32 & TM_PAIR_MASK;
    word |= logic_code(even.validation_logic) << TM_LOGIC_SHIFT;
    let level = check_max(
        "validation_majority_level",
        Some(2 * pair_index),
        even.validation_majority_level as u32,
        7,
    )?;
    word |= level << TM_LOGIC_MAJORITY_SHIFT;
    if even.validation_external {
        word |= TM_EXTERNAL;
    }
    if even.validation_software {
        word |= TM_SOFTWARE;
    }
    Ok(word)
}

pub fn cfd_settings_word(channel: usize, ch: &ChannelConfig) -> Result<u32> {
    let fraction = match ch.cfd_fraction {
        CfdFraction::Pct25 => 0,
        CfdFraction::Pct50 => 1,
        CfdFraction::Pct75 => 2,
        CfdFraction::Pct100 => 3,
    };
    let points = check_max(
        "cfd_interpolation_points",
        Some(channel),
        ch.cfd_interpolation_points as u32,
        3,
    )?;
    Ok(ch.cfd_delay as u32 | (fraction << CFD_FRACTION_SHIFT) | (points << CFD_INTERPOLATION_SHIFT))
}

/// DPP algorithm control with the internal test pulser off; see
/// [`test_pulse_bits`].
pub fn dpp_algorithm_control_word(channel: usize, ch: &ChannelConfig) -> Result<u32> {
    let mut word = check_max(
        "charge_sensitivity",
        Some(channel),
        ch.charge_sensitivity as u32,
        5,
    )? & DPP_CHARGE_SENSITIVITY_MASK;
    if ch.charge_pedestal {
        word |= DPP_CHARGE_PEDESTAL;
    }
    if ch.discrimination == Discrimination::ConstantFraction {
        word |= DPP_CFD_DISCRIMINATION;
    }
    if ch.polarity == Polarity::Negative {
        word |= DPP_NEGATIVE_POLARITY;
    }
    let mode = match ch.trigger_mode {
        ChannelTriggerMode::Normal => 0,
        ChannelTriggerMode::Coincidence => 1,
        ChannelTriggerMode::AntiCoincidence => 3,
    };
    word |= mode << DPP_TRIGGER_MODE_SHIFT;
    let baseline = match ch.baseline_samples {
        BaselineSamples::Fixed => 0,
        BaselineSamples::S16 => 1,
        BaselineSamples::S64 => 2,
        BaselineSamples::S256 => 3,
        BaselineSamples::S1024 => 4,
    };
    word |= baseline << DPP_BASELINE_SHIFT;
    if !ch.self_trigger {
        word |= DPP_SELF_TRIGGER_DISABLE;
    }
    if ch.pile_up_rejection {
        word |= DPP_PILE_UP_REJECTION;
    }
    Ok(word)
}

/// Test pulser enable and rate bits of DPP algorithm control.
pub fn test_pulse_bits(rate_code: u32, active: bool) -> u32 {
    if !active {
        return 0;
    }
    DPP_TEST_PULSE_ENABLE | ((rate_code & 0b11) << DPP_TEST_PULSE_RATE_SHIFT)
}

pub fn dpp_algorithm_control2_word(local_trigger_word: u32, ch: &ChannelConfig) -> u32 {
    let smoothing = match ch.smoothing {
        Smoothing::Off => 0,
        Smoothing::S2 => 1,
        Smoothing::S4 => 2,
        Smoothing::S8 => 3,
        Smoothing::S16 => 4,
    };
    let mut word = local_trigger_word | (smoothing << DPP2_SMOOTHING_SHIFT);
    if ch.smooth_charge_integration {
        word |= DPP2_SMOOTH_CHARGE;
    }
    word
}

/// Record length register value, in units of 8 samples.
pub fn record_length_word(channel: usize, ch: &ChannelConfig) -> Result<u32> {
    check_max(
        "record_length / 8",
        Some(channel),
        ch.record_length.div_ceil(8),
        MAX_RECORD_LENGTH_WORD,
    )
}

/// Pre-trigger register value, in units of 4 samples.
pub fn pre_trigger_word(channel: usize, ch: &ChannelConfig) -> Result<u32> {
    check_max(
        "pre_trigger / 4",
        Some(channel),
        (ch.pre_trigger as u32).div_ceil(4),
        MAX_PRE_TRIGGER_WORD,
    )
}

pub fn events_per_aggregate_word(channel: usize, ch: &ChannelConfig) -> Result<u32> {
    let value = ch.events_per_aggregate as u32;
    if value == 0 {
        return Err(DaqError::config(format!(
            "channel {channel}: events_per_aggregate must be at least 1"
        )));
    }
    check_max("events_per_aggregate", Some(channel), value, MAX_EVENTS_PER_AGGREGATE)
}

pub fn common_registers(module: &ModuleConfig, channels: &[ChannelConfig]) -> Result<RegisterPlan> {
    validate_layout(module, channels)?;
    let front_panel = match module.io_level {
        IoLevel::Nim => 0,
        IoLevel::Ttl => FP_TTL,
    };
    Ok(vec![
        (BOARD_CONFIG, board_config_word(module)?),
        (AGGREGATE_ORGANIZATION, module.aggregate_organization as u32),
        (ACQUISITION_CONTROL, acquisition_control_base(module)),
        (GLOBAL_TRIGGER_MASK, global_trigger_mask(module, channels)?),
        (TRIGGER_OUT_ENABLE_MASK, trigger_out_enable_mask(module, channels)?),
        (FRONT_PANEL_IO_CONTROL, front_panel),
        (CHANNEL_ENABLE_MASK, channel_enable_mask(channels)),
        (READOUT_CONTROL, readout_control_word(module)?),
        (INTERRUPT_EVENT_NUMBER, module.irq_threshold as u32),
        (AGGREGATES_PER_BLT, module.aggregates_per_blt as u32),
    ])
}

pub fn group_registers(channels: &[ChannelConfig]) -> Result<RegisterPlan> {
    let mut plan = Vec::with_capacity(3 * CHANNEL_PAIRS);
    for p in 0..CHANNEL_PAIRS {
        let even = 2 * p;
        let (ch, _) = pair(channels, p);
        plan.push((
            channel_register(RECORD_LENGTH, even),
            record_length_word(even, ch)?,
        ));
        plan.push((
            channel_register(EVENTS_PER_AGGREGATE, even),
            events_per_aggregate_word(even, ch)?,
        ));
        plan.push((
            trigger_validation_mask_register(p),
            trigger_validation_mask(channels, p)?,
        ));
    }
    Ok(plan)
}

pub fn individual_registers(channels: &[ChannelConfig]) -> Result<RegisterPlan> {
    let mut plan = Vec::with_capacity(15 * CHANNELS_PER_BOARD);
    for (i, ch) in channels.iter().enumerate() {
        let local = local_trigger_management_word(channels, i / 2);
        let range = match ch.input_range {
            InputRange::TwoVpp => 0,
            InputRange::HalfVpp => 1,
        };
        let writes = [
            (INPUT_DYNAMIC_RANGE, range),
            (PRE_TRIGGER, pre_trigger_word(i, ch)?),
            (CFD_SETTINGS, cfd_settings_word(i, ch)?),
            (SHORT_GATE, check_max("short_gate", Some(i), ch.short_gate as u32, 0xFFF)?),
            (LONG_GATE, ch.long_gate as u32),
            (GATE_OFFSET, check_max("gate_offset", Some(i), ch.gate_offset as u32, 0xFF)?),
            (
                TRIGGER_THRESHOLD,
                check_max("trigger_threshold", Some(i), ch.trigger_threshold as u32, 0x3FFF)?,
            ),
            (
                FIXED_BASELINE,
                check_max("fixed_baseline", Some(i), ch.fixed_baseline as u32, 0x3FFF)?,
            ),
            (
                SHAPED_TRIGGER_WIDTH,
                check_max("shaped_trigger_width", Some(i), ch.shaped_trigger_width as u32, 0x3FF)?,
            ),
            (TRIGGER_HOLDOFF, ch.trigger_holdoff as u32),
            (
                PSD_THRESHOLD,
                check_max("psd_threshold", Some(i), ch.psd_threshold as u32, 0x3FF)?,
            ),
            (PUR_GAP, check_max("pur_gap", Some(i), ch.pur_gap as u32, 0xFFF)?),
            (DPP_ALGORITHM_CONTROL, dpp_algorithm_control_word(i, ch)?),
            (DPP_ALGORITHM_CONTROL2, dpp_algorithm_control2_word(local, ch)),
            (DC_OFFSET, ch.dc_offset as u32),
        ];
        plan.extend(
            writes
                .into_iter()
                .map(|(offset, value)| (channel_register(offset, i), value)),
        );
    }
    Ok(plan)
}

/// Worst-case sizes of the readout data, all in 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadoutSizes {
    pub event_words: [usize; CHANNEL_PAIRS],
    pub pair_aggregate_words: [usize; CHANNEL_PAIRS],
    pub board_aggregate_words: usize,
    /// Largest amount one read cycle can deliver; the size every read buffer
    /// must have.
    pub read_buffer_words: usize,
    /// Past this fill level another worst-case board aggregate may not fit.
    pub max_fill_for_another_read: usize,
}

pub fn readout_sizes(module: &ModuleConfig, channels: &[ChannelConfig]) -> Result<ReadoutSizes> {
    validate_layout(module, channels)?;
    let mut sizes = ReadoutSizes::default();
    for p in 0..CHANNEL_PAIRS {
        let (even, odd) = pair(channels, p);
        let enabled = [even, odd].iter().filter(|ch| ch.enabled).count();
        if enabled == 0 {
            continue;
        }
        let mut event = EVENT_BASE_WORDS;
        if module.record_extras {
            event += 1;
        }
        if module.acquisition_mode == AcquisitionMode::Mixed {
            // two 16 bit samples per word
            event += (record_length_word(2 * p, even)? as usize * 8) / 2;
        }
        let per_aggregate = events_per_aggregate_word(2 * p, even)? as usize;
        sizes.event_words[p] = event;
        sizes.pair_aggregate_words[p] = PAIR_HEADER_WORDS + enabled * per_aggregate * event;
    }
    sizes.board_aggregate_words =
        BOARD_HEADER_WORDS + sizes.pair_aggregate_words.iter().sum::<usize>();
    sizes.read_buffer_words = module.aggregates_per_blt as usize * sizes.board_aggregate_words;
    sizes.max_fill_for_another_read = sizes.read_buffer_words - sizes.board_aggregate_words;
    Ok(sizes)
}
