use crate::LinkAddress;
use confique::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Number of input channels on a V1730 board.
pub const CHANNELS_PER_BOARD: usize = 16;
/// Channels are paired (2k, 2k+1) for aggregate-level settings.
pub const CHANNEL_PAIRS: usize = CHANNELS_PER_BOARD / 2;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub digitizer: DigitizerSettings,
}

impl Conf {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, confique::Error> {
        Conf::builder().file(path.as_ref()).load()
    }
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = "run")]
    pub title: String,
    #[config(default = 0)]
    pub run_number: i32,
    /// Seconds of data taking; the run stops after this much time.
    #[config(default = 60)]
    pub run_duration: u64,
    #[config(default = "./data")]
    pub output_dir: PathBuf,
    /// Number of pre-sized read buffers circulating between the acquisition
    /// and the writer threads.
    #[config(default = 16)]
    pub buffer_count: usize,
}

#[derive(Config, Debug, Clone)]
pub struct DigitizerSettings {
    #[config(default = 0)]
    pub module_number: usize,
    pub module: ModuleConfig,
    /// One entry per channel; left empty, every channel uses the defaults.
    #[config(default = [])]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AcquisitionMode {
    /// Energy/PSD list data only.
    #[default]
    List,
    /// List data plus waveforms.
    Mixed,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StartMode {
    #[default]
    Software,
    SIn,
    FirstTrigger,
    Lvds,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TriggerCounting {
    #[default]
    AcceptedOnly,
    All,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ClockSource {
    #[default]
    Internal,
    External,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum IoLevel {
    #[default]
    Nim,
    Ttl,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TriggerLogic {
    #[default]
    Or,
    And,
    Majority,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AnalogProbe {
    #[default]
    Input,
    Cfd,
    Baseline,
    Smoothed,
}

/// Board-wide settings for one digitizer.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ModuleConfig {
    pub link: LinkAddress,
    pub acquisition_mode: AcquisitionMode,
    pub auto_flush: bool,
    pub propagate_trigger: bool,
    pub trigger_counting: TriggerCounting,
    pub start_mode: StartMode,
    pub clock_source: ClockSource,
    pub io_level: IoLevel,

    pub global_trigger_software: bool,
    pub global_trigger_external: bool,
    pub global_trigger_lvds: bool,
    pub global_trigger_majority_level: u8,
    pub global_trigger_majority_window: u8,

    pub trigger_out_software: bool,
    pub trigger_out_external: bool,
    pub trigger_out_lvds: bool,
    pub trigger_out_logic: TriggerLogic,
    pub trigger_out_majority_level: u8,

    /// VME interrupt level; ignored on optical links.
    pub irq_level: u8,
    /// Number of aggregates stored on the board before it raises an interrupt.
    pub irq_threshold: u16,
    /// Maximum number of board aggregates moved by one block transfer.
    pub aggregates_per_blt: u16,
    /// Output buffer is divided into 2^n blocks.
    pub aggregate_organization: u8,

    pub record_extras: bool,
    pub dual_trace: bool,
    pub analog_probe: AnalogProbe,
    pub digital_trace: bool,
    pub digital_probe1: u8,
    pub digital_probe2: u8,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            link: LinkAddress::default(),
            acquisition_mode: AcquisitionMode::List,
            auto_flush: true,
            propagate_trigger: false,
            trigger_counting: TriggerCounting::AcceptedOnly,
            start_mode: StartMode::Software,
            clock_source: ClockSource::Internal,
            io_level: IoLevel::Nim,
            global_trigger_software: true,
            global_trigger_external: false,
            global_trigger_lvds: false,
            global_trigger_majority_level: 0,
            global_trigger_majority_window: 0,
            trigger_out_software: false,
            trigger_out_external: false,
            trigger_out_lvds: false,
            trigger_out_logic: TriggerLogic::Or,
            trigger_out_majority_level: 0,
            irq_level: 1,
            irq_threshold: 1,
            aggregates_per_blt: 16,
            aggregate_organization: 0xA,
            record_extras: true,
            dual_trace: false,
            analog_probe: AnalogProbe::Input,
            digital_trace: false,
            digital_probe1: 0,
            digital_probe2: 0,
        }
    }
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum InputRange {
    #[default]
    TwoVpp,
    HalfVpp,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Polarity {
    Positive,
    #[default]
    Negative,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Discrimination {
    #[default]
    LeadingEdge,
    ConstantFraction,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CfdFraction {
    Pct25,
    #[default]
    Pct50,
    Pct75,
    Pct100,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BaselineSamples {
    Fixed,
    S16,
    #[default]
    S64,
    S256,
    S1024,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Smoothing {
    #[default]
    Off,
    S2,
    S4,
    S8,
    S16,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ChannelTriggerMode {
    #[default]
    Normal,
    Coincidence,
    AntiCoincidence,
}

/// How the two channels of a pair combine into the pair's shaped trigger.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LocalShapedTrigger {
    #[default]
    Disabled,
    And,
    EvenOnly,
    OddOnly,
    Or,
}

/// Which trigger validates the channels of a pair.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LocalValidation {
    #[default]
    Disabled,
    /// Validation from the mother board (the per-pair validation mask).
    MotherBoard,
    /// Each channel validates the other channel of its pair.
    Paired,
    /// Both of the above.
    And,
}

/// Settings for one input channel. Fields marked "pair" are taken from the
/// even channel of each pair.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// pair: samples per waveform, rounded up to a multiple of 8
    pub record_length: u32,
    /// pair
    pub events_per_aggregate: u16,
    /// samples, in steps of 4
    pub pre_trigger: u16,
    pub input_range: InputRange,
    pub dc_offset: u16,
    pub trigger_threshold: u16,
    pub short_gate: u16,
    pub long_gate: u16,
    pub gate_offset: u16,
    pub fixed_baseline: u16,
    pub baseline_samples: BaselineSamples,
    pub shaped_trigger_width: u16,
    pub trigger_holdoff: u16,
    pub psd_threshold: u16,
    pub pur_gap: u16,
    pub charge_sensitivity: u8,
    pub charge_pedestal: bool,
    pub polarity: Polarity,
    pub discrimination: Discrimination,
    pub cfd_delay: u8,
    pub cfd_fraction: CfdFraction,
    pub cfd_interpolation_points: u8,
    pub smoothing: Smoothing,
    pub smooth_charge_integration: bool,
    pub trigger_mode: ChannelTriggerMode,
    pub pile_up_rejection: bool,
    pub self_trigger: bool,
    pub global_trigger: bool,
    pub trigger_out: bool,

    /// pair: bit k set means pair k's trigger validates this pair
    pub validation_mask: u8,
    /// pair
    pub validation_logic: TriggerLogic,
    /// pair
    pub validation_majority_level: u8,
    /// pair
    pub validation_external: bool,
    /// pair
    pub validation_software: bool,
    /// pair
    pub local_shaped_trigger: LocalShapedTrigger,
    /// pair
    pub local_validation: LocalValidation,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record_length: 192,
            events_per_aggregate: 16,
            pre_trigger: 32,
            input_range: InputRange::TwoVpp,
            dc_offset: 0x8000,
            trigger_threshold: 100,
            short_gate: 24,
            long_gate: 100,
            gate_offset: 8,
            fixed_baseline: 0,
            baseline_samples: BaselineSamples::S64,
            shaped_trigger_width: 16,
            trigger_holdoff: 32,
            psd_threshold: 0,
            pur_gap: 100,
            charge_sensitivity: 1,
            charge_pedestal: false,
            polarity: Polarity::Negative,
            discrimination: Discrimination::LeadingEdge,
            cfd_delay: 6,
            cfd_fraction: CfdFraction::Pct50,
            cfd_interpolation_points: 0,
            smoothing: Smoothing::Off,
            smooth_charge_integration: false,
            trigger_mode: ChannelTriggerMode::Normal,
            pile_up_rejection: false,
            self_trigger: true,
            global_trigger: false,
            trigger_out: false,
            validation_mask: 0,
            validation_logic: TriggerLogic::Or,
            validation_majority_level: 0,
            validation_external: false,
            validation_software: false,
            local_shaped_trigger: LocalShapedTrigger::Disabled,
            local_validation: LocalValidation::Disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_toml_with_defaults() {
        let dir = std::env::temp_dir().join(format!("orchid_conf_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("daq.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[run_settings]
title = "cosmics"
run_number = 12

[digitizer]
module_number = 1

[digitizer.module]
acquisition_mode = "Mixed"
irq_threshold = 4

[digitizer.module.link]
link_type = "Usb"
link_number = 2

[[digitizer.channels]]
enabled = false

[[digitizer.channels]]
trigger_threshold = 250
cfd_fraction = "Pct75"
"#
        )
        .unwrap();
        drop(file);

        let conf = Conf::from_file(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(conf.run_settings.title, "cosmics");
        assert_eq!(conf.run_settings.run_number, 12);
        assert_eq!(conf.run_settings.buffer_count, 16);
        assert_eq!(conf.digitizer.module_number, 1);
        assert_eq!(conf.digitizer.module.acquisition_mode, AcquisitionMode::Mixed);
        assert_eq!(conf.digitizer.module.irq_threshold, 4);
        assert_eq!(conf.digitizer.module.aggregates_per_blt, 16);
        assert_eq!(conf.digitizer.module.link.link_type, crate::LinkType::Usb);
        assert_eq!(conf.digitizer.module.link.link_number, 2);
        assert_eq!(conf.digitizer.channels.len(), 2);
        assert!(!conf.digitizer.channels[0].enabled);
        assert_eq!(conf.digitizer.channels[1].trigger_threshold, 250);
        assert_eq!(conf.digitizer.channels[1].cfd_fraction, CfdFraction::Pct75);
        assert_eq!(conf.digitizer.channels[1].long_gate, 100);
    }
}
