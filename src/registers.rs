//! V1730 DPP-PSD register map.
//!
//! Common registers live in the 0x8000 and 0xEF00 pages. Individual channel
//! registers are addressed as 0x1n00 + offset where n is the channel number;
//! registers documented as per-pair are written to the even channel.

//========== Common registers ==========

pub const BOARD_CONFIG: u32 = 0x8000;
pub const AGGREGATE_ORGANIZATION: u32 = 0x800C;
pub const CHANNEL_CALIBRATION: u32 = 0x809C; // write any value to start ADC calibration
pub const ACQUISITION_CONTROL: u32 = 0x8100;
pub const ACQUISITION_STATUS: u32 = 0x8104;
pub const GLOBAL_TRIGGER_MASK: u32 = 0x810C;
pub const TRIGGER_OUT_ENABLE_MASK: u32 = 0x8110;
pub const FRONT_PANEL_IO_CONTROL: u32 = 0x811C;
pub const CHANNEL_ENABLE_MASK: u32 = 0x8120;
pub const ROC_FIRMWARE_REVISION: u32 = 0x8124;
pub const BOARD_INFO: u32 = 0x8140;
pub const EVENT_SIZE: u32 = 0x814C; // [31:0] words in the next aggregate
pub const TRIGGER_VALIDATION_MASK_BASE: u32 = 0x8180; // + 4 * pair

pub const READOUT_CONTROL: u32 = 0xEF00;
pub const READOUT_STATUS: u32 = 0xEF04;
pub const INTERRUPT_EVENT_NUMBER: u32 = 0xEF18;
pub const AGGREGATES_PER_BLT: u32 = 0xEF1C;
pub const SOFTWARE_RESET: u32 = 0xEF24;
pub const SOFTWARE_CLEAR: u32 = 0xEF28;

/// Block transfers read the event FIFO from the bottom of the address space.
pub const EVENT_READOUT_BUFFER: u32 = 0x0000;

//========== Individual (per channel) register offsets ==========

pub const RECORD_LENGTH: u32 = 0x20; // pair, [13:0] in units of 8 samples
pub const INPUT_DYNAMIC_RANGE: u32 = 0x28;
pub const EVENTS_PER_AGGREGATE: u32 = 0x34; // pair, [9:0]
pub const PRE_TRIGGER: u32 = 0x38; // [8:0] in units of 4 samples
pub const CFD_SETTINGS: u32 = 0x3C;
pub const SHORT_GATE: u32 = 0x54;
pub const LONG_GATE: u32 = 0x58;
pub const GATE_OFFSET: u32 = 0x5C;
pub const TRIGGER_THRESHOLD: u32 = 0x60;
pub const FIXED_BASELINE: u32 = 0x64;
pub const SHAPED_TRIGGER_WIDTH: u32 = 0x70;
pub const TRIGGER_HOLDOFF: u32 = 0x74;
pub const PSD_THRESHOLD: u32 = 0x78;
pub const PUR_GAP: u32 = 0x7C;
pub const DPP_ALGORITHM_CONTROL: u32 = 0x80;
pub const DPP_ALGORITHM_CONTROL2: u32 = 0x84;
pub const DC_OFFSET: u32 = 0x98;

pub fn channel_register(offset: u32, channel: usize) -> u32 {
    0x1000 | ((channel as u32) << 8) | offset
}

pub fn trigger_validation_mask_register(pair: usize) -> u32 {
    TRIGGER_VALIDATION_MASK_BASE + 4 * pair as u32
}

//========== Bit fields ==========

// Board configuration
pub const BC_AUTO_FLUSH: u32 = 1 << 0;
pub const BC_TRIGGER_PROPAGATION: u32 = 1 << 2;
pub const BC_REQUIRED: u32 = (1 << 4) | (1 << 8); // reserved, must be 1
pub const BC_DUAL_TRACE: u32 = 1 << 11;
pub const BC_ANALOG_PROBE_SHIFT: u32 = 12;
pub const BC_WAVEFORM_RECORDING: u32 = 1 << 16;
pub const BC_EXTRAS_RECORDING: u32 = 1 << 17;
pub const BC_TIMESTAMP_RECORDING: u32 = 1 << 18;
pub const BC_CHARGE_RECORDING: u32 = 1 << 19;
pub const BC_DIGITAL_PROBE1_SHIFT: u32 = 23;
pub const BC_DIGITAL_PROBE2_SHIFT: u32 = 26;
pub const BC_DIGITAL_TRACE: u32 = 1 << 31;

// Acquisition control
pub const AC_START_MODE_MASK: u32 = 0b11;
pub const AC_RUN: u32 = 1 << 2;
pub const AC_COUNT_ALL_TRIGGERS: u32 = 1 << 3;
pub const AC_EXTERNAL_CLOCK: u32 = 1 << 6;

// Global trigger / TRG-OUT / validation masks share the source bits
pub const TM_PAIR_MASK: u32 = 0xFF;
pub const TM_LOGIC_SHIFT: u32 = 8;
pub const TM_LOGIC_MAJORITY_SHIFT: u32 = 10;
pub const GT_MAJORITY_WINDOW_SHIFT: u32 = 20;
pub const GT_MAJORITY_LEVEL_SHIFT: u32 = 24;
pub const TM_LVDS: u32 = 1 << 29;
pub const TM_EXTERNAL: u32 = 1 << 30;
pub const TM_SOFTWARE: u32 = 1 << 31;

// Front panel I/O
pub const FP_TTL: u32 = 1 << 0;

// Readout control / status
pub const RC_IRQ_LEVEL_MASK: u32 = 0b111;
pub const RC_OPTICAL_IRQ: u32 = 1 << 3;
pub const RC_BERR_ENABLE: u32 = 1 << 4;
pub const RS_EVENT_READY: u32 = 1 << 0;

// CFD settings
pub const CFD_FRACTION_SHIFT: u32 = 8;
pub const CFD_INTERPOLATION_SHIFT: u32 = 10;

// DPP algorithm control
pub const DPP_CHARGE_SENSITIVITY_MASK: u32 = 0b111;
pub const DPP_CHARGE_PEDESTAL: u32 = 1 << 4;
pub const DPP_CFD_DISCRIMINATION: u32 = 1 << 6;
pub const DPP_TEST_PULSE_ENABLE: u32 = 1 << 8;
pub const DPP_TEST_PULSE_RATE_SHIFT: u32 = 9;
pub const DPP_TEST_PULSE_MASK: u32 = DPP_TEST_PULSE_ENABLE | (0b11 << DPP_TEST_PULSE_RATE_SHIFT);
pub const DPP_NEGATIVE_POLARITY: u32 = 1 << 16;
pub const DPP_TRIGGER_MODE_SHIFT: u32 = 18;
pub const DPP_BASELINE_SHIFT: u32 = 20;
pub const DPP_SELF_TRIGGER_DISABLE: u32 = 1 << 24;
pub const DPP_PILE_UP_REJECTION: u32 = 1 << 25;

// DPP algorithm control 2
pub const DPP2_LOCAL_SHAPED_MODE_MASK: u32 = 0b11;
pub const DPP2_LOCAL_SHAPED_ENABLE: u32 = 1 << 2;
pub const DPP2_LOCAL_VALIDATION_SHIFT: u32 = 4;
pub const DPP2_LOCAL_VALIDATION_ENABLE: u32 = 1 << 6;
pub const DPP2_EXTRAS_SHIFT: u32 = 8;
pub const DPP2_EXTRAS_TIMESTAMP_FINE: u32 = 0b010; // extended time stamp + fine time
pub const DPP2_SMOOTH_CHARGE: u32 = 1 << 11;
pub const DPP2_SMOOTHING_SHIFT: u32 = 12;

/// Common registers logged by [`crate::Vx1730Digitizer::log_register_dump`].
pub const DUMPED_REGISTERS: &[(&str, u32)] = &[
    ("BoardConfig", BOARD_CONFIG),
    ("AggregateOrganization", AGGREGATE_ORGANIZATION),
    ("AcquisitionControl", ACQUISITION_CONTROL),
    ("AcquisitionStatus", ACQUISITION_STATUS),
    ("GlobalTriggerMask", GLOBAL_TRIGGER_MASK),
    ("TriggerOutEnableMask", TRIGGER_OUT_ENABLE_MASK),
    ("FrontPanelIOControl", FRONT_PANEL_IO_CONTROL),
    ("ChannelEnableMask", CHANNEL_ENABLE_MASK),
    ("RocFirmwareRevision", ROC_FIRMWARE_REVISION),
    ("BoardInfo", BOARD_INFO),
    ("ReadoutControl", READOUT_CONTROL),
    ("ReadoutStatus", READOUT_STATUS),
    ("InterruptEventNumber", INTERRUPT_EVENT_NUMBER),
    ("AggregatesPerBlt", AGGREGATES_PER_BLT),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_addresses() {
        assert_eq!(channel_register(DPP_ALGORITHM_CONTROL, 0), 0x1080);
        assert_eq!(channel_register(CFD_SETTINGS, 5), 0x153C);
        assert_eq!(channel_register(DC_OFFSET, 15), 0x1F98);
        assert_eq!(trigger_validation_mask_register(7), 0x819C);
    }
}
