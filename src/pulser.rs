use crate::{DaqError, Result, CHANNELS_PER_BOARD};

/// Rates of the on-board test pulser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalPulserRate {
    Off,
    OneKHz,
    TenKHz,
    HundKHz,
    OneMHz,
}

impl InternalPulserRate {
    /// Value of the two rate bits in DPP algorithm control.
    pub fn rate_code(self) -> u32 {
        match self {
            Self::Off | Self::OneKHz => 0,
            Self::TenKHz => 1,
            Self::HundKHz => 2,
            Self::OneMHz => 3,
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Off
    }
}

/// Per-channel pulser programming for one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulserSetting {
    pub rates: [u32; CHANNELS_PER_BOARD],
    pub active: [bool; CHANNELS_PER_BOARD],
}

impl Default for PulserSetting {
    fn default() -> Self {
        Self {
            rates: [0; CHANNELS_PER_BOARD],
            active: [false; CHANNELS_PER_BOARD],
        }
    }
}

impl PulserSetting {
    /// Spreads the requested number of channels per rate over the board.
    ///
    /// Channels are filled from 0 upwards: first the channels left over
    /// (pulser off), then 1 MHz, 100 kHz, 10 kHz and finally 1 kHz. The counts
    /// must not add up to more than the channels on the board; on error the
    /// setting is left as it was.
    pub fn distribute_rates(
        &mut self,
        one_khz: u32,
        ten_khz: u32,
        hund_khz: u32,
        one_mhz: u32,
    ) -> Result<()> {
        let requested = [one_khz, ten_khz, hund_khz, one_mhz]
            .iter()
            .map(|&c| c as u64)
            .sum::<u64>();
        let remainder = (CHANNELS_PER_BOARD as u64)
            .checked_sub(requested)
            .ok_or_else(|| {
                DaqError::config(format!(
                    "pulser counts add up to {requested}, more than the {CHANNELS_PER_BOARD} channels"
                ))
            })?;

        let tiers = [
            (InternalPulserRate::Off, remainder as usize),
            (InternalPulserRate::OneMHz, one_mhz as usize),
            (InternalPulserRate::HundKHz, hund_khz as usize),
            (InternalPulserRate::TenKHz, ten_khz as usize),
            (InternalPulserRate::OneKHz, one_khz as usize),
        ];
        let mut channel = 0;
        for (rate, count) in tiers {
            for _ in 0..count {
                self.set_channel(channel, rate);
                channel += 1;
            }
        }
        Ok(())
    }

    fn set_channel(&mut self, channel: usize, rate: InternalPulserRate) {
        self.rates[channel] = rate.rate_code();
        self.active[channel] = rate.is_active();
    }
}
