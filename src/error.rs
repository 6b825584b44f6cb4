//! Error type shared by the register codec, the pulser partitioner and the
//! digitizer engine.
//!
//! Interrupt timeouts are deliberately absent: they are a normal condition of
//! the readout loop and only show up in [`crate::InterruptStats`].

use crate::{CommStatus, DigitizerState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    /// A setting that cannot be encoded for the board. Always raised before
    /// any hardware access.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The transport returned a non-success status. The session should be
    /// considered unusable.
    #[error("hardware communication error during {operation}: {status:?}")]
    HardwareComm {
        operation: &'static str,
        status: CommStatus,
    },

    #[error("`{operation}` is not valid while the digitizer is {state:?}")]
    ProtocolMisuse {
        operation: &'static str,
        state: DigitizerState,
    },

    /// Read buffers must hold a worst-case read; see
    /// [`crate::Vx1730Digitizer::get_size_of_read_buffer_in_32bit_ints`].
    #[error("read buffer holds {provided} words, {required} are required")]
    BufferTooSmall { required: usize, provided: usize },

    #[error("board reported {pending} words pending but only {available} fit in the buffer")]
    BufferOverrun { pending: usize, available: usize },

    /// The FIFO ran dry before delivering the aggregate `EVENT_SIZE` announced.
    #[error("board announced a {expected} word aggregate but the FIFO delivered {received}")]
    ShortRead { expected: usize, received: usize },
}

impl DaqError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HardwareComm { .. } | Self::BufferOverrun { .. } | Self::ShortRead { .. }
        )
    }
}
