pub mod codec;
pub mod registers;
pub mod sim;

mod comm;
mod config;
mod digitizer;
mod error;
mod event;
mod output_control;
mod pulser;
mod utils;
mod writer;

#[cfg(feature = "caencomm")]
mod caencomm;

#[cfg(feature = "caencomm")]
pub use caencomm::CaenComm;
pub use comm::{CommStatus, Handle, LinkAddress, LinkType, Transport};
pub use config::*;
pub use digitizer::{DigitizerState, InterruptStats, SettleTimes, Vx1730Digitizer};
pub use error::{DaqError, Result};
pub use event::{buffer_pool, BoardBuffer};
pub use output_control::{FileOutputThreadController, OutputState};
pub use pulser::{InternalPulserRate, PulserSetting};
pub use utils::Counter;
pub use writer::{run_file_path, run_output_worker, RawWriter};
