//! The hardware link as seen by the digitizer engine.
//!
//! [`Transport`] mirrors the handful of CAENComm calls the engine needs. Every
//! call reports a [`CommStatus`]; anything other than `Success` is an error
//! except `Terminated` at the end of a block transfer.

use serde::Deserialize;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommStatus {
    Success = 0,
    VMEBusError = -1,
    CommError = -2,
    GenericError = -3,
    InvalidParam = -4,
    InvalidLinkType = -5,
    InvalidHandler = -6,
    CommTimeout = -7,
    DeviceNotFound = -8,
    MaxDevicesError = -9,
    DeviceAlreadyOpen = -10,
    NotSupported = -11,
    UnusedBridge = -12,
    Terminated = -13,
    Unknown = 1,
}

impl From<i32> for CommStatus {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::VMEBusError,
            -2 => Self::CommError,
            -3 => Self::GenericError,
            -4 => Self::InvalidParam,
            -5 => Self::InvalidLinkType,
            -6 => Self::InvalidHandler,
            -7 => Self::CommTimeout,
            -8 => Self::DeviceNotFound,
            -9 => Self::MaxDevicesError,
            -10 => Self::DeviceAlreadyOpen,
            -11 => Self::NotSupported,
            -12 => Self::UnusedBridge,
            -13 => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

impl CommStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Turns a raw status into a `Result`, the shape every [`Transport`]
    /// method returns.
    pub fn check(self) -> Result<(), CommStatus> {
        match self {
            Self::Success => Ok(()),
            other => Err(other),
        }
    }
}

/// Session handle returned by [`Transport::open`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle(pub i32);

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LinkType {
    Usb,
    #[default]
    OpticalLink,
    UsbA4818,
}

impl LinkType {
    /// Whether interrupts arrive over the optical (CONET) link rather than
    /// the VME bus.
    pub fn is_optical(self) -> bool {
        matches!(self, Self::OpticalLink | Self::UsbA4818)
    }
}

/// Where a board sits on the vendor link.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(default)]
pub struct LinkAddress {
    pub link_type: LinkType,
    pub link_number: u32,
    pub conet_node: u32,
    pub vme_base_address: u32,
}

pub trait Transport {
    fn open(&mut self, address: &LinkAddress) -> Result<Handle, CommStatus>;

    fn close(&mut self, handle: Handle) -> Result<(), CommStatus>;

    fn write_register(&mut self, handle: Handle, address: u32, value: u32)
        -> Result<(), CommStatus>;

    fn read_register(&mut self, handle: Handle, address: u32) -> Result<u32, CommStatus>;

    /// One multi-cycle write. `statuses[i]` receives the outcome of cycle `i`;
    /// the return value only reflects whether the cycle list was executed.
    fn multi_write(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &[u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus>;

    /// One multi-cycle read into `values`, with per-cycle statuses.
    fn multi_read(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &mut [u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus>;

    /// Blocks for at most `timeout_ms`. A timeout is reported as
    /// `Err(CommStatus::CommTimeout)`.
    fn wait_for_interrupt(&mut self, handle: Handle, timeout_ms: u32) -> Result<(), CommStatus>;

    /// Block-transfer read of the readout FIFO into `words`. Returns the number
    /// of words actually transferred.
    fn read_fifo_block(&mut self, handle: Handle, words: &mut [u32]) -> Result<usize, CommStatus>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, address: &LinkAddress) -> Result<Handle, CommStatus> {
        (**self).open(address)
    }

    fn close(&mut self, handle: Handle) -> Result<(), CommStatus> {
        (**self).close(handle)
    }

    fn write_register(
        &mut self,
        handle: Handle,
        address: u32,
        value: u32,
    ) -> Result<(), CommStatus> {
        (**self).write_register(handle, address, value)
    }

    fn read_register(&mut self, handle: Handle, address: u32) -> Result<u32, CommStatus> {
        (**self).read_register(handle, address)
    }

    fn multi_write(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &[u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus> {
        (**self).multi_write(handle, addresses, values, statuses)
    }

    fn multi_read(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &mut [u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus> {
        (**self).multi_read(handle, addresses, values, statuses)
    }

    fn wait_for_interrupt(&mut self, handle: Handle, timeout_ms: u32) -> Result<(), CommStatus> {
        (**self).wait_for_interrupt(handle, timeout_ms)
    }

    fn read_fifo_block(&mut self, handle: Handle, words: &mut [u32]) -> Result<usize, CommStatus> {
        (**self).read_fifo_block(handle, words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_vendor_numbering() {
        assert_eq!(CommStatus::from(0), CommStatus::Success);
        assert_eq!(CommStatus::from(-7), CommStatus::CommTimeout);
        assert_eq!(CommStatus::from(-13), CommStatus::Terminated);
        assert_eq!(CommStatus::from(-42), CommStatus::Unknown);
        assert_eq!(CommStatus::CommTimeout as i32, -7);
    }

    #[test]
    fn check_maps_success_only() {
        assert!(CommStatus::Success.check().is_ok());
        assert_eq!(CommStatus::CommError.check(), Err(CommStatus::CommError));
    }
}
