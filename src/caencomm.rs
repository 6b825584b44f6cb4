//! [`Transport`] over the CAENComm library. Built with the `caencomm` feature;
//! `build.rs` generates the bindings.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]

mod ffi {
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
}

use crate::{CommStatus, Handle, LinkAddress, LinkType, Transport};
use ffi::*;
use libc::c_int;

fn status(res: CAENComm_ErrorCode) -> CommStatus {
    CommStatus::from(res as i32)
}

fn check(res: CAENComm_ErrorCode) -> Result<(), CommStatus> {
    status(res).check()
}

fn connection_type(link: LinkType) -> CAENComm_ConnectionType {
    match link {
        LinkType::Usb => CAENComm_ConnectionType_CAENComm_USB,
        LinkType::OpticalLink => CAENComm_ConnectionType_CAENComm_OpticalLink,
        LinkType::UsbA4818 => CAENComm_ConnectionType_CAENComm_USB_A4818,
    }
}

fn copy_statuses(raw: &[CAENComm_ErrorCode], statuses: &mut [CommStatus]) {
    for (out, &res) in statuses.iter_mut().zip(raw) {
        *out = status(res);
    }
}

/// The vendor link. Holds no state of its own; the session lives in the
/// handle the library returns.
#[derive(Debug, Default)]
pub struct CaenComm;

impl Transport for CaenComm {
    fn open(&mut self, address: &LinkAddress) -> Result<Handle, CommStatus> {
        let mut handle: c_int = -1;
        check(unsafe {
            CAENComm_OpenDevice(
                connection_type(address.link_type),
                address.link_number as c_int,
                address.conet_node as c_int,
                address.vme_base_address,
                &mut handle,
            )
        })?;
        if let Err(e) = check(unsafe { CAENComm_IRQEnable(handle) }) {
            unsafe { CAENComm_CloseDevice(handle) };
            return Err(e);
        }
        Ok(Handle(handle))
    }

    fn close(&mut self, handle: Handle) -> Result<(), CommStatus> {
        check(unsafe { CAENComm_CloseDevice(handle.0) })
    }

    fn write_register(&mut self, handle: Handle, address: u32, value: u32) -> Result<(), CommStatus> {
        check(unsafe { CAENComm_Write32(handle.0, address, value) })
    }

    fn read_register(&mut self, handle: Handle, address: u32) -> Result<u32, CommStatus> {
        let mut value = 0u32;
        check(unsafe { CAENComm_Read32(handle.0, address, &mut value) })?;
        Ok(value)
    }

    fn multi_write(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &[u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus> {
        if addresses.len() != values.len() || statuses.len() < addresses.len() {
            return Err(CommStatus::InvalidParam);
        }
        // the library takes mutable pointers even for writes
        let mut addresses = addresses.to_vec();
        let mut values = values.to_vec();
        let mut raw = vec![CAENComm_ErrorCode_CAENComm_Success; addresses.len()];
        let res = unsafe {
            CAENComm_MultiWrite32(
                handle.0,
                addresses.as_mut_ptr(),
                addresses.len() as c_int,
                values.as_mut_ptr(),
                raw.as_mut_ptr(),
            )
        };
        copy_statuses(&raw, statuses);
        check(res)
    }

    fn multi_read(
        &mut self,
        handle: Handle,
        addresses: &[u32],
        values: &mut [u32],
        statuses: &mut [CommStatus],
    ) -> Result<(), CommStatus> {
        if values.len() < addresses.len() || statuses.len() < addresses.len() {
            return Err(CommStatus::InvalidParam);
        }
        let mut addresses = addresses.to_vec();
        let mut raw = vec![CAENComm_ErrorCode_CAENComm_Success; addresses.len()];
        let res = unsafe {
            CAENComm_MultiRead32(
                handle.0,
                addresses.as_mut_ptr(),
                addresses.len() as c_int,
                values.as_mut_ptr(),
                raw.as_mut_ptr(),
            )
        };
        copy_statuses(&raw, statuses);
        check(res)
    }

    fn wait_for_interrupt(&mut self, handle: Handle, timeout_ms: u32) -> Result<(), CommStatus> {
        check(unsafe { CAENComm_IRQWait(handle.0, timeout_ms) })
    }

    fn read_fifo_block(&mut self, handle: Handle, words: &mut [u32]) -> Result<usize, CommStatus> {
        let mut transferred: c_int = 0;
        let bytes = (words.len() * std::mem::size_of::<u32>()) as c_int;
        let res = unsafe {
            CAENComm_BLTRead(
                handle.0,
                crate::registers::EVENT_READOUT_BUFFER,
                words.as_mut_ptr(),
                bytes,
                &mut transferred,
            )
        };
        match status(res) {
            // the board ends a block transfer early once its buffer is empty
            CommStatus::Success | CommStatus::Terminated => Ok(transferred.max(0) as usize),
            other => Err(other),
        }
    }
}
