// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one concrete `ControlTransfer`/`DeviceFactory` pair this crate
//! ships: a `rusb` backend. The port itself is the abstraction named by
//! the design; this module is the implementation of that named external
//! collaborator, not part of the core transport/codec/detection logic.

use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::control::{wire, ControlTransfer};
use crate::device::{serial_matches, DeviceFactory, PRODUCT_ID, VENDOR_ID};
use crate::error::{CartctlError, Result};

pub struct RusbDevice {
    handle: DeviceHandle<Context>,
    timeout: Duration,
}

impl RusbDevice {
    pub fn new(handle: DeviceHandle<Context>, timeout: Duration) -> Self {
        RusbDevice { handle, timeout }
    }
}

impl ControlTransfer for RusbDevice {
    fn ctrl_read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self
            .handle
            .read_control(
                wire::READ_REQUEST_TYPE,
                wire::READ_REQUEST,
                wire::READ_VALUE,
                offset as u16,
                &mut buf,
                self.timeout,
            )
            .map_err(|e| CartctlError::Usb(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn ctrl_write_block(&mut self, offset: u32, block: &[u8; 4080]) -> Result<()> {
        let n = self
            .handle
            .write_control(
                wire::WRITE_BLOCK_REQUEST_TYPE,
                wire::WRITE_BLOCK_REQUEST,
                wire::WRITE_BLOCK_VALUE,
                offset as u16,
                block,
                self.timeout,
            )
            .map_err(|e| CartctlError::Usb(e.to_string()))?;
        if n != block.len() {
            return Err(CartctlError::Usb("short write".into()));
        }
        Ok(())
    }

    fn ctrl_push(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let n = self
            .handle
            .write_control(
                wire::PUSH_REQUEST_TYPE,
                wire::PUSH_REQUEST,
                data.len() as u16,
                offset as u16,
                data,
                self.timeout,
            )
            .map_err(|e| CartctlError::Usb(e.to_string()))?;
        if n != data.len() {
            return Err(CartctlError::Usb("short write".into()));
        }
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}

/// Enumerates attached devices by vendor/product id, optionally filtered
/// by USB bus/port and an on-board BCD serial.
pub struct RusbFactory {
    timeout: Duration,
    select_serial: Option<u16>,
}

impl RusbFactory {
    pub fn new(timeout: Duration, select_serial: Option<u16>) -> Self {
        RusbFactory {
            timeout,
            select_serial,
        }
    }
}

impl DeviceFactory for RusbFactory {
    type Transfer = RusbDevice;

    fn try_open(&mut self, bus: Option<u8>, port: Option<u8>) -> Option<RusbDevice> {
        let context = Context::new().ok()?;
        let devices = context.devices().ok()?;

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                continue;
            }
            if let Some(want_bus) = bus {
                if device.bus_number() != want_bus {
                    continue;
                }
            }
            if let Some(want_port) = port {
                if device.port_number() != want_port {
                    continue;
                }
            }

            let handle = match device.open() {
                Ok(h) => h,
                Err(_) => continue,
            };
            let mut dev = RusbDevice::new(handle, self.timeout);

            if let Some(want_serial) = self.select_serial {
                match serial_matches(&mut dev, want_serial) {
                    Ok(true) => {}
                    _ => continue,
                }
            }

            return Some(dev);
        }

        None
    }
}
