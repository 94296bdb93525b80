// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device discovery: filters attached boards by vendor/product id and an
//! optional bus/port/serial selector, and installs the turbo-upload stub on
//! first open.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::clock::Clock;
use crate::control::ControlTransfer;
use crate::error::{CartctlError, Result};
use crate::stubs;
use crate::window::Window;

pub const VENDOR_ID: u16 = 0x04B4;
pub const PRODUCT_ID: u16 = 0x7200;

const REATTACH_RETRIES: u32 = 3;
const REATTACH_BACKOFF: Duration = Duration::from_secs(1);

/// Enumerates and opens a single matching device. Real USB enumeration is
/// out of scope; implementors decide how vendor/product id and bus/port
/// filters are applied.
pub trait DeviceFactory {
    type Transfer: ControlTransfer;

    /// One enumerate-and-open attempt. Returns `None` if no matching device
    /// is currently attached.
    fn try_open(&mut self, bus: Option<u8>, port: Option<u8>) -> Option<Self::Transfer>;
}

/// Finds and opens a board, retrying on "not found" and uploading the
/// turbo-upload stub on first open.
pub struct Locator<'a, F, C> {
    factory: F,
    clock: &'a C,
}

impl<'a, F, C> Locator<'a, F, C>
where
    F: DeviceFactory,
    C: Clock,
{
    pub fn new(factory: F, clock: &'a C) -> Self {
        Locator { factory, clock }
    }

    /// Opens a device, retrying up to 3 times with a 1 s backoff, and
    /// installs the turbo-upload stub on the handle it returns.
    pub fn open_with_retries(
        &mut self,
        bus: Option<u8>,
        port: Option<u8>,
    ) -> Result<F::Transfer> {
        for attempt in 0..=REATTACH_RETRIES {
            if let Some(mut dev) = self.factory.try_open(bus, port) {
                dev.ctrl_push(stubs::TURBO_UPLOAD_ADDR, stubs::turbo_upload())?;
                return Ok(dev);
            }
            if attempt < REATTACH_RETRIES {
                self.clock.sleep(REATTACH_BACKOFF);
            }
        }
        Err(CartctlError::DeviceNotFound)
    }

    /// Polls until a device reappears (no stub reinstall — used after a
    /// reset, where the receiver is already running).
    pub fn poll_until_present(&mut self, bus: Option<u8>, port: Option<u8>) -> Option<F::Transfer> {
        self.factory.try_open(bus, port)
    }
}

/// Reads the first 12 bytes of `W1` and compares the BCD serial at bytes
/// 8-9 (little-endian) against `want`.
pub fn serial_matches(dev: &mut dyn ControlTransfer, want: u16) -> Result<bool> {
    let info = dev.ctrl_read(Window::W1.offset(), 12)?;
    if info.len() < 10 {
        return Ok(false);
    }
    let got = LittleEndian::read_u16(&info[8..10]);
    Ok(got == want)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::control::fake::FakeBus;

    struct CountingFactory {
        opens_before_success: u32,
        opened: u32,
    }

    impl DeviceFactory for CountingFactory {
        type Transfer = FakeBus;

        fn try_open(&mut self, _bus: Option<u8>, _port: Option<u8>) -> Option<FakeBus> {
            self.opened += 1;
            if self.opened > self.opens_before_success {
                Some(FakeBus::new())
            } else {
                None
            }
        }
    }

    #[test]
    fn retries_until_found() {
        let clock = FakeClock::new();
        let factory = CountingFactory {
            opens_before_success: 2,
            opened: 0,
        };
        let mut locator = Locator::new(factory, &clock);
        let result = locator.open_with_retries(None, None);
        assert!(result.is_ok());
        assert_eq!(clock.slept.borrow().len(), 2);
    }

    #[test]
    fn gives_up_after_retries_exhausted() {
        let clock = FakeClock::new();
        let factory = CountingFactory {
            opens_before_success: 99,
            opened: 0,
        };
        let mut locator = Locator::new(factory, &clock);
        assert!(matches!(
            locator.open_with_retries(None, None),
            Err(CartctlError::DeviceNotFound)
        ));
    }
}
