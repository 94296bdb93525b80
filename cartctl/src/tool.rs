// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Tool` composes a [`Transport`] with a [`Locator`] and owns the
//! reattach-retry policy. Reattach is deliberately not a concern of
//! `Transport`/`ControlTransfer` themselves -- it is the caller that knows
//! how to rediscover a device, so it lives here.

use std::time::Duration;

use crate::clock::Clock;
use crate::control::ControlTransfer;
use crate::device::{DeviceFactory, Locator};
use crate::error::{CartctlError, Result};
use crate::transport::Transport;

const REATTACH_SLEEP: Duration = Duration::from_secs(1);
const REATTACH_ATTEMPTS: u32 = 3;

pub struct Tool<'a, F: DeviceFactory, C: Clock> {
    locator: Locator<'a, F, C>,
    transport: Transport<'a, F::Transfer, C>,
    clock: &'a C,
    bus: Option<u8>,
    port: Option<u8>,
}

impl<'a, F, C> Tool<'a, F, C>
where
    F: DeviceFactory,
    C: Clock,
{
    pub fn open(
        mut locator: Locator<'a, F, C>,
        clock: &'a C,
        timeout: Duration,
        bus: Option<u8>,
        port: Option<u8>,
    ) -> Result<Self> {
        let dev = locator.open_with_retries(bus, port)?;
        let transport = Transport::new(dev, clock, timeout);
        Ok(Tool {
            locator,
            transport,
            clock,
            bus,
            port,
        })
    }

    pub fn transport(&mut self) -> &mut Transport<'a, F::Transfer, C> {
        &mut self.transport
    }

    /// The clock this tool was opened with, for operations that need to
    /// sleep outside of any single `Transport` call (e.g. the BIOS
    /// upgrade's fixed post-upload delay).
    pub fn clock(&self) -> &'a C {
        self.clock
    }

    /// Runs `op` against the current transport; on a USB error, closes the
    /// stale handle's owning session, sleeps, relocates the device, and
    /// retries up to [`REATTACH_ATTEMPTS`] times before giving up.
    pub fn with_reattach<T>(
        &mut self,
        mut op: impl FnMut(&mut Transport<'a, F::Transfer, C>) -> Result<T>,
    ) -> Result<T> {
        let mut last_err = None;
        for attempt in 0..=REATTACH_ATTEMPTS {
            match op(&mut self.transport) {
                Ok(v) => return Ok(v),
                Err(CartctlError::Usb(msg)) => {
                    log::warn!("USB error, reattaching: {msg}");
                    last_err = Some(CartctlError::Usb(msg));
                    if attempt == REATTACH_ATTEMPTS {
                        break;
                    }
                    self.clock.sleep(REATTACH_SLEEP);
                    if let Some(dev) = self.locator.poll_until_present(self.bus, self.port) {
                        self.transport.replace_device(dev);
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or(CartctlError::DeviceNotFound))
    }

    /// Before the first transfer of an invocation, checks whether both
    /// windows are already locked -- a sign of a stale transfer left over
    /// from a previous run -- and resets and reconnects if so. Mirrors the
    /// source's one-shot `g_FirstFileSent` guard in `DoFile`, made
    /// unconditional here rather than gated behind its experimental
    /// build-time auto-mode flag.
    pub fn ensure_fresh_session(&mut self) -> Result<()> {
        if self.transport.test_if_both_locked()? {
            self.reset_and_reconnect(true)?;
        }
        Ok(())
    }

    /// Performs a reset and full reconnect, relocating the device once it
    /// reappears.
    pub fn reset_and_reconnect(&mut self, force: bool) -> Result<()> {
        self.transport.reset_and_reconnect_begin(force)?;
        let mut dev = None;
        for _ in 0..REATTACH_ATTEMPTS {
            if let Some(d) = self.locator.poll_until_present(self.bus, self.port) {
                dev = Some(d);
                break;
            }
            self.clock.sleep(REATTACH_SLEEP);
        }
        let dev = dev.ok_or(CartctlError::DeviceNotFound)?;
        self.transport.resume_after_reconnect(dev)
    }
}
