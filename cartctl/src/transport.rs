// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ping-pong transport state machine: owns `next_window`, writes
//! blocks, polls for completion, and drives reset/reconnect.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::clock::Clock;
use crate::codec::encode_block;
use crate::control::ControlTransfer;
use crate::error::{CartctlError, Result};
use crate::window::{LengthState, Window, BLOCK_LEN, PAYLOAD_LEN};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REATTACH_SLEEP: Duration = Duration::from_secs(1);
const POST_RESET_SETTLE: Duration = Duration::from_secs(2);
const RESET_REGISTER_ADDR: u32 = 0x304C;

/// `0xc028 = 2` scan-mode reset-assert command, byte 7 carries the value
/// that is cleared 50 ms later to deassert.
const RESET_ASSERT_CMD: [u8; 10] = [0xB6, 0xC3, 0x04, 0x00, 0x00, 0x28, 0xC0, 0x02, 0x00, 0x00];

/// Address and boot-entry the designated "dummy block" targets to force
/// `next_window` back to `W0` after a no-boot transfer. Also the address the
/// console loop writes RPC replies to, matching the source's `DUMMYBASE`.
pub const DUMMY_DEST_ADDR: u32 = 0xFFE000;

/// Protected address ranges a `write_block` refuses unless the destination
/// is the dummy block or the relevant flash mode is active.
fn region_is_refused(base: u32, len: u32, flash_active: bool, six_meg_bank1: bool) -> bool {
    if base == DUMMY_DEST_ADDR {
        return false;
    }
    let end = base.saturating_add(len);

    let in_cart_header = (base >= 0x800000 && base < 0x802000) || (end >= 0x800000 && end < 0x802000);
    if in_cart_header {
        return !six_meg_bank1;
    }
    if base >= 0x800000 || end >= 0x800000 {
        return !flash_active;
    }
    if base >= 0x200000 {
        return !flash_active;
    }
    if base <= 0x2800 {
        return true;
    }
    false
}

pub struct Transport<'a, D, C> {
    dev: D,
    clock: &'a C,
    next_window: Window,
    timeout: Duration,
}

impl<'a, D, C> Transport<'a, D, C>
where
    D: ControlTransfer,
    C: Clock,
{
    pub fn new(dev: D, clock: &'a C, timeout: Duration) -> Self {
        Transport {
            dev,
            clock,
            next_window: Window::W0,
            timeout,
        }
    }

    pub fn next_window(&self) -> Window {
        self.next_window
    }

    /// Flips `next_window` without sending anything, for the console loop's
    /// read side (the write side flips inside [`Transport::write_block`]).
    pub(crate) fn advance_window(&mut self) {
        self.next_window = self.next_window.other();
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Swaps in a freshly reattached device handle, leaving `next_window`
    /// untouched. Used by callers recovering from a mid-operation USB
    /// failure (as opposed to [`Transport::resume_after_reconnect`], which
    /// follows a deliberate device reset and re-syncs `next_window`).
    pub fn replace_device(&mut self, dev: D) {
        self.dev = dev;
    }

    pub(crate) fn read_length(&mut self, w: Window) -> Result<LengthState> {
        let bytes = self.dev.ctrl_read(w.length_field_addr(), 2)?;
        Ok(LengthState::from(LittleEndian::read_u16(&bytes[..2])))
    }

    pub(crate) fn write_length(&mut self, w: Window, state: LengthState) -> Result<()> {
        let v: u16 = state.into();
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, v);
        self.dev.ctrl_push(w.length_field_addr(), &bytes)
    }

    /// Reads the full 4080-byte block at `w`, as the console loop does to
    /// collect a finished buffer.
    pub(crate) fn read_raw_block(&mut self, w: Window) -> Result<[u8; BLOCK_LEN]> {
        let bytes = self.dev.ctrl_read(w.offset(), BLOCK_LEN)?;
        let mut block = [0u8; BLOCK_LEN];
        let n = bytes.len().min(BLOCK_LEN);
        block[..n].copy_from_slice(&bytes[..n]);
        Ok(block)
    }

    /// Polls `w`'s length field until it is anything other than `Free`
    /// (`0xFFFF`), sleeping between attempts. Used by the console loop,
    /// which treats `Free` as "nothing waiting yet".
    pub(crate) fn poll_until_not_free(&mut self, w: Window) -> Result<()> {
        loop {
            if self.read_length(w)? != LengthState::Free {
                return Ok(());
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    /// Writes `0x0000` into both windows' length fields.
    pub fn lock_both_buffers(&mut self) -> Result<()> {
        self.write_length(Window::W0, LengthState::Locked)?;
        self.write_length(Window::W1, LengthState::Locked)?;
        Ok(())
    }

    fn poll_both_until(&mut self, target: LengthState) -> Result<()> {
        loop {
            let w0 = self.read_length(Window::W0)?;
            let w1 = self.read_length(Window::W1)?;
            if w0 == target && w1 == target {
                return Ok(());
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    pub fn wait_for_both_buffers_free(&mut self) -> Result<()> {
        self.poll_both_until(LengthState::Free)
    }

    pub fn wait_for_both_buffers_zero(&mut self) -> Result<()> {
        self.poll_both_until(LengthState::Locked)
    }

    /// Polls `w`'s length field until the receiver has consumed it
    /// (`Locked`/`0x0000`), as the console loop does after handing off an
    /// RPC reply, before reopening the window by writing `Free` back.
    pub(crate) fn wait_until_locked(&mut self, w: Window) -> Result<()> {
        loop {
            if self.read_length(w)? == LengthState::Locked {
                return Ok(());
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    pub fn test_if_both_locked(&mut self) -> Result<bool> {
        Ok(self.read_length(Window::W0)? == LengthState::Locked
            && self.read_length(Window::W1)? == LengthState::Locked)
    }

    /// Locks both buffers, then issues the two-write reset command with a
    /// 50 ms gap, and closes the device handle.
    pub fn reset(&mut self) -> Result<()> {
        self.lock_both_buffers()?;

        let mut cmd = RESET_ASSERT_CMD;
        self.dev.ctrl_push(RESET_REGISTER_ADDR, &cmd)?;
        self.clock.sleep(Duration::from_millis(50));
        cmd[7] = 0;
        self.dev.ctrl_push(RESET_REGISTER_ADDR, &cmd)?;

        self.dev.close();
        Ok(())
    }

    /// If not `force`, waits for both buffers to free first; resets; sleeps
    /// for the host CPU to boot; the caller is responsible for relocating
    /// the device (see `device::Locator`) and calling
    /// [`Transport::resume_after_reconnect`] once it reappears.
    pub fn reset_and_reconnect_begin(&mut self, force: bool) -> Result<()> {
        if !force {
            self.wait_for_both_buffers_free()?;
        }
        self.reset()?;
        self.clock.sleep(POST_RESET_SETTLE);
        Ok(())
    }

    /// Called once a fresh device handle has replaced the stale one after
    /// `reset_and_reconnect_begin`. Waits for the receiver to clear both
    /// buffers and resets `next_window` to `W0`.
    pub fn resume_after_reconnect(&mut self, dev: D) -> Result<()> {
        self.dev = dev;
        self.wait_for_both_buffers_free()?;
        self.next_window = Window::W0;
        Ok(())
    }

    /// The atomic unit of the transport: refuses protected destinations
    /// (except the dummy block), encodes, flips `next_window`, waits for
    /// the handshake, writes the block, and optionally waits for boot.
    pub fn write_block(
        &mut self,
        payload: &[u8],
        base: u32,
        entry: i32,
        flash_active: bool,
        six_meg_bank1: bool,
        skip_wait: bool,
    ) -> Result<()> {
        if region_is_refused(base, payload.len() as u32, flash_active, six_meg_bank1) {
            log::warn!("refusing write to protected region at 0x{:08x}", base);
            return Ok(());
        }

        let other = self.next_window.other();
        let block = encode_block(payload, base, entry, other);

        self.next_window = self.next_window.other();

        // Waits specifically for the window to report free (ready for a
        // fresh write); any other transient state (locked, a stale payload
        // length) is re-polled until the deadline, matching the original
        // handshake's wait for a 0xFxFF-shaped value before proceeding.
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.read_length(self.next_window)? {
                LengthState::ProtocolMismatch(v) => return Err(CartctlError::ProtocolVersion(v)),
                LengthState::Free => break,
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(CartctlError::HandshakeTimeout);
            }
            self.clock.sleep(Duration::from_millis(10));
        }

        self.dev
            .ctrl_write_block(self.next_window.offset(), block.as_bytes())?;

        if entry != -1 && entry != -2 && !skip_wait {
            loop {
                match self.read_length(self.next_window)? {
                    LengthState::Locked => break,
                    LengthState::Unauthorized => return Err(CartctlError::Unauthorized),
                    _ => {}
                }
                self.clock.sleep(POLL_INTERVAL);
            }
        }

        Ok(())
    }

    /// Splits `data` into 4064-byte chunks and writes them in sequence; the
    /// last chunk carries `entry` (or `-1`/`-2` under no-boot), all others
    /// carry `-1`. Restores `next_window == W0` via a dummy block if
    /// no-boot left it skewed.
    ///
    /// `skip_wait` suppresses the post-write wait for the receiver to lock
    /// the block, matching the original's `g_skipwait` flag around the
    /// version-reader stub upload, which runs and replies without ever
    /// latching the window.
    #[allow(clippy::too_many_arguments)]
    pub fn send_payload(
        &mut self,
        data: &[u8],
        mut base: u32,
        entry: i32,
        no_boot: bool,
        flash_active: bool,
        six_meg_bank1: bool,
        skip_wait: bool,
    ) -> Result<()> {
        let final_entry = if no_boot {
            if flash_active {
                -2
            } else {
                -1
            }
        } else {
            entry
        };

        if data.is_empty() {
            self.write_block(&[], base, final_entry, flash_active, six_meg_bank1, skip_wait)?;
        } else {
            let chunks: Vec<&[u8]> = data.chunks(PAYLOAD_LEN).collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.iter().enumerate() {
                let this_entry = if i == last { final_entry } else { -1 };
                self.write_block(chunk, base, this_entry, flash_active, six_meg_bank1, skip_wait)?;
                base += PAYLOAD_LEN as u32;
            }
        }

        if no_boot && self.next_window != Window::W0 {
            self.write_block(&[0u8; 4], DUMMY_DEST_ADDR, -1, flash_active, six_meg_bank1, false)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::control::fake::FakeBus;

    fn free_bus() -> FakeBus {
        let bus = FakeBus::new();
        let mut free = [0u8; 2];
        LittleEndian::write_u16(&mut free, 0xFFFF);
        bus.set(Window::W0.length_field_addr(), &free);
        bus.set(Window::W1.length_field_addr(), &free);
        bus
    }

    #[test]
    fn refuses_protected_region_without_transfer() {
        assert!(region_is_refused(0x1000, 10, false, false));
        assert!(!region_is_refused(0xFFE000, 4, false, false));
        assert!(region_is_refused(0x300000, 10, false, false));
        assert!(!region_is_refused(0x300000, 10, true, false));
    }

    #[test]
    fn ping_pong_alternates_each_block() {
        let clock = FakeClock::new();
        let bus = free_bus();
        let mut transport = Transport::new(bus, &clock, Duration::from_millis(1000));

        assert_eq!(transport.next_window(), Window::W0);
        transport
            .write_block(b"hi", 0x4000, -1, false, false, true)
            .unwrap();
        assert_eq!(transport.next_window(), Window::W1);
        transport
            .write_block(b"hi", 0x4000, -1, false, false, true)
            .unwrap();
        assert_eq!(transport.next_window(), Window::W0);
    }

    #[test]
    fn no_boot_send_payload_ends_on_w0() {
        let clock = FakeClock::new();
        let bus = free_bus();
        let mut transport = Transport::new(bus, &clock, Duration::from_millis(1000));

        let data = vec![0xAAu8; PAYLOAD_LEN + 1];
        transport
            .send_payload(&data, 0x4000, -1, true, false, false, false)
            .unwrap();
        assert_eq!(transport.next_window(), Window::W0);
    }
}
