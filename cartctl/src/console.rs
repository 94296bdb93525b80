// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The steady-state console loop: alternates windows, reads whatever the
//! receiver wrote, dispatches escape commands through a [`ConsoleProtocol`],
//! and prints anything else as plain text. Grounded on `HandleConsole`.

use byteorder::{BigEndian, ByteOrder};

use crate::clock::Clock;
use crate::codec::decode_received_block;
use crate::control::ControlTransfer;
use crate::error::Result;
use crate::rpc::{ConsoleProtocol, Dispatch};
use crate::transport::{Transport, DUMMY_DEST_ADDR};
use crate::window::{LengthState, Window};

/// Escape sentinel at payload offset `0..2`; anything else is plain text.
const ESCAPE_MARK: u16 = 0xFFFF;

/// Drives the console loop until the protocol signals termination or the
/// caller's `should_continue` returns `false`.
pub fn run<D, C, P>(
    transport: &mut Transport<'_, D, C>,
    protocol: &mut P,
    mut should_continue: impl FnMut() -> bool,
) -> Result<()>
where
    D: ControlTransfer,
    C: Clock,
    P: ConsoleProtocol,
{
    transport.write_length_free_both_windows()?;

    while should_continue() {
        let w = transport.next_window();
        transport.poll_until_not_free(w)?;

        let mut block = transport.read_raw_block(w)?;
        // Acknowledge immediately so the receiver can start filling the
        // window again while we're still decoding this one.
        transport.free_window(w)?;

        let payload = decode_received_block(&mut block);
        transport.flip_window();

        if payload.is_empty() {
            continue;
        }

        if payload.len() >= 4 && BigEndian::read_u16(&payload[0..2]) == ESCAPE_MARK {
            let cmd = BigEndian::read_u16(&payload[2..4]);
            let content = &payload[4..];
            match protocol.dispatch(cmd, content, payload.len() as u16) {
                Dispatch::Continue => {}
                Dispatch::Terminate => return Ok(()),
                Dispatch::Reply(bytes) => {
                    send_reply(transport, &bytes)?;
                }
            }
        } else {
            print_text(payload);
        }
    }

    Ok(())
}

/// Writes a reply into the alternate window at the dummy-block address and
/// waits for the receiver to consume it, matching the original's
/// reply-then-wait-for-lock cycle.
fn send_reply<D, C>(transport: &mut Transport<'_, D, C>, bytes: &[u8]) -> Result<()>
where
    D: ControlTransfer,
    C: Clock,
{
    let w = transport.next_window();
    transport.write_block(bytes, DUMMY_DEST_ADDR, -1, false, false, true)?;
    transport.wait_until_locked(w)?;
    transport.free_window(w)
}

/// Prints received plain text, treating a trailing NUL as end-of-string and
/// dropping form-feed bytes (a no-op screen-clear on this platform).
fn print_text(payload: &[u8]) {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let text: String = payload[..end]
        .iter()
        .filter(|&&b| b != 0x0C)
        .map(|&b| b as char)
        .collect();
    print!("{}", text);
}

impl<'a, D, C> Transport<'a, D, C>
where
    D: ControlTransfer,
    C: Clock,
{
    /// Writes `Free` to both windows' length fields, the console loop's
    /// initial handshake before it starts polling.
    pub fn write_length_free_both_windows(&mut self) -> Result<()> {
        self.write_length(Window::W0, LengthState::Free)?;
        self.write_length(Window::W1, LengthState::Free)
    }

    /// Writes `Free` back to `w` once its contents have been consumed,
    /// reopening it for the receiver to fill again.
    pub fn free_window(&mut self, w: Window) -> Result<()> {
        self.write_length(w, LengthState::Free)
    }

    /// Advances `next_window` without sending anything, for the console
    /// loop's read side (the write side flips inside `write_block`).
    pub fn flip_window(&mut self) {
        self.advance_window();
    }
}
