// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block assembly/disassembly: the middle-endian 32-bit encoding and the
//! byte-pair swap applied to payload and trailer bytes on the wire.

use byteorder::{ByteOrder, LittleEndian};

use crate::window::{Window, BLOCK_LEN, PAYLOAD_LEN};

/// A full 4080-byte block as it travels over the wire.
#[derive(Clone)]
pub struct Block(pub [u8; BLOCK_LEN]);

impl Block {
    pub fn zeroed() -> Self {
        Block([0u8; BLOCK_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_LEN] {
        &self.0
    }
}

/// Encodes `v` as the receiver's middle-endian 32-bit layout: each 16-bit
/// half byte-swapped, halves swapped relative to little-endian.
pub fn encode_midend(v: u32) -> [u8; 4] {
    [
        ((v >> 16) & 0xFF) as u8,
        ((v >> 24) & 0xFF) as u8,
        (v & 0xFF) as u8,
        ((v >> 8) & 0xFF) as u8,
    ]
}

/// Inverse of [`encode_midend`].
pub fn decode_midend(b: [u8; 4]) -> u32 {
    ((b[1] as u32) << 24) | ((b[0] as u32) << 16) | ((b[3] as u32) << 8) | (b[2] as u32)
}

/// Byte-pair-swaps a buffer in place (`out[i] <-> out[i+1]` for even `i`).
/// An odd trailing byte is left untouched.
fn swap_pairs(buf: &mut [u8]) {
    let mut i = 0;
    while i + 1 < buf.len() {
        buf.swap(i, i + 1);
        i += 2;
    }
}

/// Assembles a 4080-byte block: payload (byte-pair-swapped, zero-padded to
/// an even length) followed by the trailer.
///
/// `entry` carries `-1`/`-2` as their 32-bit two's-complement pattern.
pub fn encode_block(payload: &[u8], base: u32, entry: i32, other_window: Window) -> Block {
    assert!(payload.len() <= PAYLOAD_LEN, "payload exceeds 4064 bytes");

    let mut block = Block::zeroed();
    let padded_len = payload.len() + (payload.len() % 2);

    let mut staged = vec![0u8; padded_len];
    staged[..payload.len()].copy_from_slice(payload);
    block.0[..padded_len].copy_from_slice(&staged);
    swap_pairs(&mut block.0[..padded_len]);

    block.0[0xFE0..0xFE4].copy_from_slice(&encode_midend(base));
    block.0[0xFE4..0xFE8].copy_from_slice(&encode_midend(entry as u32));
    block.0[0xFE8] = 0x00;
    block.0[0xFE9] = other_window.high_byte();
    LittleEndian::write_u16(&mut block.0[0xFEA..0xFEC], payload.len() as u16);

    block
}

/// Decodes a block received from the receiver: byte-pair-swaps the whole
/// 4080 bytes in place, then reads the (now correctly ordered) trailer.
///
/// Returns the payload slice, clamped to 4064 bytes, with a trailing NUL
/// enforced at `len` so callers may treat it as a C string.
pub fn decode_received_block(buf: &mut [u8; BLOCK_LEN]) -> &[u8] {
    swap_pairs(buf);
    let len = (LittleEndian::read_u16(&buf[0xFEA..0xFEC]) as usize).min(PAYLOAD_LEN);
    if len < buf.len() {
        buf[len] = 0;
    }
    &buf[..len]
}
