// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `ControlTransfer` port: the only seam through which this crate talks
//! to a real USB device. The USB backend itself (enumeration, transfer
//! plumbing) is out of scope here; only the wire-level request shape is
//! documented, for implementors of this trait.

use crate::error::Result;

/// Vendor control transfer request codes, as sent over USB.
pub mod wire {
    /// `bmRequestType=0xC0, bRequest=0xFF, wValue=4, wIndex=offset`
    pub const READ_REQUEST_TYPE: u8 = 0xC0;
    pub const READ_REQUEST: u8 = 0xFF;
    pub const READ_VALUE: u16 = 4;

    /// `bmRequestType=0x40, bRequest=0xFE, wValue=4080, wIndex=offset`
    pub const WRITE_BLOCK_REQUEST_TYPE: u8 = 0x40;
    pub const WRITE_BLOCK_REQUEST: u8 = 0xFE;
    pub const WRITE_BLOCK_VALUE: u16 = 4080;

    /// `bmRequestType=0x40, bRequest=0xFF, wValue=len, wIndex=offset`
    pub const PUSH_REQUEST_TYPE: u8 = 0x40;
    pub const PUSH_REQUEST: u8 = 0xFF;
}

/// A bidirectional control-transfer primitive addressed by an offset into
/// the board's on-chip RAM. Holds a stateful device handle; implementations
/// are expected to surface handle invalidation as an error so callers can
/// reattach rather than silently reopening.
pub trait ControlTransfer {
    /// `bmRequestType=0xC0, bRequest=0xFF, wValue=4, wIndex=offset`.
    fn ctrl_read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>>;

    /// `bmRequestType=0x40, bRequest=0xFE, wValue=4080, wIndex=offset` —
    /// writes a full 4080-byte block.
    fn ctrl_write_block(&mut self, offset: u32, block: &[u8; 4080]) -> Result<()>;

    /// `bmRequestType=0x40, bRequest=0xFF, wValue=data.len(), wIndex=offset`
    /// — pushes an arbitrary-length blob (stub upload, reset register write).
    fn ctrl_push(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Closes the device handle. Called on successful reset and on fatal
    /// error teardown.
    fn close(&mut self);
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// An in-memory stand-in for a receiver's window memory, keyed by
    /// absolute board address.
    pub struct FakeBus {
        pub memory: RefCell<HashMap<u32, Vec<u8>>>,
        pub closed: RefCell<bool>,
    }

    impl FakeBus {
        pub fn new() -> Self {
            FakeBus {
                memory: RefCell::new(HashMap::new()),
                closed: RefCell::new(false),
            }
        }

        pub fn set(&self, addr: u32, bytes: &[u8]) {
            self.memory.borrow_mut().insert(addr, bytes.to_vec());
        }
    }

    impl ControlTransfer for FakeBus {
        fn ctrl_read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
            let mem = self.memory.borrow();
            let data = mem.get(&offset).cloned().unwrap_or_else(|| vec![0; len]);
            Ok(data[..len.min(data.len())].to_vec())
        }

        fn ctrl_write_block(&mut self, offset: u32, block: &[u8; 4080]) -> Result<()> {
            self.memory.borrow_mut().insert(offset, block.to_vec());
            Ok(())
        }

        fn ctrl_push(&mut self, offset: u32, data: &[u8]) -> Result<()> {
            self.memory.borrow_mut().insert(offset, data.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.borrow_mut() = true;
        }
    }
}
