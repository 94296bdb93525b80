// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stub binaries as parameterized objects: each produces a fresh, patched
//! byte vector per use rather than mutating a shared global array. Stub
//! *contents* are opaque blobs (out of scope); only load address, entry
//! point, header skip, and in-place patch sites are specified.

use crate::error::{CartctlError, Result};

/// Address the turbo-upload accelerator stub is installed at on first
/// device open.
pub const TURBO_UPLOAD_ADDR: u32 = 0x304C;

/// Entry point shared by the version-reader and serial-reader stubs.
pub const STUB_ENTRY: u32 = 0x5000;
/// Header bytes these small stubs' container format skips.
pub const STUB_HEADER_SKIP: u32 = 168;

/// Flasher stub entry point.
pub const FLASHER_ENTRY: u32 = 0x4100;
/// Dumper stub entry point.
pub const DUMPER_ENTRY: u32 = 0x10000;
/// BIOS image entry point.
pub const BIOS_ENTRY: u32 = 0x80000;

/// 4-byte signature overwritten in place with the big-endian flash
/// parameter word.
const FLASH_SIGNATURE: [u8; 4] = [0x0A, 0xBC, 0xDE, 0xF0];

/// Offset of the bank-2 flag byte inside the dumper stub.
const DUMPER_BANK_BYTE_OFFSET: usize = 0xAB;

/// Opaque stub payload. Real contents are out of this crate's scope; the
/// byte pattern below is a placeholder of plausible size standing in for
/// the real binary blob an implementation would embed via `include_bytes!`.
fn placeholder_stub(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

pub fn turbo_upload() -> &'static [u8] {
    // Consumed as an opaque blob; a real build embeds it via
    // `include_bytes!("../stubs/turbow.bin")`.
    &[]
}

/// Produces a flasher stub with the flash-parameter word patched in at its
/// signature location.
pub struct FlasherStub {
    base: Vec<u8>,
}

impl FlasherStub {
    pub fn placeholder(len: usize) -> Self {
        let mut base = placeholder_stub(len);
        base.extend_from_slice(&FLASH_SIGNATURE);
        FlasherStub { base }
    }

    /// Patches the 4-byte signature with `param`, big-endian, returning a
    /// fresh byte vector.
    pub fn patched(&self, param: u32) -> Result<Vec<u8>> {
        let pos = find_signature(&self.base, &FLASH_SIGNATURE)
            .ok_or_else(|| CartctlError::Detection("flasher stub signature not found".into()))?;
        let mut out = self.base.clone();
        out[pos..pos + 4].copy_from_slice(&param.to_be_bytes());
        Ok(out)
    }
}

fn find_signature(haystack: &[u8], needle: &[u8; 4]) -> Option<usize> {
    haystack
        .windows(4)
        .position(|w| w == needle.as_slice())
}

/// Produces a dumper stub with the bank-2 flag byte patched in.
pub struct DumperStub {
    base: Vec<u8>,
}

impl DumperStub {
    pub fn placeholder(len: usize) -> Self {
        DumperStub {
            base: placeholder_stub(len.max(DUMPER_BANK_BYTE_OFFSET + 1)),
        }
    }

    /// `bank2 == true` patches byte `0xAB` to `1` as the source does when
    /// `nCartBank == 1`.
    pub fn patched(&self, bank2: bool) -> Vec<u8> {
        let mut out = self.base.clone();
        if bank2 {
            out[DUMPER_BANK_BYTE_OFFSET] = 1;
        }
        out
    }
}

/// Small stubs with no in-place patching: version reader, serial reader.
pub fn version_reader_stub(len: usize) -> Vec<u8> {
    placeholder_stub(len)
}

pub fn serial_reader_stub(len: usize) -> Vec<u8> {
    placeholder_stub(len)
}

/// Board revision discovered by the version-reader stub, used to pick a
/// BIOS upgrade image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardRevision {
    Rev1,
    Rev2Or3,
}

impl BoardRevision {
    pub fn from_major(major: u8) -> Option<Self> {
        match major {
            1 => Some(BoardRevision::Rev1),
            2 | 3 => Some(BoardRevision::Rev2Or3),
            _ => None,
        }
    }

    /// BCD `(major, minor, rev)` the board is already considered to be
    /// "up to date" at, matching the source's already-current check.
    pub fn target_version(self) -> (u8, u8, u8) {
        match self {
            BoardRevision::Rev1 => (1, 2, 4),
            BoardRevision::Rev2Or3 => (3, 0, 2),
        }
    }
}

/// Magic 4-byte prefix identifying a serial/version-info reply.
pub const SERIAL_INFO_MAGIC: [u8; 4] = [0x57, 0xFA, 0x0D, 0xF0];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flasher_patch_overwrites_signature() {
        let stub = FlasherStub::placeholder(32);
        let patched = stub.patched(0x0000_003E).unwrap();
        let pos = find_signature(&stub.base, &FLASH_SIGNATURE).unwrap();
        assert_eq!(&patched[pos..pos + 4], &[0x00, 0x00, 0x00, 0x3E]);
    }

    #[test]
    fn dumper_patch_sets_bank_byte() {
        let stub = DumperStub::placeholder(16);
        assert_eq!(stub.patched(false)[DUMPER_BANK_BYTE_OFFSET], 0);
        assert_eq!(stub.patched(true)[DUMPER_BANK_BYTE_OFFSET], 1);
    }

    #[test]
    fn board_revision_targets() {
        assert_eq!(BoardRevision::Rev1.target_version(), (1, 2, 4));
        assert_eq!(BoardRevision::Rev2Or3.target_version(), (3, 0, 2));
        assert_eq!(BoardRevision::from_major(4), None);
    }
}
