// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File-format autodetection: classifies an input byte stream as one of
//! the recognized container formats and extracts base address, entry
//! address, and header skip.

pub mod elf;

use byteorder::{BigEndian, ByteOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    CartRom,
    CartRomPlus512,
    Coff,
    Elf,
    ServerExe,
    DriAbs,
    AlcyonAbs,
    PaddedHeaderless,
    RomExtension,
    Unknown,
}

pub struct Detection {
    pub format: Format,
    pub base: u32,
    pub skip: u32,
    /// File length, possibly recomputed (ELF, DRI ABS, Alcyon ABS).
    pub flen: u32,
    /// `false` when the classifier had to guess (no recognized header).
    pub matched: bool,
    /// Present only for ELF input: the rebuilt flat memory image that
    /// replaces the original file bytes.
    pub image: Option<Vec<u8>>,
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    if offset + 4 > data.len() {
        return 0;
    }
    BigEndian::read_u32(&data[offset..offset + 4])
}

/// Classifies `data`, named `filename` (for the `.rom` extension
/// fallback), given the starting guesses `(base, skip)` and whether the
/// user passed an "override base" flag (which suppresses every detector's
/// base-address write). A user-supplied header skip, if present, overrides
/// whatever the detector computed.
pub fn detect(
    data: &[u8],
    filename: &str,
    override_base: bool,
    user_header_skip: Option<u32>,
) -> crate::error::Result<Detection> {
    let flen = data.len() as u32;
    let mut base = 0x4000u32;
    let mut skip = 0u32;
    let mut out_flen = flen;
    let mut format = Format::Unknown;
    let mut matched = true;
    let mut image = None;

    if flen > 0x2000 && be_u32(data, 0x404) == 0x802000 {
        format = Format::CartRom;
        if !override_base {
            base = 0x802000;
        }
        skip = 0x2000;
    } else if flen > 0x2200 && be_u32(data, 0x604) == 0x802000 {
        format = Format::CartRomPlus512;
        if !override_base {
            base = 0x802000;
        }
        skip = 0x2200;
    } else if flen > 72 && data[0] == 0x01 && data[1] == 0x50 {
        format = Format::Coff;
        if !override_base {
            base = be_u32(data, 56);
        }
        skip = be_u32(data, 68);
        if flen <= skip {
            return Err(crate::error::CartctlError::Detection(
                "COFF detection error or corrupt file".into(),
            ));
        }
    } else if flen > 0x30 && data.len() >= 4 && &data[0..4] == b"\x7FELF" {
        format = Format::Elf;
        let loaded = elf::load(data)?;
        skip = loaded.entry;
        out_flen = loaded.len;
        if !override_base {
            base = loaded.entry;
        }
        image = Some(loaded.image);
    } else if flen > 0x2E && data.len() >= 0x20 && &data[0x1C..0x20] == b"JAGR" {
        format = Format::ServerExe;
        if !override_base {
            base = be_u32(data, 0x22);
        }
        skip = 0x2E;
    } else if flen > 0x24 && data[0] == 0x60 && data[1] == 0x1B {
        format = Format::DriAbs;
        skip = 0x24;
        base = be_u32(data, 0x16);
        out_flen = be_u32(data, 6) + be_u32(data, 2) + skip;
    } else if flen > 0xA8 && data[0] == 0x01 && data[1] == 0x50 {
        format = Format::AlcyonAbs;
        skip = 0xA8;
        base = be_u32(data, 0x28);
        out_flen = be_u32(data, 0x18) + be_u32(data, 0x1C) + skip;
    } else if let Some(padded_skip) = detect_padded_headerless(data, flen) {
        format = Format::PaddedHeaderless;
        if !override_base {
            base = 0x802000;
        }
        skip = padded_skip;
    } else if filename.to_ascii_lowercase().ends_with(".rom") {
        format = Format::RomExtension;
        if !override_base {
            base = 0x802000;
        }
        skip = 0;
        matched = false;
    } else {
        matched = false;
    }

    if let Some(user_skip) = user_header_skip {
        skip = user_skip;
    }

    Ok(Detection {
        format,
        base,
        skip,
        flen: out_flen,
        matched,
        image,
    })
}

/// Headerless ROM padded with a solid value: skip the first 8 bytes (some
/// vendors put data there), require the next byte to repeat through offset
/// 8192, and byte 8192 itself to differ.
fn detect_padded_headerless(data: &[u8], flen: u32) -> Option<u32> {
    if flen <= 0x2000 || data.len() <= 8192 {
        return None;
    }
    let first = data[8];
    let mut idx = 9;
    while idx < 8192 {
        if data[idx] != first {
            break;
        }
        idx += 1;
    }
    if idx >= 8192 && data[8192] != first {
        Some(0x2000)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart_rom_blob() -> Vec<u8> {
        let mut data = vec![0u8; 2 * 1024 * 1024];
        BigEndian::write_u32(&mut data[0x404..0x408], 0x802000);
        data
    }

    #[test]
    fn cart_rom_detected() {
        let data = cart_rom_blob();
        let d = detect(&data, "game.bin", false, None).unwrap();
        assert_eq!(d.format, Format::CartRom);
        assert_eq!(d.base, 0x802000);
        assert_eq!(d.skip, 0x2000);
    }

    #[test]
    fn override_base_suppresses_detected_base() {
        let data = cart_rom_blob();
        let d = detect(&data, "game.bin", true, None).unwrap();
        assert_eq!(d.base, 0x4000);
        assert_eq!(d.skip, 0x2000);
    }

    #[test]
    fn user_header_skip_overrides_detected_skip() {
        let data = cart_rom_blob();
        let d = detect(&data, "game.bin", false, Some(0x1234)).unwrap();
        assert_eq!(d.skip, 0x1234);
    }

    #[test]
    fn coff_wins_over_alcyon_for_shared_prefix() {
        // Both COFF and Alcyon ABS share the 0x01 0x50 prefix; COFF's
        // shorter length gate (>72 bytes) means it matches first for any
        // file long enough to also look like an Alcyon ABS (preserved
        // ordering, see DESIGN.md).
        let mut data = vec![0u8; 200];
        data[0] = 0x01;
        data[1] = 0x50;
        let d = detect(&data, "thing.abs", false, None).unwrap();
        assert_eq!(d.format, Format::Coff);
    }

    #[test]
    fn rom_extension_fallback_when_nothing_matches() {
        let data = vec![0u8; 100];
        let d = detect(&data, "game.ROM", false, None).unwrap();
        assert_eq!(d.format, Format::RomExtension);
        assert!(!d.matched);
        assert_eq!(d.base, 0x802000);
    }

    #[test]
    fn completely_unrecognized_file_is_unmatched() {
        let data = vec![0u8; 100];
        let d = detect(&data, "game.bin", false, None).unwrap();
        assert_eq!(d.format, Format::Unknown);
        assert!(!d.matched);
    }
}
