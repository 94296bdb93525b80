// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Maps a big-endian 68k ELF executable's sections into a flat memory
//! image, the way a cartridge loader would lay them out in RAM.

use goblin::elf::section_header::SHT_PROGBITS;
use goblin::elf::{header, Elf};

use crate::error::{CartctlError, Result};

/// Upper bound on the produced image; section addresses/lengths beyond
/// this are a detection error rather than a silent truncation or an
/// out-of-bounds write.
pub const MAX_IMAGE_LEN: usize = 2 * 1024 * 1024;

pub struct ElfImage {
    pub image: Vec<u8>,
    pub entry: u32,
    pub len: u32,
}

/// Loads `data` as a big-endian 68k ELF, failing for any other class,
/// endianness, or machine. Sections with address `0` are treated as debug
/// info and skipped; only `SHT_PROGBITS` sections are copied.
pub fn load(data: &[u8]) -> Result<ElfImage> {
    let elf = Elf::parse(data)
        .map_err(|e| CartctlError::Detection(format!("malformed ELF: {e}")))?;

    if elf.is_64 || elf.little_endian {
        return Err(CartctlError::Detection("not a 68K executable".into()));
    }
    if elf.header.e_type != header::ET_EXEC as u16 || elf.header.e_machine != header::EM_68K {
        return Err(CartctlError::Detection("not a 68K executable".into()));
    }

    let entry = elf.entry as u32;
    let mut image = vec![0u8; MAX_IMAGE_LEN];
    let mut flen: u32 = 0;

    for section in &elf.section_headers {
        let addr = section.sh_addr as u32;
        if addr == 0 {
            continue;
        }
        if addr < entry {
            return Err(CartctlError::Detection(
                "section has base address below entry point".into(),
            ));
        }

        let slen = section.sh_size as u32;
        let end = addr.saturating_add(slen);
        if end > flen {
            flen = end;
        }
        if flen as usize >= MAX_IMAGE_LEN {
            return Err(CartctlError::Detection(
                "section falls outside available memory".into(),
            ));
        }

        if section.sh_type == SHT_PROGBITS {
            let file_off = section.sh_offset as usize;
            let file_end = file_off
                .checked_add(slen as usize)
                .ok_or_else(|| CartctlError::Detection("section file offset overflow".into()))?;
            if file_end > data.len() {
                return Err(CartctlError::Detection(
                    "section file range exceeds input buffer".into(),
                ));
            }
            let img_end = (addr as usize) + (slen as usize);
            if img_end > image.len() {
                return Err(CartctlError::Detection(
                    "section address range exceeds image buffer".into(),
                ));
            }
            image[addr as usize..img_end].copy_from_slice(&data[file_off..file_end]);
        }
    }

    Ok(ElfImage {
        image,
        entry,
        len: flen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::{Pwrite, BE};

    /// Hand-builds a minimal big-endian 68k ELF with two disjoint progbits
    /// sections, since goblin has no writer API.
    fn build_synthetic_elf(entry: u32, sections: &[(u32, &[u8])]) -> Vec<u8> {
        let ehdr_size = 52usize;
        let shdr_size = 40usize;
        let mut shstrtab = vec![0u8]; // empty name at index 0

        let mut section_data_offset = ehdr_size;
        let mut section_file_offsets = Vec::new();
        for (_, bytes) in sections {
            section_file_offsets.push(section_data_offset);
            section_data_offset += bytes.len();
        }
        let shoff = section_data_offset;
        let shnum = sections.len() + 1; // +1 for the null section

        let mut buf = vec![0u8; shoff + shnum * shdr_size];

        // e_ident
        buf[0] = 0x7F;
        buf[1] = b'E';
        buf[2] = b'L';
        buf[3] = b'F';
        buf[4] = 1; // ELFCLASS32
        buf[5] = 2; // ELFDATA2MSB (big endian)
        buf[6] = 1; // EV_CURRENT

        buf.pwrite_with::<u16>(header::ET_EXEC as u16, 0x10, BE).unwrap();
        buf.pwrite_with::<u16>(header::EM_68K, 0x12, BE).unwrap();
        buf.pwrite_with::<u32>(1, 0x14, BE).unwrap(); // e_version
        buf.pwrite_with::<u32>(entry, 0x18, BE).unwrap(); // e_entry
        buf.pwrite_with::<u32>(0, 0x1C, BE).unwrap(); // e_phoff
        buf.pwrite_with::<u32>(shoff as u32, 0x20, BE).unwrap(); // e_shoff
        buf.pwrite_with::<u16>(ehdr_size as u16, 0x28, BE).unwrap(); // e_ehsize
        buf.pwrite_with::<u16>(0, 0x2A, BE).unwrap(); // e_phentsize
        buf.pwrite_with::<u16>(0, 0x2C, BE).unwrap(); // e_phnum
        buf.pwrite_with::<u16>(shdr_size as u16, 0x2E, BE).unwrap(); // e_shentsize
        buf.pwrite_with::<u16>(shnum as u16, 0x30, BE).unwrap(); // e_shnum
        buf.pwrite_with::<u16>(0, 0x32, BE).unwrap(); // e_shstrndx

        for (i, bytes) in sections.iter().map(|(_, b)| b).enumerate() {
            buf[section_file_offsets[i]..section_file_offsets[i] + bytes.len()]
                .copy_from_slice(bytes);
        }

        // section header 0 is left zeroed (the null section).
        for (i, (addr, bytes)) in sections.iter().enumerate() {
            let base = shoff + (i + 1) * shdr_size;
            buf.pwrite_with::<u32>(0, base, BE).unwrap(); // sh_name
            buf.pwrite_with::<u32>(SHT_PROGBITS, base + 4, BE).unwrap(); // sh_type
            buf.pwrite_with::<u32>(0, base + 8, BE).unwrap(); // sh_flags
            buf.pwrite_with::<u32>(*addr, base + 12, BE).unwrap(); // sh_addr
            buf.pwrite_with::<u32>(section_file_offsets[i] as u32, base + 16, BE)
                .unwrap(); // sh_offset
            buf.pwrite_with::<u32>(bytes.len() as u32, base + 20, BE).unwrap(); // sh_size
        }
        let _ = shstrtab;

        buf
    }

    #[test]
    fn loads_two_disjoint_sections() {
        let data = build_synthetic_elf(0x1000, &[(0x1000, b"AAAA"), (0x2000, b"BBBB")]);
        let loaded = load(&data).unwrap();
        assert_eq!(&loaded.image[0x1000..0x1004], b"AAAA");
        assert_eq!(&loaded.image[0x2000..0x2004], b"BBBB");
        assert_eq!(loaded.image[0x1500], 0);
        assert_eq!(loaded.entry, 0x1000);
    }
}
