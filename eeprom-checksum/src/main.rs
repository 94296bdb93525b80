//! Validates the checksum trailer of a Skunkboard-style EEPROM image.
//!
//! Files are a flat sequence of big-endian 16-bit words. The final word is a
//! checksum over every word that precedes it: `checksum == !sum(words[..-1])`.
//! Valid files are exactly 64 or 1024 words (128 or 2048 bytes) long.

use std::env;
use std::fs::File;
use std::io::{self, Read};
use std::process::ExitCode;

use byteorder::{BigEndian, ByteOrder};

const MAX_WORDS: usize = 1025;

fn main() -> ExitCode {
    let mut args = env::args_os();
    let _argv0 = args.next();
    let path = match args.next() {
        Some(p) => p,
        None => {
            println!("usage: eeprom-checksum <file.e2p>");
            return ExitCode::from(255);
        }
    };

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => {
            println!("usage: eeprom-checksum <file.e2p>");
            return ExitCode::from(255);
        }
    };

    match check(file) {
        Ok(checksum) => {
            println!("SUCCESS: Checksums match: 0x{:04x}", checksum);
            ExitCode::SUCCESS
        }
        Err(CheckError::Read) => {
            eprintln!("ERROR: Failed to read EEPROM file");
            ExitCode::from(1)
        }
        Err(CheckError::Size(words)) => {
            eprintln!(
                "ERROR: Invalid EEPROM file size: {}{}",
                words * 2,
                if words == MAX_WORDS { "+" } else { "" }
            );
            ExitCode::from(2)
        }
        Err(CheckError::Mismatch { calculated, stored }) => {
            eprintln!("ERROR: Checksum mismatch");
            eprintln!(
                "  Calculated: 0x{:04x} File: 0x{:04x}",
                calculated, stored
            );
            ExitCode::from(3)
        }
    }
}

enum CheckError {
    Read,
    Size(usize),
    Mismatch { calculated: u16, stored: u16 },
}

/// Returns the checksum on success, matching the final word of the file.
fn check(mut file: impl Read) -> Result<u16, CheckError> {
    let mut checksum: u16 = 0;
    let mut prev: u16 = 0;
    let mut word_count = 0usize;
    let mut buf = [0u8; 2];

    while word_count < MAX_WORDS {
        match read_exact_or_eof(&mut file, &mut buf) {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => return Err(CheckError::Read),
        }

        checksum = checksum.wrapping_add(prev);
        prev = BigEndian::read_u16(&buf);
        word_count += 1;
    }

    match word_count {
        64 | 1024 => {}
        other => return Err(CheckError::Size(other)),
    }

    let calculated = checksum ^ 0xFFFF;
    if prev != calculated {
        return Err(CheckError::Mismatch {
            calculated,
            stored: prev,
        });
    }

    Ok(calculated)
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` on a clean EOF
/// (zero bytes read) and an error on a truncated read.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated word",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_be(v: u16) -> [u8; 2] {
        v.to_be_bytes()
    }

    fn build(words: &[u16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(words.len() * 2);
        for w in words {
            out.extend_from_slice(&word_be(*w));
        }
        out
    }

    #[test]
    fn accepts_valid_64_word_file() {
        let mut words = vec![0u16; 63];
        words[0] = 0x1234;
        words[10] = 0x0001;
        let sum: u16 = words.iter().fold(0u16, |acc, w| acc.wrapping_add(*w));
        let checksum = sum ^ 0xFFFF;
        words.push(checksum);
        let data = build(&words);
        assert_eq!(check(&data[..]).unwrap(), checksum);
    }

    #[test]
    fn rejects_bad_size() {
        let data = build(&[0u16; 10]);
        match check(&data[..]) {
            Err(CheckError::Size(10)) => {}
            _ => panic!("expected size error"),
        }
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut words = vec![0u16; 63];
        words.push(0xBEEF);
        let data = build(&words);
        match check(&data[..]) {
            Err(CheckError::Mismatch { .. }) => {}
            _ => panic!("expected mismatch error"),
        }
    }

    #[test]
    fn rejects_oversized_file() {
        let data = build(&[0u16; MAX_WORDS + 5]);
        match check(&data[..]) {
            Err(CheckError::Size(n)) => assert_eq!(n, MAX_WORDS),
            _ => panic!("expected size error"),
        }
    }
}
