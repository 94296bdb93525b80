// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flag surface and the main action-selector precedence, grounded on the
//! original flag-driven CLI rather than a subcommand tree.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{CartctlError, Result};

/// `cartctl`: upload, flash, dump, and talk to a Skunkboard-class cartridge
/// receiver over its USB control-transfer ping-pong protocol.
#[derive(Debug, Parser)]
#[clap(max_term_width = 100, about = "Skunkboard cartridge control tool")]
pub struct Cli {
    /// Target bank 2 instead of bank 1.
    #[clap(short = '2')]
    pub bank2: bool,

    /// Operate in 6 MiB mode (two-pass bank 0 + bank 1 upload).
    #[clap(short = '6')]
    pub six_meg: bool,

    /// Only boot: send a boot request without uploading a file.
    #[clap(short = 'b')]
    pub boot_only: bool,

    /// Enter the console loop after the action completes.
    #[clap(short = 'c')]
    pub console: bool,

    /// Dump flash contents to a file.
    #[clap(short = 'd')]
    pub dump: bool,

    /// Erase the entire flash (forces a 62-block erase regardless of size).
    #[clap(short = 'e')]
    pub erase_all: bool,

    /// Flash the uploaded file rather than loading it into RAM.
    #[clap(short = 'f')]
    pub flash: bool,

    /// Upload without sending a boot request.
    #[clap(short = 'n')]
    pub no_boot: bool,

    /// Override the base address the detector would otherwise choose.
    #[clap(short = 'o')]
    pub override_base: bool,

    /// Suppress informational output.
    #[clap(short = 'q')]
    pub quiet: bool,

    /// Reset the receiver.
    #[clap(short = 'r')]
    pub reset: bool,

    /// Print compact serial/version info.
    #[clap(short = 's')]
    pub serial_info: bool,

    /// Upgrade the onboard BIOS.
    #[clap(short = 'U')]
    pub bios_upgrade: bool,

    /// Use slow/word flash mode.
    #[clap(short = 'w')]
    pub slow_flash: bool,

    /// Verbose logging.
    #[clap(short = 'v')]
    pub verbose: bool,

    /// Override flash-active checks (undocumented escape hatch).
    #[clap(short = '!')]
    pub override_flash: bool,

    /// Print the serial/version banner (ASCII-art form of `-s`).
    #[clap(short = '*')]
    pub serial_banner: bool,

    /// Header skip override, in bytes.
    #[clap(short = 'h', value_name = "N")]
    pub header_skip: Option<u32>,

    /// Select the device by its BCD serial number.
    #[clap(long = "serial", value_name = "DDDD")]
    pub select_serial: Option<u16>,

    /// USB control-transfer timeout, in milliseconds.
    #[clap(short = 't', value_name = "N")]
    pub timeout_ms: Option<u64>,

    /// Select the device by USB bus number.
    #[clap(long = "ubus", value_name = "N")]
    pub usb_bus: Option<u8>,

    /// Select the device by USB port number.
    #[clap(long = "uport", value_name = "N")]
    pub usb_port: Option<u8>,

    /// External console executable to exec instead of the built-in loop.
    #[clap(short = 'x', value_name = "PATH")]
    pub external_console: Option<PathBuf>,

    /// `$HEX`/`0xHEX` base address, or a filename; order-independent.
    pub positional: Vec<String>,
}

impl Cli {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(1000))
    }

    /// Splits `positional` into an optional explicit base address and the
    /// (at most one) filename, per the source's "looks like hex -> base,
    /// otherwise -> filename" convention.
    pub fn parse_positional(&self) -> Result<(Option<u32>, Option<&str>)> {
        let mut base = None;
        let mut file = None;
        for tok in &self.positional {
            if let Some(value) = parse_hex_literal(tok) {
                if base.is_some() {
                    return Err(CartctlError::Usage(format!(
                        "multiple base addresses given: {}",
                        tok
                    )));
                }
                base = Some(value);
            } else if file.is_some() {
                return Err(CartctlError::Usage(format!(
                    "multiple filenames given: {}",
                    tok
                )));
            } else {
                file = Some(tok.as_str());
            }
        }
        Ok((base, file))
    }

    /// `-f -U` together repair a damaged BIOS by forcing the upgrade even
    /// if the board reports it is already current.
    pub fn bios_force(&self) -> bool {
        self.bios_upgrade && self.flash
    }
}

/// Parses a bare hex literal (`1234` or `0x1234`) as a base address; returns
/// `None` for anything containing a non-hex-digit, which is treated as a
/// filename instead.
fn parse_hex_literal(tok: &str) -> Option<u32> {
    let digits = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")).unwrap_or(tok);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// The mutually exclusive top-level action, chosen by the precedence order
/// in [`Cli::action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SerialInfo,
    SerialBanner,
    Reset,
    BootOnly,
    Dump,
    Flash,
    Upload,
}

impl Cli {
    /// Resolves the ties top-down: serial-info, serial-banner, reset,
    /// boot-only, dump, flash+upload, upload.
    pub fn action(&self) -> Action {
        if self.serial_info {
            Action::SerialInfo
        } else if self.serial_banner {
            Action::SerialBanner
        } else if self.reset {
            Action::Reset
        } else if self.boot_only {
            Action::BootOnly
        } else if self.dump {
            Action::Dump
        } else if self.flash {
            Action::Flash
        } else {
            Action::Upload
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["cartctl"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn action_precedence_prefers_serial_info_over_everything() {
        let cli = parse(&["-s", "-r", "-d", "-f"]);
        assert_eq!(cli.action(), Action::SerialInfo);
    }

    #[test]
    fn action_precedence_flash_before_upload() {
        let cli = parse(&["-f", "game.bin"]);
        assert_eq!(cli.action(), Action::Flash);
    }

    #[test]
    fn plain_file_defaults_to_upload() {
        let cli = parse(&["game.bin"]);
        assert_eq!(cli.action(), Action::Upload);
    }

    #[test]
    fn positional_splits_hex_base_and_filename() {
        let cli = parse(&["0x4000", "game.bin"]);
        let (base, file) = cli.parse_positional().unwrap();
        assert_eq!(base, Some(0x4000));
        assert_eq!(file, Some("game.bin"));
    }

    #[test]
    fn positional_rejects_two_filenames() {
        let cli = parse(&["game.bin", "other.bin"]);
        assert!(cli.parse_positional().is_err());
    }

    #[test]
    fn bios_force_requires_both_flags() {
        let cli = parse(&["-U", "-f"]);
        assert!(cli.bios_force());
        let cli = parse(&["-U"]);
        assert!(!cli.bios_force());
    }
}
