// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level operations: flash, dump, reset, serial-info, serial-banner,
//! BIOS upgrade, and plain upload. Each is a thin orchestration over
//! [`Transport`], [`crate::stubs`], and [`crate::detect`].

use std::io::Write;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::clock::Clock;
use crate::console;
use crate::control::ControlTransfer;
use crate::detect;
use crate::device::DeviceFactory;
use crate::error::{CartctlError, Result};
use crate::rpc::SkunkRpcProtocol;
use crate::stubs::{self, BoardRevision, DumperStub, FlasherStub};
use crate::tool::Tool;
use crate::window::Window;

/// Erase-block count bounded to `[1, 62]`, `32` for `len <= 2 MiB` else
/// `62`, forced to `62` under "erase all".
fn erase_block_count(len: usize, erase_all: bool) -> u32 {
    let mut blocks: u32 = if len <= 2 * 1024 * 1024 { 32 } else { 62 };
    if erase_all {
        blocks = 62;
    }
    blocks.clamp(1, 62)
}

/// Packs the flash parameter word: low 24 bits block count, bit 30 bank 2,
/// bit 31 slow/word flash.
fn flash_param_word(blocks: u32, bank2: bool, slow: bool) -> u32 {
    let mut v = blocks & 0x00FF_FFFF;
    if bank2 {
        v |= 0x4000_0000;
    }
    if slow {
        v |= 0x8000_0000;
    }
    v
}

/// Entry address modifier for bank 2 / 6 MiB mode, applied when booting
/// into a flash or boot-only operation.
pub fn entry_address_modifier(bank2: bool, six_meg: bool) -> u32 {
    let mut v = 0u32;
    if bank2 {
        v |= 0x1000_0000;
    }
    if six_meg {
        v |= 0x7000_0000;
    }
    v
}

#[derive(Clone, Copy)]
pub struct OpOptions {
    pub bank2: bool,
    pub six_meg: bool,
    pub slow_flash: bool,
    pub erase_all: bool,
    pub flash_active: bool,
}

/// Prepares the flasher stub with the computed parameter word, uploads it,
/// and waits for the erase cycle (both buffers zero, then both free).
pub fn flash<D, C>(
    transport: &mut crate::transport::Transport<'_, D, C>,
    flasher: &FlasherStub,
    data_len: usize,
    opts: &OpOptions,
) -> Result<()>
where
    D: ControlTransfer,
    C: Clock,
{
    let blocks = erase_block_count(data_len, opts.erase_all);
    let param = flash_param_word(blocks, opts.bank2, opts.slow_flash);
    let stub = flasher.patched(param)?;

    transport.send_payload(&stub, stubs::FLASHER_ENTRY, stubs::FLASHER_ENTRY as i32, false, false, opts.bank2, false)?;

    transport.wait_for_both_buffers_zero()?;
    transport.wait_for_both_buffers_free()?;

    Ok(())
}

/// Fixed dump-file preamble: a universal header padded with `0xFF` to
/// `0x400`, then a standard-values block padded with `0xFF` to `0x2000`.
/// Real header/values content is an opaque blob out of this crate's scope.
fn write_dump_preamble(out: &mut impl Write, universal_header: &[u8], standard_values: &[u8]) -> std::io::Result<()> {
    out.write_all(universal_header)?;
    pad_with(out, universal_header.len(), 0x400)?;
    out.write_all(standard_values)?;
    pad_with(out, universal_header.len().max(0x400) + standard_values.len(), 0x2000)?;
    Ok(())
}

fn pad_with(out: &mut impl Write, already: usize, target: usize) -> std::io::Result<()> {
    if already < target {
        let fill = vec![0xFFu8; target - already];
        out.write_all(&fill)?;
    }
    Ok(())
}

/// Writes the dump preamble to `path`, then uploads the dumper stub
/// (patched for bank 2 if requested) and hands off to the console loop to
/// receive the streamed flash contents.
pub fn dump<D, C>(
    transport: &mut crate::transport::Transport<'_, D, C>,
    path: &std::path::Path,
    universal_header: &[u8],
    standard_values: &[u8],
    dumper: &DumperStub,
    bank2: bool,
) -> Result<()>
where
    D: ControlTransfer,
    C: Clock,
{
    let mut file = std::fs::File::create(path).map_err(|e| CartctlError::io(path, e))?;
    write_dump_preamble(&mut file, universal_header, standard_values).map_err(|e| CartctlError::io(path, e))?;
    drop(file);

    let stub = dumper.patched(bank2);
    transport.send_payload(&stub, stubs::DUMPER_ENTRY, stubs::DUMPER_ENTRY as i32, false, false, bank2, false)?;

    let mut protocol = SkunkRpcProtocol::new();
    console::run(transport, &mut protocol, || true)
}

pub fn reset<D, C>(transport: &mut crate::transport::Transport<'_, D, C>) -> Result<()>
where
    D: ControlTransfer,
    C: Clock,
{
    transport.reset()
}

/// Parsed result of the compact serial-info query.
pub struct SerialInfo {
    pub bios_version: (u8, u8, u8),
    pub serial: u16,
}

/// Polls `W1`'s length field for the `0xFxFF` pattern (accepting `0xFFFF`)
/// within 2 seconds, then reads 12 bytes and checks the magic prefix.
pub fn serial_info<D, C>(transport: &mut crate::transport::Transport<'_, D, C>, clock: &C) -> Result<Option<SerialInfo>>
where
    D: ControlTransfer,
    C: Clock,
{
    let deadline = Duration::from_secs(2);
    let mut waited = Duration::ZERO;
    loop {
        let raw = transport.device_mut().ctrl_read(Window::W1.length_field_addr(), 2)?;
        let poll = u16::from_le_bytes([raw[0], raw[1]]);
        if (poll & 0xF0FF) == 0xF0FF {
            if poll == 0xFFFF {
                let info = transport.device_mut().ctrl_read(Window::W1.offset(), 12)?;
                if info.len() >= 10 && info[0..4] == stubs::SERIAL_INFO_MAGIC {
                    return Ok(Some(SerialInfo {
                        bios_version: (info[6], info[5], info[4]),
                        serial: BigEndian::read_u16(&[info[9], info[8]]),
                    }));
                }
            }
            return Ok(None);
        }
        if waited >= deadline {
            return Err(CartctlError::HandshakeTimeout);
        }
        clock.sleep(Duration::from_millis(100));
        waited += Duration::from_millis(100);
    }
}

/// ASCII-art digit rows for [`serial_banner`]: each cell is one of 16
/// 6-character glyph rows; index `15` is blank, and the digit table maps
/// `0..=9`, `-1` (space) and `-2` (period) to a 7-row glyph.
const GLYPH_ROWS: [&str; 16] = [
    " XXX  ", "X   X ", "  X   ", "XXX   ", "XXXXX ", "    X ", "  XX  ", " X    ", "X     ",
    "  XX  ", "X  X  ", "   X  ", " XXX  ", "XXXX  ", " XXXX ", "      ",
];

const DIGIT_GLYPHS: [[usize; 7]; 12] = [
    [0, 1, 1, 1, 1, 1, 0],
    [2, 3, 2, 2, 2, 2, 4],
    [12, 1, 5, 6, 7, 8, 4],
    [0, 1, 5, 9, 5, 1, 0],
    [8, 10, 10, 4, 11, 11, 11],
    [4, 8, 8, 0, 5, 1, 0],
    [0, 8, 8, 13, 1, 1, 0],
    [4, 5, 5, 11, 2, 2, 2],
    [0, 1, 1, 0, 1, 1, 0],
    [0, 1, 1, 14, 5, 5, 0],
    [15, 15, 15, 15, 15, 15, 15], // space (index -1 in the source)
    [15, 15, 15, 15, 15, 15, 6],  // period (index -2 in the source)
];

fn glyph_row(value: i32, row: usize) -> &'static str {
    let idx = if value >= 0 { value as usize } else { (10 + (-value - 1)) as usize };
    GLYPH_ROWS[DIGIT_GLYPHS[idx][row]]
}

/// Renders the serial/BIOS version as a 7-row ASCII banner, same glyph
/// source as the compact query.
pub fn serial_banner_text(info: &SerialInfo) -> Vec<String> {
    let (major, minor, rev) = info.bios_version;
    let digits: Vec<i32> = vec![
        (major % 16) as i32,
        -2,
        (minor / 16) as i32,
        (minor % 16) as i32,
        -2,
        (rev / 16) as i32,
        (rev % 16) as i32,
        -1,
        ((info.serial >> 12) & 0xF) as i32,
        ((info.serial >> 8) & 0xF) as i32,
        ((info.serial >> 4) & 0xF) as i32,
        (info.serial & 0xF) as i32,
    ];
    (0..7)
        .map(|row| digits.iter().map(|&d| glyph_row(d, row)).collect::<String>())
        .collect()
}

/// Discovers current board revision by uploading the version-reader stub,
/// sleeping 500 ms (no handshake wait), then reading 12 bytes from `W1`.
/// Returns the revision bucket alongside the exact BCD `(major, minor, rev)`
/// triple, so callers can compare against [`BoardRevision::target_version`].
pub fn discover_board_revision<D, C>(
    transport: &mut crate::transport::Transport<'_, D, C>,
    clock: &C,
) -> Result<Option<(BoardRevision, (u8, u8, u8))>>
where
    D: ControlTransfer,
    C: Clock,
{
    let stub = stubs::version_reader_stub(256);
    transport.send_payload(&stub, stubs::STUB_ENTRY, stubs::STUB_ENTRY as i32, false, false, false, true)?;
    clock.sleep(Duration::from_millis(500));

    let info = transport.device_mut().ctrl_read(Window::W1.offset(), 12)?;
    if info.len() < 10 || info[0..4] != stubs::SERIAL_INFO_MAGIC {
        return Ok(None);
    }
    let version = (info[6], info[5], info[4]);
    Ok(BoardRevision::from_major(info[6]).map(|rev| (rev, version)))
}

/// Upgrades the BIOS. `assume_rev1` (`-!`) skips discovery entirely and
/// treats the board as revision 1, for boards too old to answer the
/// version-reader stub reliably. Otherwise the current revision and exact
/// BCD version are discovered first; unless `skip_current_check` (`-f -U`
/// together) is set, a board already on the target version is left alone.
/// Either way, once an upgrade is due, the device is reset and reconnected
/// and the matching BIOS image is uploaded.
pub fn bios_upgrade<F, C>(
    tool: &mut Tool<'_, F, C>,
    assume_rev1: bool,
    skip_current_check: bool,
    bios_rev1: &[u8],
    bios_rev2or3: &[u8],
) -> Result<String>
where
    F: DeviceFactory,
    C: Clock,
{
    let clock = tool.clock();
    let (revision, current_version) = if assume_rev1 {
        (BoardRevision::Rev1, None)
    } else {
        match tool.with_reattach(|t| discover_board_revision(t, clock))? {
            Some((rev, version)) => (rev, Some(version)),
            None => {
                return Err(CartctlError::Detection(
                    "could not determine board revision".into(),
                ))
            }
        }
    };

    if let Some(message) = already_current_message(skip_current_check, revision, current_version) {
        return Ok(message);
    }

    tool.reset_and_reconnect(true)?;

    let image = match revision {
        BoardRevision::Rev1 => bios_rev1.to_vec(),
        BoardRevision::Rev2Or3 => bios_rev2or3.to_vec(),
    };

    tool.with_reattach(|t| t.send_payload(&image, stubs::BIOS_ENTRY, stubs::BIOS_ENTRY as i32, false, false, false, false))?;

    Ok(format!("BIOS upgrade complete ({:?})", revision))
}

/// `Some(message)` if the upgrade should stop here: unless `skip_current_check`
/// (`-f -U` together), a board already on its revision's target BCD version
/// is left alone. Discovery-skipped callers (`assume_rev1`) never have a
/// `current_version` to compare, so they always fall through to the upload.
fn already_current_message(
    skip_current_check: bool,
    revision: BoardRevision,
    current_version: Option<(u8, u8, u8)>,
) -> Option<String> {
    if skip_current_check {
        return None;
    }
    let version = current_version?;
    if version != revision.target_version() {
        return None;
    }
    let (maj, min, rev) = version;
    Some(format!(
        "Board is already on revision {maj:x}.{min:02x}.{rev:02x} - upgrade not required (-fU to force)."
    ))
}

/// Plain upload: detect the file format, optionally arm flash mode, then
/// stream the payload, optionally entering the console loop afterward.
pub fn upload<D, C>(
    transport: &mut crate::transport::Transport<'_, D, C>,
    data: &[u8],
    detection: &detect::Detection,
    no_boot: bool,
    enter_console: bool,
    opts: &OpOptions,
) -> Result<()>
where
    D: ControlTransfer,
    C: Clock,
{
    let payload = &data[detection.skip as usize..];
    let modifier = entry_address_modifier(opts.bank2, opts.six_meg);
    let entry = (detection.base | modifier) as i32;

    if opts.six_meg {
        let half = payload.len() / 2;
        transport.send_payload(&payload[..half], detection.base, entry, true, opts.flash_active, opts.bank2, false)?;
        transport.send_payload(
            &payload[half..],
            0x800000,
            entry,
            true,
            opts.flash_active,
            opts.bank2,
            false,
        )?;
        // The boot-only trigger carries no payload of its own; route it through
        // the always-accepted dummy address so the protected-region guard (which
        // would otherwise refuse a >=0x800000 destination outside flash mode)
        // doesn't swallow it, same as `send_payload`'s no-boot terminator.
        transport.write_block(
            &[],
            crate::transport::DUMMY_DEST_ADDR,
            entry,
            opts.flash_active,
            opts.bank2,
            false,
        )?;
    } else {
        transport.send_payload(payload, detection.base, entry, no_boot, opts.flash_active, opts.bank2, false)?;
    }

    if enter_console {
        let mut protocol = SkunkRpcProtocol::new();
        console::run(transport, &mut protocol, || true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::control::fake::FakeBus;
    use crate::detect::Format;
    use crate::device::{DeviceFactory, Locator};
    use crate::transport::Transport;
    use byteorder::LittleEndian;

    fn free_bus() -> FakeBus {
        let bus = FakeBus::new();
        let mut free = [0u8; 2];
        LittleEndian::write_u16(&mut free, 0xFFFF);
        bus.set(Window::W0.length_field_addr(), &free);
        bus.set(Window::W1.length_field_addr(), &free);
        bus
    }

    /// Hands out a pre-built [`FakeBus`] on the first open (carrying whatever
    /// discovery state the test wants to see), then a fresh idle bus on
    /// every later open -- enough to carry a [`Tool`] through a reset and
    /// reconnect in a test without real USB.
    struct OnceFactory {
        first: Option<FakeBus>,
    }

    impl DeviceFactory for OnceFactory {
        type Transfer = FakeBus;

        fn try_open(&mut self, _bus: Option<u8>, _port: Option<u8>) -> Option<FakeBus> {
            Some(self.first.take().unwrap_or_else(free_bus))
        }
    }

    fn version_reply_bus(major: u8, minor: u8, rev: u8) -> FakeBus {
        let bus = free_bus();
        let mut info = [0u8; 12];
        info[0..4].copy_from_slice(&stubs::SERIAL_INFO_MAGIC);
        info[6] = major;
        info[5] = minor;
        info[4] = rev;
        bus.set(Window::W1.offset(), &info);
        bus
    }

    #[test]
    fn bios_upgrade_reports_already_current_without_uploading() {
        let clock = FakeClock::new();
        let factory = OnceFactory {
            first: Some(version_reply_bus(1, 2, 4)),
        };
        let locator = Locator::new(factory, &clock);
        let mut tool = Tool::open(locator, &clock, Duration::from_millis(1000), None, None).unwrap();

        let message = bios_upgrade(&mut tool, false, false, &[0xAA], &[0xBB]).unwrap();
        assert!(message.contains("already on revision"));
    }

    #[test]
    fn skip_current_check_forces_upload_even_if_current() {
        assert_eq!(already_current_message(true, BoardRevision::Rev1, Some((1, 2, 4))), None);
    }

    #[test]
    fn assume_rev1_has_no_version_to_compare_so_always_uploads() {
        assert_eq!(already_current_message(false, BoardRevision::Rev1, None), None);
    }

    #[test]
    fn current_version_mismatch_still_uploads() {
        assert_eq!(
            already_current_message(false, BoardRevision::Rev2Or3, Some((3, 0, 1))),
            None
        );
    }

    /// Exercises the two no-boot halves of a 6 MiB upload end to end, and
    /// confirms the final boot-only trigger lands on the always-accepted
    /// dummy address rather than a `>=0x800000` destination the
    /// protected-region guard would otherwise silently refuse outside flash
    /// mode (see the comment at its call site in `upload`). The trigger
    /// itself is driven directly with `skip_wait` set, since a bare
    /// in-memory bus has no receiver to ever answer the real boot
    /// handshake that `upload` waits for in production.
    #[test]
    fn six_meg_upload_completes_without_flash_active() {
        let clock = FakeClock::new();
        let bus = free_bus();
        let mut transport = Transport::new(bus, &clock, Duration::from_millis(1000));

        let detection = detect::Detection {
            format: Format::Unknown,
            base: 0x802000,
            skip: 0,
            flen: 8,
            matched: true,
            image: None,
        };
        let opts = OpOptions {
            bank2: false,
            six_meg: true,
            slow_flash: false,
            erase_all: false,
            flash_active: false,
        };
        let data = vec![0xAAu8; 8];

        let payload = &data[..];
        let half = payload.len() / 2;
        let entry = (detection.base | entry_address_modifier(opts.bank2, opts.six_meg)) as i32;
        transport
            .send_payload(&payload[..half], detection.base, entry, true, opts.flash_active, opts.bank2, false)
            .unwrap();
        transport
            .send_payload(&payload[half..], 0x800000, entry, true, opts.flash_active, opts.bank2, false)
            .unwrap();

        let before = transport.next_window();
        transport
            .write_block(&[], crate::transport::DUMMY_DEST_ADDR, entry, opts.flash_active, opts.bank2, true)
            .unwrap();
        assert_ne!(transport.next_window(), before);
    }

    #[test]
    fn erase_blocks_small_file() {
        assert_eq!(erase_block_count(1024, false), 32);
    }

    #[test]
    fn erase_blocks_large_file() {
        assert_eq!(erase_block_count(3 * 1024 * 1024, false), 62);
    }

    #[test]
    fn erase_all_forces_62() {
        assert_eq!(erase_block_count(100, true), 62);
    }

    #[test]
    fn flash_param_packs_bits() {
        let v = flash_param_word(32, true, true);
        assert_eq!(v & 0x00FF_FFFF, 32);
        assert_eq!(v & 0x4000_0000, 0x4000_0000);
        assert_eq!(v & 0x8000_0000, 0x8000_0000);
    }

    #[test]
    fn entry_modifier_combines_flags() {
        assert_eq!(entry_address_modifier(false, false), 0);
        assert_eq!(entry_address_modifier(true, false), 0x1000_0000);
        assert_eq!(entry_address_modifier(false, true), 0x7000_0000);
    }

    #[test]
    fn banner_text_has_seven_rows() {
        let info = SerialInfo {
            bios_version: (0x01, 0x02, 0x04),
            serial: 0x1234,
        };
        let rows = serial_banner_text(&info);
        assert_eq!(rows.len(), 7);
        for row in &rows {
            assert_eq!(row.chars().count(), 6 * 12);
        }
    }

    #[test]
    fn dump_preamble_pads_to_boundaries() {
        let mut buf = Vec::new();
        write_dump_preamble(&mut buf, b"HDR", b"STD").unwrap();
        assert_eq!(buf.len(), 0x2000);
        assert_eq!(&buf[..3], b"HDR");
        assert_eq!(buf[0x400..0x403], *b"STD");
    }
}
