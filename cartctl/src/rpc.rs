// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two console RPC dialects that ride on top of the escape-command
//! convention (payload bytes `[0..2] == FF FF`): the simple 7-command
//! dialect, and the richer 13-opcode dialect, unified behind one
//! [`ConsoleProtocol`] capability so the console loop doesn't care which
//! one is in play.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ByteOrder};

/// What the console loop should do after a dispatched escape command.
pub enum Dispatch {
    /// Nothing further to send; keep looping.
    Continue,
    /// Write `0` (simple dialect) back to the alternate window; the
    /// console loop exits its steady-state loop.
    Terminate,
    /// Send these bytes back to the alternate window as a reply block.
    Reply(Vec<u8>),
}

pub trait ConsoleProtocol {
    /// `cmd` is the 16-bit command at payload offset `2..4`; `content` is
    /// everything after the 4-byte escape header; `declared_len` is the
    /// block's own declared payload length (used by the simple dialect's
    /// "read bytes from file" command, which treats it as a read size).
    fn dispatch(&mut self, cmd: u16, content: &[u8], declared_len: u16) -> Dispatch;
}

/// Handles `0..64`; `0` and `1` are reserved stdin/stderr placeholders
/// populated at construction, `2..64` are user files, lowest-free
/// allocation order.
pub const MAXFILES: usize = 64;

enum Handle {
    Stdin,
    Stderr,
    File(File),
}

/// Fixed-size open-file table for the richer RPC dialect, mirroring
/// `jcp_handler.c`'s `files[MAXFILES]`.
pub struct FileDescTable {
    slots: Vec<Option<Handle>>,
}

impl FileDescTable {
    pub fn new() -> Self {
        let mut slots: Vec<Option<Handle>> = (0..MAXFILES).map(|_| None).collect();
        slots[0] = Some(Handle::Stdin);
        slots[1] = Some(Handle::Stderr);
        FileDescTable { slots }
    }

    /// Lowest free handle `>= 2`, or `None` if the table is full.
    fn alloc(&self) -> Option<usize> {
        (2..MAXFILES).find(|&fd| self.slots[fd].is_none())
    }

    fn file_mut(&mut self, fd: i32) -> Option<&mut File> {
        let fd = usize::try_from(fd).ok()?;
        match self.slots.get_mut(fd)? {
            Some(Handle::File(f)) => Some(f),
            _ => None,
        }
    }

    fn is_open(&self, fd: i32) -> bool {
        usize::try_from(fd)
            .ok()
            .and_then(|fd| self.slots.get(fd))
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn open(&mut self, filename: &str, mode: &str) -> Option<usize> {
        let fd = self.alloc()?;
        let opts = open_options_for_mode(mode);
        let file = opts.open(filename).ok()?;
        self.slots[fd] = Some(Handle::File(file));
        Some(fd)
    }

    /// Closes `fd`, returning `true` on success (including closing the
    /// stdin/stderr placeholders, as the original's bare `fclose` would).
    pub fn close(&mut self, fd: i32) -> bool {
        if !self.is_open(fd) {
            return false;
        }
        self.slots[fd as usize] = None;
        true
    }
}

impl Default for FileDescTable {
    fn default() -> Self {
        Self::new()
    }
}

fn open_options_for_mode(mode: &str) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match mode.trim_end_matches('b') {
        "r" => {
            opts.read(true);
        }
        "r+" => {
            opts.read(true).write(true);
        }
        "w+" => {
            opts.read(true).write(true).create(true).truncate(true);
        }
        "a" => {
            opts.append(true).create(true);
        }
        "a+" => {
            opts.read(true).append(true).create(true);
        }
        // "w" and anything unrecognized falls back to plain write/create/truncate.
        _ => {
            opts.write(true).create(true).truncate(true);
        }
    }
    opts
}

/// Strips everything up to and including the last path separator, so a
/// remote filename like `c:\games\out.bin` or `/tmp/out.bin` becomes
/// `out.bin` (or, if either separator appears with nothing after it,
/// that separator itself) -- the original applies the strip for `/` and
/// then separately for `\`, so the second pass can leave a single leading
/// separator behind.
pub fn sanitize_filename(name: &str) -> String {
    let after_slash = match name.rfind('/') {
        Some(i) => &name[i..],
        None => name,
    };
    match after_slash.rfind('\\') {
        Some(i) => after_slash[i..].to_string(),
        None => after_slash.to_string(),
    }
}

/// Opcodes of the richer dialect (`jcp_handler.h`).
pub mod skunk_op {
    pub const WRITE_STDERR: u32 = 1;
    pub const READ_STDIN: u32 = 2;
    pub const FOPEN: u32 = 3;
    pub const FCLOSE: u32 = 4;
    pub const FREAD: u32 = 5;
    pub const FWRITE: u32 = 6;
    pub const FPUTC: u32 = 7;
    pub const FEOF: u32 = 8;
    pub const FFLUSH: u32 = 9;
    pub const FGETS: u32 = 10;
    pub const FGETC: u32 = 11;
    pub const FSEEK: u32 = 12;
    pub const FTELL: u32 = 13;
}

/// Envelope header size: 2-byte content length + 4-byte result code.
pub const MSGHDRSZ: usize = 6;
/// Largest content a reply can carry inside one 4080-byte block.
pub const MSGLENMAX: usize = 4060 - MSGHDRSZ;

fn envelope(content: &[u8], result: i32) -> Vec<u8> {
    let mut out = vec![0u8; MSGHDRSZ + content.len()];
    BigEndian::write_u16(&mut out[0..2], content.len() as u16);
    BigEndian::write_i32(&mut out[2..6], result);
    out[MSGHDRSZ..].copy_from_slice(content);
    out
}

fn error_envelope() -> Vec<u8> {
    envelope(&[], -1)
}

/// The 13-opcode dialect, grounded line-for-line on
/// `jcp_handler.c::serve_request`. The outer escape command chosen by the
/// receiver is `1` for a fire-and-forget call (no reply collected) or `2`
/// for a call-and-reply; the real opcode and its arguments travel inside
/// `content` as `u16 length, u32 opcode, args...`, exactly as
/// `serve_request` decodes them.
pub struct SkunkRpcProtocol {
    files: FileDescTable,
}

impl SkunkRpcProtocol {
    pub fn new() -> Self {
        SkunkRpcProtocol {
            files: FileDescTable::new(),
        }
    }

    fn serve(&mut self, request: &[u8]) -> Vec<u8> {
        if request.len() < 6 {
            return error_envelope();
        }
        let declared_len = BigEndian::read_u16(&request[0..2]) as usize;
        let opcode = BigEndian::read_u32(&request[2..6]);
        let args = &request[6..];
        let args = &args[..declared_len.min(args.len())];

        match opcode {
            skunk_op::WRITE_STDERR => {
                let _ = std::io::stderr().write_all(args);
                let _ = std::io::stderr().flush();
                envelope(&[], 0)
            }
            skunk_op::READ_STDIN => {
                print!(">");
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                let n = std::io::stdin().read_line(&mut line).unwrap_or(0);
                if n == 0 {
                    line.clear();
                }
                let mut bytes = line.into_bytes();
                bytes.truncate(MSGLENMAX - 1);
                bytes.push(0);
                envelope(&bytes, 0)
            }
            skunk_op::FOPEN => {
                if args.is_empty() {
                    return error_envelope();
                }
                let mut parts = args.splitn(3, |&b| b == 0);
                let filename = parts.next().unwrap_or(&[]);
                let mode = parts.next().unwrap_or(&[]);
                if filename.is_empty() {
                    return error_envelope();
                }
                let filename = String::from_utf8_lossy(filename);
                let mode = String::from_utf8_lossy(mode);
                match self.files.open(&filename, &mode) {
                    Some(fd) => envelope(&[], fd as i32),
                    None => error_envelope(),
                }
            }
            skunk_op::FCLOSE => {
                if args.len() < 2 {
                    return error_envelope();
                }
                let fd = BigEndian::read_u16(&args[0..2]) as i32;
                if self.files.close(fd) {
                    envelope(&[], 0)
                } else {
                    error_envelope()
                }
            }
            skunk_op::FREAD => {
                if args.len() < 10 {
                    return envelope(&[], 0);
                }
                let size = BigEndian::read_u32(&args[0..4]) as usize;
                let nmemb = BigEndian::read_u32(&args[4..8]) as usize;
                let fd = BigEndian::read_u16(&args[8..10]) as i32;
                let total = size.saturating_mul(nmemb);
                if total == 0 || total > MSGLENMAX {
                    return envelope(&[], 0);
                }
                let Some(file) = self.files.file_mut(fd) else {
                    return envelope(&[], 0);
                };
                let mut buf = vec![0u8; total];
                let got = read_up_to(file, &mut buf);
                let elements = if size == 0 { 0 } else { got / size };
                let content_len = elements * size;
                envelope(&buf[..content_len], elements as i32)
            }
            skunk_op::FWRITE => {
                if args.len() < 10 {
                    return envelope(&[], 0);
                }
                let size = BigEndian::read_u32(&args[0..4]) as usize;
                let nmemb = BigEndian::read_u32(&args[4..8]) as usize;
                let fd = BigEndian::read_u16(&args[8..10]) as i32;
                let total = size.saturating_mul(nmemb);
                if total == 0 || total > MSGLENMAX.saturating_sub(10) {
                    return envelope(&[], 0);
                }
                let content = &args[10..args.len().min(10 + total)];
                let Some(file) = self.files.file_mut(fd) else {
                    return envelope(&[], 0);
                };
                let elements = if size == 0 {
                    0
                } else {
                    file.write_all(content).map(|_| content.len() / size).unwrap_or(0)
                };
                envelope(&[], elements as i32)
            }
            skunk_op::FPUTC => {
                if args.len() < 4 {
                    return error_envelope();
                }
                let c = BigEndian::read_u16(&args[0..2]) as u8;
                let fd = BigEndian::read_u16(&args[2..4]) as i32;
                let Some(file) = self.files.file_mut(fd) else {
                    return error_envelope();
                };
                match file.write_all(&[c]) {
                    Ok(()) => envelope(&[], c as i32),
                    Err(_) => error_envelope(),
                }
            }
            skunk_op::FEOF => {
                if args.len() < 2 {
                    return envelope(&[], 0);
                }
                let fd = BigEndian::read_u16(&args[0..2]) as i32;
                let Some(file) = self.files.file_mut(fd) else {
                    return envelope(&[], 0);
                };
                let is_eof = is_at_eof(file);
                envelope(&[], is_eof as i32)
            }
            skunk_op::FFLUSH => {
                if args.len() < 2 {
                    return error_envelope();
                }
                let fd = BigEndian::read_u16(&args[0..2]) as i32;
                let Some(file) = self.files.file_mut(fd) else {
                    return error_envelope();
                };
                match file.flush() {
                    Ok(()) => envelope(&[], 0),
                    Err(_) => error_envelope(),
                }
            }
            skunk_op::FGETS => {
                if args.len() < 6 {
                    return error_envelope();
                }
                let size = BigEndian::read_u32(&args[0..4]) as usize;
                let fd = BigEndian::read_u16(&args[4..6]) as i32;
                if size == 0 || size > MSGLENMAX {
                    return error_envelope();
                }
                let Some(file) = self.files.file_mut(fd) else {
                    return error_envelope();
                };
                match read_line_bounded(file, size - 1) {
                    Some(mut line) => {
                        line.push(0);
                        envelope(&line, 0)
                    }
                    None => error_envelope(),
                }
            }
            skunk_op::FGETC => {
                if args.len() < 2 {
                    return error_envelope();
                }
                let fd = BigEndian::read_u16(&args[0..2]) as i32;
                let Some(file) = self.files.file_mut(fd) else {
                    return error_envelope();
                };
                let mut byte = [0u8; 1];
                match file.read(&mut byte) {
                    Ok(1) => envelope(&[], byte[0] as i32),
                    _ => envelope(&[], -1),
                }
            }
            skunk_op::FSEEK => {
                if args.len() < 8 {
                    return error_envelope();
                }
                let offset = BigEndian::read_i32(&args[0..4]);
                let whence = BigEndian::read_u16(&args[4..6]);
                let fd = BigEndian::read_u16(&args[6..8]) as i32;
                let Some(file) = self.files.file_mut(fd) else {
                    return error_envelope();
                };
                // fseek(SEEK_SET, negative) is EINVAL in the source, not a
                // clamp to 0; an unrecognized whence is EINVAL too.
                let pos = match whence {
                    0 if offset >= 0 => SeekFrom::Start(offset as u64),
                    1 => SeekFrom::Current(offset as i64),
                    2 => SeekFrom::End(offset as i64),
                    _ => return error_envelope(),
                };
                match file.seek(pos) {
                    Ok(_) => envelope(&[], 0),
                    Err(_) => error_envelope(),
                }
            }
            skunk_op::FTELL => {
                if args.len() < 2 {
                    return error_envelope();
                }
                let fd = BigEndian::read_u16(&args[0..2]) as i32;
                let Some(file) = self.files.file_mut(fd) else {
                    return error_envelope();
                };
                match file.stream_position() {
                    Ok(pos) => envelope(&[], pos as i32),
                    Err(_) => error_envelope(),
                }
            }
            _ => envelope(&[], 0),
        }
    }
}

impl Default for SkunkRpcProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleProtocol for SkunkRpcProtocol {
    fn dispatch(&mut self, cmd: u16, content: &[u8], _declared_len: u16) -> Dispatch {
        match cmd {
            1 => {
                self.serve(content);
                Dispatch::Continue
            }
            2 => Dispatch::Reply(self.serve(content)),
            _ => Dispatch::Continue,
        }
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    filled
}

fn read_line_bounded(file: &mut File, max: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    while out.len() < max {
        match file.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                out.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(_) => return None,
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn is_at_eof(file: &mut File) -> bool {
    let mut byte = [0u8; 1];
    match file.read(&mut byte) {
        Ok(0) => true,
        Ok(_) => {
            // Unread it; only the single-byte interfaces above care, and
            // they re-seek relative to wherever the cursor is after this.
            let _ = file.seek(SeekFrom::Current(-1));
            false
        }
        Err(_) => true,
    }
}

/// The compatibility 7-command dialect, grounded on `HandleConsole`'s
/// `#ifndef REMOVERS` branch. Unlike the richer dialect it keeps a single
/// "current file" rather than a handle table, matching the source's bare
/// `fp` global.
pub struct SimpleProtocol {
    current: Option<File>,
}

impl SimpleProtocol {
    pub fn new() -> Self {
        SimpleProtocol { current: None }
    }
}

impl Default for SimpleProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleProtocol for SimpleProtocol {
    fn dispatch(&mut self, cmd: u16, content: &[u8], declared_len: u16) -> Dispatch {
        match cmd {
            0 => Dispatch::Continue,
            1 => Dispatch::Terminate,
            2 => {
                print!("> ");
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                    line.clear();
                }
                while matches!(line.chars().last(), Some(c) if (c as u32) < 0x20) {
                    line.pop();
                }
                let mut bytes = line.into_bytes();
                bytes.push(0);
                Dispatch::Reply(bytes)
            }
            3 => {
                let name = nul_terminated_str(content);
                let name = sanitize_filename(&name);
                self.current = File::create(&name).ok();
                Dispatch::Continue
            }
            4 => {
                let name = nul_terminated_str(content);
                let name = sanitize_filename(&name);
                self.current = File::open(&name).ok();
                Dispatch::Continue
            }
            5 => {
                if let Some(file) = self.current.as_mut() {
                    let _ = file.write_all(content);
                }
                Dispatch::Continue
            }
            6 => {
                let want = (declared_len as usize).min(4064);
                let mut buf = vec![0u8; want];
                let got = match self.current.as_mut() {
                    Some(file) => read_up_to(file, &mut buf),
                    None => 0,
                };
                buf.truncate(got);
                Dispatch::Reply(buf)
            }
            7 => {
                self.current = None;
                Dispatch::Continue
            }
            _ => Dispatch::Continue,
        }
    }
}

fn nul_terminated_str(content: &[u8]) -> String {
    let end = content.iter().position(|&b| b == 0).unwrap_or(content.len());
    String::from_utf8_lossy(&content[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filedesc_allocates_lowest_free() {
        let dir = std::env::temp_dir();
        let mut table = FileDescTable::new();
        let path_a = dir.join("cartctl_test_a.bin");
        let path_b = dir.join("cartctl_test_b.bin");
        let path_c = dir.join("cartctl_test_c.bin");

        let fd1 = table.open(path_a.to_str().unwrap(), "w").unwrap();
        let fd2 = table.open(path_b.to_str().unwrap(), "w").unwrap();
        assert_eq!(fd1, 2);
        assert_eq!(fd2, 3);

        assert!(table.close(fd1 as i32));
        let fd3 = table.open(path_c.to_str().unwrap(), "w").unwrap();
        assert_eq!(fd3, 2);

        let _ = std::fs::remove_file(path_a);
        let _ = std::fs::remove_file(path_b);
        let _ = std::fs::remove_file(path_c);
    }

    #[test]
    fn stdin_and_stderr_preallocated() {
        let table = FileDescTable::new();
        assert!(table.is_open(0));
        assert!(table.is_open(1));
    }

    #[test]
    fn sanitize_strips_unix_path() {
        assert_eq!(sanitize_filename("/tmp/foo/out.bin"), "/out.bin");
        assert_eq!(sanitize_filename("out.bin"), "out.bin");
    }

    #[test]
    fn sanitize_strips_windows_path() {
        assert_eq!(sanitize_filename("c:\\games\\out.bin"), "\\out.bin");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for s in ["/tmp/foo/out.bin", "c:\\games\\out.bin", "out.bin", "/a"] {
            let once = sanitize_filename(s);
            let twice = sanitize_filename(&once);
            assert_eq!(once, twice);
        }
    }

    proptest::proptest! {
        #[test]
        fn sanitize_idempotent_any_string(s in "\\PC*") {
            let once = sanitize_filename(&s);
            let twice = sanitize_filename(&once);
            proptest::prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn skunk_fopen_fwrite_fread_fclose_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join("cartctl_test_skunk.bin");
        let path_str = path.to_str().unwrap();

        let mut proto = SkunkRpcProtocol::new();

        let mut open_req = Vec::new();
        open_req.extend_from_slice(path_str.as_bytes());
        open_req.push(0);
        open_req.extend_from_slice(b"wb");
        open_req.push(0);
        let reply = proto.serve(&build_request(skunk_op::FOPEN, &open_req));
        let fd = BigEndian::read_i32(&reply[2..6]);
        assert!(fd >= 2);

        let mut write_req = Vec::new();
        write_req.extend_from_slice(&1u32.to_be_bytes());
        write_req.extend_from_slice(&4u32.to_be_bytes());
        write_req.extend_from_slice(&(fd as u16).to_be_bytes());
        write_req.extend_from_slice(b"abcd");
        proto.serve(&build_request(skunk_op::FWRITE, &write_req));

        let mut close_req = Vec::new();
        close_req.extend_from_slice(&(fd as u16).to_be_bytes());
        proto.serve(&build_request(skunk_op::FCLOSE, &close_req));

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, b"abcd");
        let _ = std::fs::remove_file(&path);
    }

    fn build_request(opcode: u32, args: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 6 + args.len()];
        BigEndian::write_u16(&mut out[0..2], args.len() as u16);
        BigEndian::write_u32(&mut out[2..6], opcode);
        out[6..].copy_from_slice(args);
        out
    }
}
