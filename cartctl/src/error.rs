// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

/// The closed set of error kinds this crate can raise.
#[derive(Debug, thiserror::Error)]
pub enum CartctlError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("USB control transfer failed: {0}")]
    Usb(String),

    #[error("protocol version mismatch (length field 0x{0:04x}); upgrade cartctl")]
    ProtocolVersion(u16),

    #[error("unauthorized: a different ROM must be flashed before this action")]
    Unauthorized,

    #[error("file detection error: {0}")]
    Detection(String),

    #[error("handshake timed out waiting for window to become writable")]
    HandshakeTimeout,

    #[error("device not found")]
    DeviceNotFound,
}

pub type Result<T> = std::result::Result<T, CartctlError>;

impl CartctlError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CartctlError::Io {
            path: path.into(),
            source,
        }
    }
}
