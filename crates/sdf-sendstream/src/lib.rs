#![forbid(unsafe_code)]
//! btrfs send-stream parser.
//!
//! Decodes the version-1 send-stream framing (13-byte magic + `u32`
//! version header, then CRC32C-protected commands carrying TLV
//! attributes) and dispatches each operation to a [`StreamHandler`].
//! The parser yields one command per [`StreamReader::poll_next`] call
//! so a consumer can poll a cancellation flag between commands.
//!
//! Layouts match the kernel's on-wire definitions verbatim; unknown
//! command codes are skipped for forward compatibility.

use sdf_error::{Result, SdfError};
use sdf_types::{
    ParseError, SEND_A_CLONE_CTRANSID, SEND_A_CLONE_LEN, SEND_A_CLONE_OFFSET, SEND_A_CLONE_PATH,
    SEND_A_CLONE_UUID, SEND_A_CTRANSID, SEND_A_DATA, SEND_A_FILE_OFFSET, SEND_A_GID, SEND_A_MODE,
    SEND_A_PATH, SEND_A_PATH_LINK, SEND_A_PATH_TO, SEND_A_RDEV, SEND_A_SIZE, SEND_A_UID,
    SEND_A_UUID, SEND_A_XATTR_DATA, SEND_A_XATTR_NAME,
    SEND_C_CHMOD, SEND_C_CHOWN, SEND_C_CLONE, SEND_C_END, SEND_C_LINK, SEND_C_MKDIR,
    SEND_C_MKFIFO, SEND_C_MKFILE, SEND_C_MKNOD, SEND_C_MKSOCK, SEND_C_REMOVE_XATTR,
    SEND_C_RENAME, SEND_C_RMDIR, SEND_C_SET_XATTR, SEND_C_SNAPSHOT, SEND_C_SUBVOL,
    SEND_C_SYMLINK, SEND_C_TRUNCATE, SEND_C_UNLINK, SEND_C_UPDATE_EXTENT, SEND_C_UTIMES,
    SEND_C_WRITE, SEND_CMD_HEADER_SIZE, SEND_STREAM_MAGIC, SEND_STREAM_VERSION,
    SEND_TLV_HEADER_SIZE, crc32c, read_fixed, read_le_u16, read_le_u32, read_le_u64,
};
use std::io::Read;
use tracing::trace;

pub mod testing;

/// Largest command payload the parser will buffer. The kernel caps
/// send commands well below this even for full-data streams.
const MAX_CMD_LEN: usize = 256 * 1024;

/// Outcome of one parser invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProgress {
    /// One command was decoded and dispatched; more may follow.
    Handled,
    /// The stream terminated (`end` command or clean EOF at a command
    /// boundary).
    End,
}

/// Callback table for send-stream operations.
///
/// All paths are relative to the snapshot root, without a leading `/`.
/// Default implementations ignore the operation, so a handler only
/// implements the operations it aggregates.
#[allow(unused_variables)]
pub trait StreamHandler {
    fn subvol(&mut self, path: &str, uuid: &[u8; 16], ctransid: u64) -> Result<()> {
        Ok(())
    }
    fn snapshot(
        &mut self,
        path: &str,
        uuid: &[u8; 16],
        ctransid: u64,
        parent_uuid: &[u8; 16],
        parent_ctransid: u64,
    ) -> Result<()> {
        Ok(())
    }
    fn mkfile(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn mkdir(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn mknod(&mut self, path: &str, mode: u64, rdev: u64) -> Result<()> {
        Ok(())
    }
    fn mkfifo(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn mksock(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn symlink(&mut self, path: &str, target: &str) -> Result<()> {
        Ok(())
    }
    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        Ok(())
    }
    fn link(&mut self, path: &str, target: &str) -> Result<()> {
        Ok(())
    }
    fn unlink(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn rmdir(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn write(&mut self, path: &str, offset: u64, len: u64) -> Result<()> {
        Ok(())
    }
    fn clone(
        &mut self,
        path: &str,
        offset: u64,
        len: u64,
        clone_path: &str,
        clone_offset: u64,
    ) -> Result<()> {
        Ok(())
    }
    fn set_xattr(&mut self, path: &str, name: &[u8], value: &[u8]) -> Result<()> {
        Ok(())
    }
    fn remove_xattr(&mut self, path: &str, name: &[u8]) -> Result<()> {
        Ok(())
    }
    fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        Ok(())
    }
    fn chmod(&mut self, path: &str, mode: u64) -> Result<()> {
        Ok(())
    }
    fn chown(&mut self, path: &str, uid: u64, gid: u64) -> Result<()> {
        Ok(())
    }
    fn utimes(&mut self, path: &str) -> Result<()> {
        Ok(())
    }
    fn update_extent(&mut self, path: &str, offset: u64, len: u64) -> Result<()> {
        Ok(())
    }
}

// ── TLV access ──────────────────────────────────────────────────────────────

/// Decoded attribute list of one command.
struct Attrs<'a> {
    entries: Vec<(u16, &'a [u8])>,
}

impl<'a> Attrs<'a> {
    fn parse(mut data: &'a [u8]) -> std::result::Result<Self, ParseError> {
        let mut entries = Vec::new();
        while !data.is_empty() {
            let tlv_type = read_le_u16(data, 0)?;
            let tlv_len = usize::from(read_le_u16(data, 2)?);
            let end =
                SEND_TLV_HEADER_SIZE
                    .checked_add(tlv_len)
                    .ok_or(ParseError::InvalidField {
                        field: "tlv_len",
                        reason: "overflow",
                    })?;
            if data.len() < end {
                return Err(ParseError::InsufficientData {
                    needed: end,
                    offset: 0,
                    actual: data.len(),
                });
            }
            entries.push((tlv_type, &data[SEND_TLV_HEADER_SIZE..end]));
            data = &data[end..];
        }
        Ok(Self { entries })
    }

    fn get(&self, attr: u16) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == attr)
            .map(|(_, v)| *v)
    }

    fn bytes(&self, attr: u16) -> std::result::Result<&'a [u8], ParseError> {
        self.get(attr).ok_or(ParseError::InvalidField {
            field: "attr",
            reason: "required attribute missing",
        })
    }

    fn u64(&self, attr: u16) -> std::result::Result<u64, ParseError> {
        read_le_u64(self.bytes(attr)?, 0)
    }

    fn uuid(&self, attr: u16) -> std::result::Result<[u8; 16], ParseError> {
        read_fixed::<16>(self.bytes(attr)?, 0)
    }

    fn path(&self, attr: u16) -> std::result::Result<&'a str, ParseError> {
        std::str::from_utf8(self.bytes(attr)?).map_err(|_| ParseError::InvalidPath)
    }
}

// ── Stream reader ───────────────────────────────────────────────────────────

/// Incremental send-stream reader over any byte source.
pub struct StreamReader<R> {
    inner: R,
    header_read: bool,
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header_read: false,
        }
    }

    /// Decode and dispatch the next command.
    ///
    /// The stream header is consumed transparently before the first
    /// command. Returns [`StreamProgress::End`] on the `end` command or
    /// on a clean EOF between commands; EOF anywhere else is an error.
    pub fn poll_next<H: StreamHandler>(&mut self, handler: &mut H) -> Result<StreamProgress> {
        if !self.header_read {
            self.read_stream_header()?;
            self.header_read = true;
        }

        let mut header = [0_u8; SEND_CMD_HEADER_SIZE];
        if !self.read_exact_or_eof(&mut header)? {
            return Ok(StreamProgress::End);
        }

        let len = read_le_u32(&header, 0).map_err(SdfError::Stream)?;
        let cmd = read_le_u16(&header, 4).map_err(SdfError::Stream)?;
        let expected_crc = read_le_u32(&header, 6).map_err(SdfError::Stream)?;

        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > MAX_CMD_LEN {
            return Err(ParseError::InvalidField {
                field: "cmd_len",
                reason: "exceeds command size limit",
            }
            .into());
        }

        // The checksum covers the whole command with the crc field zeroed,
        // so reassemble header + data contiguously.
        let mut command = vec![0_u8; SEND_CMD_HEADER_SIZE + len];
        command[..SEND_CMD_HEADER_SIZE].copy_from_slice(&header);
        command[6..10].fill(0);
        self.inner.read_exact(&mut command[SEND_CMD_HEADER_SIZE..])?;

        let computed = crc32c(&command);
        if computed != expected_crc {
            return Err(ParseError::ChecksumMismatch {
                expected: expected_crc,
                computed,
            }
            .into());
        }

        trace!(cmd, len, "send_stream_command");
        if cmd == SEND_C_END {
            return Ok(StreamProgress::End);
        }
        self.dispatch(cmd, &command[SEND_CMD_HEADER_SIZE..], handler)?;
        Ok(StreamProgress::Handled)
    }

    fn read_stream_header(&mut self) -> Result<()> {
        let mut header = [0_u8; SEND_STREAM_MAGIC.len() + 4];
        self.inner.read_exact(&mut header)?;
        if &header[..SEND_STREAM_MAGIC.len()] != SEND_STREAM_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SEND_STREAM_MAGIC.to_vec(),
                actual: header[..SEND_STREAM_MAGIC.len()].to_vec(),
            }
            .into());
        }
        let version = read_le_u32(&header, SEND_STREAM_MAGIC.len()).map_err(SdfError::Stream)?;
        if version != SEND_STREAM_VERSION {
            return Err(ParseError::UnsupportedVersion(version).into());
        }
        Ok(())
    }

    /// `read_exact` that distinguishes a clean EOF before the first
    /// byte from a truncated read.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(SdfError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "send stream truncated inside a command header",
                )));
            }
            filled += n;
        }
        Ok(true)
    }

    fn dispatch<H: StreamHandler>(&mut self, cmd: u16, data: &[u8], handler: &mut H) -> Result<()> {
        let attrs = Attrs::parse(data).map_err(SdfError::Stream)?;
        match cmd {
            SEND_C_SUBVOL => handler.subvol(
                attrs.path(SEND_A_PATH)?,
                &attrs.uuid(SEND_A_UUID)?,
                attrs.u64(SEND_A_CTRANSID)?,
            ),
            SEND_C_SNAPSHOT => handler.snapshot(
                attrs.path(SEND_A_PATH)?,
                &attrs.uuid(SEND_A_UUID)?,
                attrs.u64(SEND_A_CTRANSID)?,
                &attrs.uuid(SEND_A_CLONE_UUID)?,
                attrs.u64(SEND_A_CLONE_CTRANSID)?,
            ),
            SEND_C_MKFILE => handler.mkfile(attrs.path(SEND_A_PATH)?),
            SEND_C_MKDIR => handler.mkdir(attrs.path(SEND_A_PATH)?),
            SEND_C_MKNOD => handler.mknod(
                attrs.path(SEND_A_PATH)?,
                attrs.u64(SEND_A_MODE)?,
                attrs.u64(SEND_A_RDEV)?,
            ),
            SEND_C_MKFIFO => handler.mkfifo(attrs.path(SEND_A_PATH)?),
            SEND_C_MKSOCK => handler.mksock(attrs.path(SEND_A_PATH)?),
            SEND_C_SYMLINK => handler.symlink(
                attrs.path(SEND_A_PATH)?,
                attrs.path(SEND_A_PATH_LINK)?,
            ),
            SEND_C_RENAME => handler.rename(
                attrs.path(SEND_A_PATH)?,
                attrs.path(SEND_A_PATH_TO)?,
            ),
            SEND_C_LINK => handler.link(
                attrs.path(SEND_A_PATH)?,
                attrs.path(SEND_A_PATH_LINK)?,
            ),
            SEND_C_UNLINK => handler.unlink(attrs.path(SEND_A_PATH)?),
            SEND_C_RMDIR => handler.rmdir(attrs.path(SEND_A_PATH)?),
            SEND_C_WRITE => {
                let data_len = attrs.bytes(SEND_A_DATA)?.len() as u64;
                handler.write(
                    attrs.path(SEND_A_PATH)?,
                    attrs.u64(SEND_A_FILE_OFFSET)?,
                    data_len,
                )
            }
            SEND_C_CLONE => handler.clone(
                attrs.path(SEND_A_PATH)?,
                attrs.u64(SEND_A_FILE_OFFSET)?,
                attrs.u64(SEND_A_CLONE_LEN)?,
                attrs.path(SEND_A_CLONE_PATH)?,
                attrs.u64(SEND_A_CLONE_OFFSET)?,
            ),
            SEND_C_SET_XATTR => handler.set_xattr(
                attrs.path(SEND_A_PATH)?,
                attrs.bytes(SEND_A_XATTR_NAME)?,
                attrs.bytes(SEND_A_XATTR_DATA)?,
            ),
            SEND_C_REMOVE_XATTR => handler.remove_xattr(
                attrs.path(SEND_A_PATH)?,
                attrs.bytes(SEND_A_XATTR_NAME)?,
            ),
            SEND_C_TRUNCATE => handler.truncate(
                attrs.path(SEND_A_PATH)?,
                attrs.u64(SEND_A_SIZE)?,
            ),
            SEND_C_CHMOD => handler.chmod(
                attrs.path(SEND_A_PATH)?,
                attrs.u64(SEND_A_MODE)?,
            ),
            SEND_C_CHOWN => handler.chown(
                attrs.path(SEND_A_PATH)?,
                attrs.u64(SEND_A_UID)?,
                attrs.u64(SEND_A_GID)?,
            ),
            SEND_C_UTIMES => handler.utimes(attrs.path(SEND_A_PATH)?),
            SEND_C_UPDATE_EXTENT => handler.update_extent(
                attrs.path(SEND_A_PATH)?,
                attrs.u64(SEND_A_FILE_OFFSET)?,
                attrs.u64(SEND_A_SIZE)?,
            ),
            other => {
                // Forward compatibility: skip commands we do not know.
                trace!(cmd = other, "send_stream_unknown_command_skipped");
                Ok(())
            }
        }
    }
}
