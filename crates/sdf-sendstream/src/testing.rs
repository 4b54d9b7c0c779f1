//! Synthetic stream construction for tests.
//!
//! Builds wire-exact send-stream bytes so parser, pipeline, and driver
//! tests can run without a btrfs mount. This is test support, not a
//! stream writer: commands are assembled directly from raw TLVs.

use sdf_types::{SEND_CMD_HEADER_SIZE, SEND_STREAM_MAGIC, SEND_STREAM_VERSION, SEND_TLV_HEADER_SIZE, crc32c};

/// Encode one TLV attribute.
#[must_use]
pub fn tlv(attr: u16, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEND_TLV_HEADER_SIZE + value.len());
    out.extend_from_slice(&attr.to_le_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
    out
}

/// Encode a `u64` attribute.
#[must_use]
pub fn tlv_u64(attr: u16, value: u64) -> Vec<u8> {
    tlv(attr, &value.to_le_bytes())
}

/// Encode one command with a valid checksum.
#[must_use]
pub fn command(cmd: u16, tlvs: &[Vec<u8>]) -> Vec<u8> {
    let data: Vec<u8> = tlvs.iter().flatten().copied().collect();
    let mut out = Vec::with_capacity(SEND_CMD_HEADER_SIZE + data.len());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&data);
    let crc = crc32c(&out);
    out[6..10].copy_from_slice(&crc.to_le_bytes());
    out
}

/// Assemble a whole stream: header plus the given commands.
#[must_use]
pub fn stream(commands: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SEND_STREAM_MAGIC);
    out.extend_from_slice(&SEND_STREAM_VERSION.to_le_bytes());
    for command in commands {
        out.extend_from_slice(command);
    }
    out
}
