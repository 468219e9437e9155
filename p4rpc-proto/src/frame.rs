//! Format of a frame carrying one message:
//! +----------+--------+-----------+
//! | CHECKSUM | LENGTH |  PAYLOAD  |
//! +----------+--------+-----------+
//! |    1     |   4    |  LENGTH   |
//! +----------+--------+-----------+
//!
//! `LENGTH` is a little-endian [`u32`] and `CHECKSUM` is the XOR of its four bytes, which allows
//! quickly recognizing a stream that is clearly not in the right format (e.g. a TLS record
//! arriving at a plaintext listener). The `PAYLOAD` is a serialized [`MessageDict`].

use std::io::{self, Error, ErrorKind};

use crate::{
    dict::MessageDict,
    serialize::{WireRead, WireWrite},
};

/// The size (in bytes) of the frame header.
pub const HEADER_SIZE: usize = 5;

/// The amount of bytes a message takes on the wire besides its payload.
pub const SEND_OVERHEAD: usize = HEADER_SIZE;

/// The largest payload a single frame may carry.
pub const MAX_MESSAGE_SIZE: usize = 0x1fff_ffff;

/// Builds the header for a payload of `len` bytes.
pub fn header(len: usize) -> io::Result<[u8; HEADER_SIZE]> {
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::new(ErrorKind::InvalidData, "Message is too large to be framed"));
    }

    let l = (len as u32).to_le_bytes();
    Ok([l[0] ^ l[1] ^ l[2] ^ l[3], l[0], l[1], l[2], l[3]])
}

/// Parses a frame header, returning the length of the payload that follows it.
pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> io::Result<usize> {
    if buf[0] != buf[1] ^ buf[2] ^ buf[3] ^ buf[4] {
        return Err(Error::new(ErrorKind::InvalidData, "Frame header checksum mismatch"));
    }

    let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::new(ErrorKind::InvalidData, "Frame length exceeds the maximum message size"));
    }

    Ok(len)
}

/// Serializes `dict` into a complete frame, header included.
pub fn encode_message(dict: &MessageDict) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; HEADER_SIZE];
    dict.write_to(&mut buf)?;

    let head = header(buf.len() - HEADER_SIZE)?;
    buf[..HEADER_SIZE].copy_from_slice(&head);
    Ok(buf)
}

/// Returns how many more bytes must be appended to `buf` before it holds a complete frame, or 0
/// if it already does.
pub fn bytes_needed(buf: &[u8]) -> io::Result<usize> {
    if buf.len() < HEADER_SIZE {
        return Ok(HEADER_SIZE - buf.len());
    }

    let mut head = [0u8; HEADER_SIZE];
    head.copy_from_slice(&buf[..HEADER_SIZE]);
    let total = HEADER_SIZE + parse_header(&head)?;
    Ok(total.saturating_sub(buf.len()))
}

/// If `buf` starts with a complete frame, removes it from the buffer and returns the parsed
/// message together with its payload size. Returns `Ok(None)` if more bytes are needed.
pub fn take_frame(buf: &mut Vec<u8>) -> io::Result<Option<(MessageDict, usize)>> {
    if bytes_needed(buf)? != 0 {
        return Ok(None);
    }

    let mut head = [0u8; HEADER_SIZE];
    head.copy_from_slice(&buf[..HEADER_SIZE]);
    let len = parse_header(&head)?;

    let dict = MessageDict::read_from(&mut &buf[HEADER_SIZE..(HEADER_SIZE + len)])?;
    buf.drain(..(HEADER_SIZE + len));
    Ok(Some((dict, len)))
}
