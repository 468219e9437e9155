//! Defines the [`WireRead`] and [`WireWrite`] traits and implements them for a single variable
//! and for a whole [`MessageDict`].
//!
//! # Serialization of a variable
//! A variable is serialized as its name's bytes followed by a NUL byte, then a little-endian
//! [`u32`] indicating the length of the value in bytes, followed by said amount of bytes and a
//! trailing NUL byte:
//! ```text
//! +------+-----+-----------+-------+-----+
//! | NAME | NUL | VALUE_LEN | VALUE | NUL |
//! +------+-----+-----------+-------+-----+
//! |  N   |  1  |     4     |   L   |  1  |
//! +------+-----+-----------+-------+-----+
//! ```
//!
//! Names may not contain NUL bytes, values may contain anything. A [`MessageDict`] is serialized
//! as its variables, one after the other, in insertion order. There is no count prefix, the
//! frame header carrying the dictionary determines where it ends.

use std::io::{self, Error, ErrorKind};

use crate::dict::MessageDict;

/// The amount of bytes a variable takes on the wire besides its name and value.
pub const VARIABLE_OVERHEAD: usize = 1 + 4 + 1;

/// Serializes a type into bytes, appending them to a buffer.
pub trait WireWrite {
    /// Serializes this instance into bytes, appending those bytes to `buf`.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were appended.
    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()>;
}

/// Deserializes a type from raw bytes, advancing the given slice past the consumed bytes.
pub trait WireRead: Sized {
    fn read_from(buf: &mut &[u8]) -> io::Result<Self>;
}

/// A borrowed `(name, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
}

impl<'a> Variable<'a> {
    pub const fn new(name: &'a str, value: &'a [u8]) -> Self {
        Self { name, value }
    }

    /// Parses a single variable, borrowing its name and value from `buf`.
    pub fn parse(buf: &mut &'a [u8]) -> io::Result<Self> {
        let bytes: &'a [u8] = *buf;
        let nul = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Variable name is not NUL-terminated"))?;

        let name = std::str::from_utf8(&bytes[..nul]).map_err(|_| Error::new(ErrorKind::InvalidData, "Variable name is not valid UTF-8"))?;
        let rest = &bytes[(nul + 1)..];

        if rest.len() < 4 {
            return Err(Error::new(ErrorKind::InvalidData, "Variable is missing its value length"));
        }

        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let rest = &rest[4..];

        if rest.len() < len + 1 {
            return Err(Error::new(ErrorKind::InvalidData, "Variable value is truncated"));
        }

        if rest[len] != 0 {
            return Err(Error::new(ErrorKind::InvalidData, "Variable value is not NUL-terminated"));
        }

        let value = &rest[..len];
        *buf = &rest[(len + 1)..];
        Ok(Self { name, value })
    }

    /// The amount of bytes this variable takes on the wire.
    pub fn encoded_len(&self) -> usize {
        self.name.len() + self.value.len() + VARIABLE_OVERHEAD
    }
}

impl<'a> WireWrite for Variable<'a> {
    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        if self.name.as_bytes().contains(&0) {
            return Err(Error::new(ErrorKind::InvalidData, "Variable name contains a NUL byte"));
        }

        let len = u32::try_from(self.value.len()).map_err(|_| Error::new(ErrorKind::InvalidData, "Variable value is too long (>= 4GB)"))?;

        buf.reserve(self.encoded_len());
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(self.value);
        buf.push(0);
        Ok(())
    }
}

impl WireWrite for MessageDict {
    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        for (name, value) in self.iter() {
            Variable::new(name, value).write_to(buf)?;
        }

        Ok(())
    }
}

impl WireRead for MessageDict {
    /// Parses variables until the buffer is exhausted.
    fn read_from(buf: &mut &[u8]) -> io::Result<Self> {
        let mut dict = MessageDict::new();
        while !buf.is_empty() {
            let var = Variable::parse(buf)?;
            dict.set_var(var.name, var.value);
        }

        Ok(dict)
    }
}

/// The amount of bytes `dict` takes on the wire, excluding the frame header.
pub fn encoded_len(dict: &MessageDict) -> usize {
    dict.iter().map(|(n, v)| n.len() + v.len() + VARIABLE_OVERHEAD).sum()
}
