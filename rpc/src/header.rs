//! The 9-byte frame header.

use crate::Error;

/// Size of an encoded header in bytes.
pub const HEADER_LEN: usize = 9;

const FLAG_STREAM: u8 = 0b1000;
const FLAG_END_OR_ERROR: u8 = 0b0100;
const BODY_TYPE_MASK: u8 = 0b0011;

/// How a frame's body is to be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyType {
    Binary = 0,
    Utf8 = 1,
    Json = 2,
}

impl BodyType {
    fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits {
            0 => Ok(Self::Binary),
            1 => Ok(Self::Utf8),
            2 => Ok(Self::Json),
            other => Err(Error::InvalidBodyType(other)),
        }
    }
}

/// A decoded frame header.
///
/// On the wire: one flag byte (bit 3 `part_of_stream`, bit 2 `end_or_error`,
/// bits 0-1 the body type), a big-endian unsigned 32-bit body length, and a
/// big-endian signed 32-bit request id. Positive ids belong to requests from
/// the peer that allocated them; the matching responses carry the negation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub part_of_stream: bool,
    pub end_or_error: bool,
    pub body_type: BodyType,
    pub body_length: u32,
    pub request_id: i32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = (self.body_type as u8)
            | if self.part_of_stream { FLAG_STREAM } else { 0 }
            | if self.end_or_error { FLAG_END_OR_ERROR } else { 0 };
        bytes[1..5].copy_from_slice(&self.body_length.to_be_bytes());
        bytes[5..9].copy_from_slice(&self.request_id.to_be_bytes());
        bytes
    }

    /// Decode a header. Unknown high flag bits are ignored for forward
    /// compatibility; an unknown body type is rejected.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        let flags = bytes[0];
        // Cannot fail: both slices are four bytes by construction.
        let body_length = u32::from_be_bytes(bytes[1..5].try_into().expect("fixed slice"));
        let request_id = i32::from_be_bytes(bytes[5..9].try_into().expect("fixed slice"));
        Ok(Self {
            part_of_stream: flags & FLAG_STREAM != 0,
            end_or_error: flags & FLAG_END_OR_ERROR != 0,
            body_type: BodyType::from_bits(flags & BODY_TYPE_MASK)?,
            body_length,
            request_id,
        })
    }

    /// Whether these bytes are the goodbye signal: an all-zero header ends
    /// the read loop gracefully and is not a frame.
    pub fn is_goodbye(bytes: &[u8; HEADER_LEN]) -> bool {
        bytes.iter().all(|&b| b == 0)
    }
}
