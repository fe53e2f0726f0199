//! Wire formats for records and handshake messages.
//!
//! Every message has a `parse(input) -> IResult` and a
//! `serialize(&self, &mut Buf)` that are exact inverses for valid input.

mod alert;
mod certificate;
mod client_hello;
mod finished;
mod handshake;
mod hello_verify;
mod id;
mod key_exchange;
mod random;
mod record;
mod server_hello;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use certificate::Certificate;
pub use client_hello::ClientHello;
pub use finished::Finished;
pub use handshake::{Body, Handshake, Header, MessageType};
pub use hello_verify::HelloVerifyRequest;
pub use id::{Cookie, LegacySessionId};
pub use key_exchange::KeyExchange;
pub use random::Random;
pub use record::{ContentType, DTLSRecord, Sequence, MAX_SEQUENCE};
pub use record::HEADER_LEN as RECORD_HEADER_LEN;
pub use server_hello::ServerHello;

use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    DTLS1_0,
    DTLS1_2,
    Unknown(u16),
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ProtocolVersion {
    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolVersion::DTLS1_0 => 0xFEFF,
            ProtocolVersion::DTLS1_2 => 0xFEFD,
            ProtocolVersion::Unknown(value) => *value,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0xFEFF => ProtocolVersion::DTLS1_0,
            0xFEFD => ProtocolVersion::DTLS1_2,
            _ => ProtocolVersion::Unknown(value),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ProtocolVersion::Unknown(_))
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, version) = be_u16(input)?;
        Ok((input, Self::from_u16(version)))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.as_u16().to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    #[default]
    Null,
    Unknown(u8),
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => CompressionMethod::Null,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CompressionMethod::Null => 0x00,
            CompressionMethod::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CompressionMethod> {
        let (input, value) = be_u8(input)?;
        Ok((input, Self::from_u8(value)))
    }
}

/// Parse a 48 bit big endian unsigned integer.
pub(crate) fn be_u48(input: &[u8]) -> IResult<&[u8], u64> {
    if input.len() < 6 {
        return Err(Err::Error(Error::new(input, ErrorKind::Eof)));
    }
    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(&input[..6]);
    Ok((&input[6..], u64::from_be_bytes(bytes)))
}

/// Write the low 24 bits of `v` big endian.
pub(crate) fn put_u24(output: &mut Buf, v: u32) {
    output.extend_from_slice(&v.to_be_bytes()[1..]);
}
