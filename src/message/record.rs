use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::{be_u48, ProtocolVersion};
use crate::buffer::Buf;

/// Record header length on the wire.
pub const HEADER_LEN: usize = 13;

/// Largest sequence number that fits the 48 bit wire field.
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

/// Epoch and record sequence number.
///
/// Ordered by epoch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence {
    pub epoch: u16,
    pub sequence_number: u64,
}

impl Sequence {
    pub fn new(epoch: u16, sequence_number: u64) -> Self {
        Sequence {
            epoch,
            sequence_number,
        }
    }

    /// The 8 byte wire form, epoch followed by the 48 bit sequence number.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = (self.sequence_number & MAX_SEQUENCE).to_be_bytes();
        out[..2].copy_from_slice(&self.epoch.to_be_bytes());
        out
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.sequence_number)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DTLSRecord<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub fragment: &'a [u8],
}

impl<'a> DTLSRecord<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], DTLSRecord<'a>> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;
        let (input, fragment) = take(length as usize)(input)?;

        Ok((
            input,
            DTLSRecord {
                content_type,
                version,
                sequence: Sequence::new(epoch, sequence_number),
                fragment,
            },
        ))
    }

    /// Write the header followed by the fragment.
    pub fn serialize(&self, output: &mut Buf) {
        Self::serialize_header(
            self.content_type,
            self.version,
            self.sequence,
            self.fragment.len(),
            output,
        );
        output.extend_from_slice(self.fragment);
    }

    pub fn serialize_header(
        content_type: ContentType,
        version: ProtocolVersion,
        sequence: Sequence,
        length: usize,
        output: &mut Buf,
    ) {
        output.push(content_type.as_u8());
        version.serialize(output);
        output.extend_from_slice(&sequence.to_bytes());
        output.extend_from_slice(&(length as u16).to_be_bytes());
    }
}
