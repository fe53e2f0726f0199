use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

use super::{
    put_u24, Certificate, ClientHello, Finished, HelloVerifyRequest, KeyExchange, ServerHello,
};
use crate::buffer::Buf;

/// Handshake header length on the wire.
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub msg_type: MessageType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl Header {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        Ok((
            input,
            Header {
                msg_type,
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.msg_type.as_u8());
        put_u24(output, self.length);
        output.extend_from_slice(&self.message_seq.to_be_bytes());
        put_u24(output, self.fragment_offset);
        put_u24(output, self.fragment_length);
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_offset > 0 || self.fragment_length < self.length
    }
}

/// One handshake fragment as carried in a record.
#[derive(Debug, PartialEq, Eq)]
pub struct Handshake<'a> {
    pub header: Header,
    pub fragment: &'a [u8],
}

impl<'a> Handshake<'a> {
    /// Parse one fragment. The fragment must lie inside the declared message.
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Handshake<'a>> {
        let (input, header) = Header::parse(input)?;

        let end = header.fragment_offset as u64 + header.fragment_length as u64;
        if end > header.length as u64 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }

        let (input, fragment) = take(header.fragment_length as usize)(input)?;

        Ok((input, Handshake { header, fragment }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.header.serialize(output);
        output.extend_from_slice(self.fragment);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    ServerHelloDone,
    ClientKeyExchange,
    Finished,
    #[default]
    Unknown,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MessageType::ClientHello,
            2 => MessageType::ServerHello,
            3 => MessageType::HelloVerifyRequest,
            11 => MessageType::Certificate,
            12 => MessageType::ServerKeyExchange,
            14 => MessageType::ServerHelloDone,
            16 => MessageType::ClientKeyExchange,
            20 => MessageType::Finished,
            _ => MessageType::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::ClientHello => 1,
            MessageType::ServerHello => 2,
            MessageType::HelloVerifyRequest => 3,
            MessageType::Certificate => 11,
            MessageType::ServerKeyExchange => 12,
            MessageType::ServerHelloDone => 14,
            MessageType::ClientKeyExchange => 16,
            MessageType::Finished => 20,
            MessageType::Unknown => 255,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], MessageType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

/// A complete, reassembled handshake message body.
#[derive(Debug, PartialEq, Eq)]
pub enum Body<'a> {
    ClientHello(ClientHello),
    HelloVerifyRequest(HelloVerifyRequest),
    ServerHello(ServerHello),
    Certificate(Certificate<'a>),
    ServerKeyExchange(KeyExchange<'a>),
    ServerHelloDone,
    ClientKeyExchange(KeyExchange<'a>),
    Finished(Finished<'a>),
}

impl<'a> Body<'a> {
    /// Parse a whole message body. Trailing bytes are an error.
    pub fn parse(input: &'a [u8], msg_type: MessageType) -> IResult<&'a [u8], Body<'a>> {
        let (rest, body) = match msg_type {
            MessageType::ClientHello => {
                let (i, m) = ClientHello::parse(input)?;
                (i, Body::ClientHello(m))
            }
            MessageType::HelloVerifyRequest => {
                let (i, m) = HelloVerifyRequest::parse(input)?;
                (i, Body::HelloVerifyRequest(m))
            }
            MessageType::ServerHello => {
                let (i, m) = ServerHello::parse(input)?;
                (i, Body::ServerHello(m))
            }
            MessageType::Certificate => {
                let (i, m) = Certificate::parse(input)?;
                (i, Body::Certificate(m))
            }
            MessageType::ServerKeyExchange => {
                let (i, m) = KeyExchange::parse(input)?;
                (i, Body::ServerKeyExchange(m))
            }
            MessageType::ServerHelloDone => (input, Body::ServerHelloDone),
            MessageType::ClientKeyExchange => {
                let (i, m) = KeyExchange::parse(input)?;
                (i, Body::ClientKeyExchange(m))
            }
            MessageType::Finished => {
                let (i, m) = Finished::parse(input)?;
                (i, Body::Finished(m))
            }
            MessageType::Unknown => {
                return Err(Err::Failure(Error::new(input, ErrorKind::Switch)));
            }
        };

        if !rest.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::Eof)));
        }

        Ok((rest, body))
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Body::ClientHello(_) => MessageType::ClientHello,
            Body::HelloVerifyRequest(_) => MessageType::HelloVerifyRequest,
            Body::ServerHello(_) => MessageType::ServerHello,
            Body::Certificate(_) => MessageType::Certificate,
            Body::ServerKeyExchange(_) => MessageType::ServerKeyExchange,
            Body::ServerHelloDone => MessageType::ServerHelloDone,
            Body::ClientKeyExchange(_) => MessageType::ClientKeyExchange,
            Body::Finished(_) => MessageType::Finished,
        }
    }

    pub fn serialize(&self, output: &mut Buf) {
        match self {
            Body::ClientHello(m) => m.serialize(output),
            Body::HelloVerifyRequest(m) => m.serialize(output),
            Body::ServerHello(m) => m.serialize(output),
            Body::Certificate(m) => m.serialize(output),
            Body::ServerKeyExchange(m) => m.serialize(output),
            Body::ServerHelloDone => {}
            Body::ClientKeyExchange(m) => m.serialize(output),
            Body::Finished(m) => m.serialize(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: &[u8] = &[
        0x14, // Finished
        0x00, 0x00, 0x0C, // length 12
        0x00, 0x05, // message_seq
        0x00, 0x00, 0x04, // fragment_offset
        0x00, 0x00, 0x03, // fragment_length
        0xAA, 0xBB, 0xCC,
    ];

    #[test]
    fn fragment_roundtrip() {
        let (rest, hs) = Handshake::parse(FRAGMENT).unwrap();
        assert!(rest.is_empty());
        assert_eq!(hs.header.msg_type, MessageType::Finished);
        assert_eq!(hs.header.length, 12);
        assert_eq!(hs.header.message_seq, 5);
        assert!(hs.header.is_fragment());
        assert_eq!(hs.fragment, &[0xAA, 0xBB, 0xCC]);

        let mut out = Buf::new();
        hs.serialize(&mut out);
        assert_eq!(&*out, FRAGMENT);
    }

    #[test]
    fn fragment_beyond_length_is_rejected() {
        let mut bad = FRAGMENT.to_vec();
        bad[8] = 0x0B; // offset 11 + 3 > 12
        assert!(Handshake::parse(&bad).is_err());
    }

    #[test]
    fn body_with_trailing_bytes_is_rejected() {
        assert!(Body::parse(&[0x00], MessageType::ServerHelloDone).is_err());
        assert!(Body::parse(&[], MessageType::ServerHelloDone).is_ok());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Body::parse(&[], MessageType::Unknown).is_err());
    }
}
