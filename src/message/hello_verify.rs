use nom::error::{Error, ErrorKind};
use nom::IResult;

use super::id::Cookie;
use super::ProtocolVersion;
use crate::buffer::Buf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    pub fn new(server_version: ProtocolVersion, cookie: Cookie) -> Self {
        HelloVerifyRequest {
            server_version,
            cookie,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;

        if cookie.is_empty() {
            return Err(nom::Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }

        Ok((
            input,
            HelloVerifyRequest {
                server_version,
                cookie,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.cookie.serialize(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &[u8] = &[
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        0x01, // Cookie length
        0xBB, // Cookie
    ];

    #[test]
    fn roundtrip() {
        let cookie = Cookie::try_new(&[0xBB]).unwrap();

        let hello_verify_request = HelloVerifyRequest::new(ProtocolVersion::DTLS1_2, cookie);

        let mut serialized = Buf::new();
        hello_verify_request.serialize(&mut serialized);
        assert_eq!(&*serialized, MESSAGE);

        let (rest, parsed) = HelloVerifyRequest::parse(&serialized).unwrap();
        assert_eq!(parsed, hello_verify_request);

        assert!(rest.is_empty());
    }

    #[test]
    fn empty_cookie() {
        let message: &[u8] = &[
            0xFE, 0xFD, // ProtocolVersion::DTLS1_2
            0x00, // Cookie length (0, which is empty)
        ];

        assert!(HelloVerifyRequest::parse(message).is_err());
    }

    #[test]
    fn cookie_length_exceeds_input() {
        let mut message = MESSAGE.to_vec();
        message[2] = 0xFF;

        assert!(HelloVerifyRequest::parse(&message).is_err());
    }
}
