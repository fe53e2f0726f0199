use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};
use tinyvec::ArrayVec;

use super::{CompressionMethod, Cookie, LegacySessionId, ProtocolVersion, Random};
use crate::buffer::Buf;
use crate::crypto::CipherSuiteId;

pub type CipherSuiteVec = ArrayVec<[CipherSuiteId; 32]>;
pub type CompressionMethodVec = ArrayVec<[CompressionMethod; 8]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: LegacySessionId,
    pub cookie: Cookie,
    pub cipher_suites: CipherSuiteVec,
    pub compression_methods: CompressionMethodVec,
}

impl ClientHello {
    pub fn new(
        client_version: ProtocolVersion,
        random: Random,
        cookie: Cookie,
        suites: impl IntoIterator<Item = CipherSuiteId>,
    ) -> Self {
        let mut cipher_suites = CipherSuiteVec::new();
        for s in suites.into_iter().take(cipher_suites.capacity()) {
            cipher_suites.push(s);
        }

        let mut compression_methods = CompressionMethodVec::new();
        compression_methods.push(CompressionMethod::Null);

        ClientHello {
            client_version,
            random,
            session_id: LegacySessionId::empty(),
            cookie,
            cipher_suites,
            compression_methods,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = LegacySessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;

        let (input, suites_len) = be_u16(input)?;
        if suites_len % 2 != 0 || suites_len == 0 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, mut suites_data) = take(suites_len as usize)(input)?;
        let mut cipher_suites = CipherSuiteVec::new();
        while !suites_data.is_empty() {
            let (rest, id) = CipherSuiteId::parse(suites_data)?;
            suites_data = rest;
            // Offers beyond our capacity are ignored.
            if cipher_suites.len() < cipher_suites.capacity() {
                cipher_suites.push(id);
            }
        }

        let (input, methods_len) = be_u8(input)?;
        let (input, methods_data) = take(methods_len as usize)(input)?;
        let mut compression_methods = CompressionMethodVec::new();
        for b in methods_data.iter().take(compression_methods.capacity()) {
            compression_methods.push(CompressionMethod::from_u8(*b));
        }

        // Extensions are not used, but tolerated.
        let input = if input.is_empty() {
            input
        } else {
            let (input, ext_len) = be_u16(input)?;
            let (input, _) = take(ext_len as usize)(input)?;
            input
        };

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        self.cookie.serialize(output);

        output.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            output.extend_from_slice(&suite.0.to_be_bytes());
        }

        output.push(self.compression_methods.len() as u8);
        for method in &self.compression_methods {
            output.push(method.as_u8());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(cookie: &[u8]) -> ClientHello {
        let random = Random {
            gmt_unix_time: 0x01020304,
            random_bytes: [7; 28],
        };
        ClientHello::new(
            ProtocolVersion::DTLS1_2,
            random,
            Cookie::try_new(cookie).unwrap(),
            [CipherSuiteId(0xD001), CipherSuiteId(0xD002)],
        )
    }

    #[test]
    fn roundtrip() {
        let ch = hello(&[1, 2, 3]);
        let mut out = Buf::new();
        ch.serialize(&mut out);

        let (rest, parsed) = ClientHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ch);
    }

    #[test]
    fn tolerates_extensions() {
        let ch = hello(&[]);
        let mut out = Buf::new();
        ch.serialize(&mut out);
        out.extend_from_slice(&[0x00, 0x04, 0x00, 0x17, 0x00, 0x00]);

        let (rest, parsed) = ClientHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.cipher_suites.len(), 2);
    }

    #[test]
    fn odd_suite_length_is_rejected() {
        let ch = hello(&[]);
        let mut out = Buf::new();
        ch.serialize(&mut out);
        // version(2) + random(32) + sid(1) + cookie(1) = 36, suites len at 36..38
        out[37] = 3;
        assert!(ClientHello::parse(&out).is_err());
    }
}
