use nom::number::complete::be_u16;
use nom::IResult;

use super::{CompressionMethod, LegacySessionId, ProtocolVersion, Random};
use crate::buffer::Buf;
use crate::crypto::CipherSuiteId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: LegacySessionId,
    pub cipher_suite: CipherSuiteId,
    pub compression_method: CompressionMethod,
}

impl ServerHello {
    pub fn new(random: Random, cipher_suite: CipherSuiteId) -> Self {
        ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random,
            session_id: LegacySessionId::empty(),
            cipher_suite,
            compression_method: CompressionMethod::Null,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = LegacySessionId::parse(input)?;
        let (input, suite) = be_u16(input)?;
        let (input, compression_method) = CompressionMethod::parse(input)?;

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite: CipherSuiteId(suite),
                compression_method,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.extend_from_slice(&self.cipher_suite.0.to_be_bytes());
        output.push(self.compression_method.as_u8());
    }
}
