use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};

use crate::buffer::Buf;

/// Opaque key exchange message built and consumed by the cipher suite.
///
/// Used for both ServerKeyExchange and ClientKeyExchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange<'a> {
    pub public_key: &'a [u8],
}

impl<'a> KeyExchange<'a> {
    pub fn new(public_key: &'a [u8]) -> Self {
        KeyExchange { public_key }
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], KeyExchange<'a>> {
        let (input, len) = be_u8(input)?;
        if len == 0 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, public_key) = take(len as usize)(input)?;
        Ok((input, KeyExchange { public_key }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.public_key.len() as u8);
        output.extend_from_slice(self.public_key);
    }
}
