use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u24;
use nom::{Err, IResult};
use tinyvec::ArrayVec;

use super::put_u24;
use crate::buffer::Buf;

/// Max number of identity entries we accept from a peer.
pub const MAX_CHAIN_LEN: usize = 8;

/// Identity chain as opaque entries.
///
/// The content is interpreted only by the credential collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Certificate<'a> {
    pub chain: ArrayVec<[&'a [u8]; MAX_CHAIN_LEN]>,
}

impl<'a> Certificate<'a> {
    pub fn new(entries: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut chain = ArrayVec::new();
        for e in entries.into_iter().take(MAX_CHAIN_LEN) {
            chain.push(e);
        }
        Certificate { chain }
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Certificate<'a>> {
        let (input, total) = be_u24(input)?;
        let (input, mut list) = take(total as usize)(input)?;

        let mut chain = ArrayVec::new();
        while !list.is_empty() {
            if chain.len() == MAX_CHAIN_LEN {
                return Err(Err::Failure(Error::new(list, ErrorKind::TooLarge)));
            }
            let (rest, len) = be_u24(list)?;
            let (rest, entry) = take(len as usize)(rest)?;
            chain.push(entry);
            list = rest;
        }

        Ok((input, Certificate { chain }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        let total: usize = self.chain.iter().map(|e| 3 + e.len()).sum();
        put_u24(output, total as u32);
        for entry in &self.chain {
            put_u24(output, entry.len() as u32);
            output.extend_from_slice(entry);
        }
    }
}
