use nom::IResult;

use crate::buffer::Buf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished<'a> {
    pub verify_data: &'a [u8],
}

impl<'a> Finished<'a> {
    pub fn new(verify_data: &'a [u8]) -> Self {
        Finished { verify_data }
    }

    /// The verify data is the whole message body.
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Finished<'a>> {
        Ok((&input[input.len()..], Finished { verify_data: input }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(self.verify_data);
    }
}
