use std::fmt;
use std::ops::Deref;

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};

use crate::buffer::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidLength {
    name: &'static str,
    min: usize,
    max: usize,
    actual: usize,
}

impl std::error::Error for InvalidLength {}

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Incorrect {} length: {} <= {} <= {}",
            self.name, self.min, self.actual, self.max,
        )
    }
}

/// Opaque byte string with a u8 length prefix and bounded size.
macro_rules! var_array {
    ($name:ident, $min:expr, $max:expr) => {
        #[derive(Clone, Copy)]
        pub struct $name([u8; $max], usize);

        impl $name {
            pub fn try_new(data: &[u8]) -> Result<Self, InvalidLength> {
                #[allow(unused_comparisons)]
                if data.len() < $min || data.len() > $max {
                    return Err(InvalidLength {
                        name: stringify!($name),
                        min: $min,
                        max: $max,
                        actual: data.len(),
                    });
                }
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok($name(array, data.len()))
            }

            pub fn empty() -> Self {
                $name([0; $max], 0)
            }

            pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, len) = be_u8(input)?;
                let (rest, data) = take(len as usize)(input)?;
                let instance = Self::try_new(data)
                    .map_err(|_| Err::Failure(Error::new(input, ErrorKind::LengthValue)))?;
                Ok((rest, instance))
            }

            pub fn serialize(&self, output: &mut Buf) {
                output.push(self.1 as u8);
                output.extend_from_slice(&self.0[..self.1]);
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:02x?})", stringify!($name), &self.0[..self.1])
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.deref() == other.deref()
            }
        }

        impl Eq for $name {}

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0[..self.1]
            }
        }

        impl<'a> TryFrom<&'a [u8]> for $name {
            type Error = InvalidLength;

            fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
                Self::try_new(value)
            }
        }
    };
}

var_array!(LegacySessionId, 0, 32);
var_array!(Cookie, 0, 255);
