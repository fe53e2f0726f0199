use std::array::from_fn;
use std::time::Instant;

use nom::bytes::complete::take;
use nom::number::complete::be_u32;
use nom::IResult;
use rand::rngs::OsRng;
use rand::Rng;

use crate::buffer::Buf;
use crate::time_tricks::InstantExt;

/// Hello random: 4 bytes of wall-clock seconds followed by 28 random bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Random {
    pub gmt_unix_time: u32,
    pub random_bytes: [u8; 28],
}

impl Random {
    pub fn new(now: Instant) -> Self {
        // Truncation is fine, it wraps in 2106.
        let gmt_unix_time = now.to_unix_secs() as u32;

        let mut rng = OsRng;

        Self {
            gmt_unix_time,
            random_bytes: from_fn(|_| rng.gen()),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Random> {
        let (input, gmt_unix_time) = be_u32(input)?;
        let (input, input_rand) = take(28_usize)(input)?;
        let mut random_bytes = [0u8; 28];
        random_bytes.copy_from_slice(input_rand);

        Ok((
            input,
            Random {
                gmt_unix_time,
                random_bytes,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.gmt_unix_time.to_be_bytes());
        output.extend_from_slice(&self.random_bytes);
    }

    /// The full 32 byte value used as key schedule salt.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..4].copy_from_slice(&self.gmt_unix_time.to_be_bytes());
        out[4..].copy_from_slice(&self.random_bytes);
        out
    }
}
