//! Exp-Golomb bit reader, used by the `codecs` crate to parse H.264 SPS/PPS.
//!
//! Grounded in the original `GolombBitReader`: a byte-buffered MSB-first bit
//! reader plus the unsigned (`ue(v)`) and signed (`se(v)`) Exp-Golomb decode
//! rules from the H.264 spec's clause 9.1.

use failure::{bail, Error};

pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bits_left: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader { data, byte_pos: 0, bits_left: 0 }
    }

    pub fn read_bit(&mut self) -> Result<u32, Error> {
        if self.bits_left == 0 {
            if self.byte_pos >= self.data.len() {
                bail!("exp-golomb reader ran out of bits");
            }
            self.bits_left = 8;
            self.byte_pos += 1;
        }
        self.bits_left -= 1;
        let byte = self.data[self.byte_pos - 1];
        Ok(u32::from((byte >> self.bits_left) & 1))
    }

    pub fn read_bits(&mut self, n: u32) -> Result<u32, Error> {
        let mut res = 0u32;
        for _ in 0..n {
            res = (res << 1) | self.read_bit()?;
        }
        Ok(res)
    }

    /// ue(v): unsigned Exp-Golomb code.
    pub fn read_ue(&mut self) -> Result<u32, Error> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros >= 32 {
                break;
            }
        }
        let suffix = if zeros == 0 { 0 } else { self.read_bits(zeros)? };
        Ok((1u32 << zeros) - 1 + suffix)
    }

    /// se(v): signed Exp-Golomb code, mapping the unsigned code k to
    /// `(-1)^(k+1) * ceil(k/2)`.
    pub fn read_se(&mut self) -> Result<i32, Error> {
        let code = self.read_ue()?;
        Ok(if code % 2 == 1 {
            ((code + 1) / 2) as i32
        } else {
            -((code / 2) as i32)
        })
    }

    pub fn skip_bits(&mut self, n: u32) -> Result<(), Error> {
        for _ in 0..n {
            self.read_bit()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ue_known_values() {
        // 0 -> "1", 1 -> "010", 2 -> "011", 3 -> "00100"
        let mut r = BitReader::new(&[0b1010_0110]);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        let mut r2 = BitReader::new(&[0b0_0100_000]);
        assert_eq!(r2.read_ue().unwrap(), 3);
    }

    #[test]
    fn se_known_values() {
        // ue=0 -> se=0; ue=1 -> se=1; ue=2 -> se=-1; ue=3 -> se=2
        let mut r = BitReader::new(&[0b1_010_011]);
        assert_eq!(r.read_se().unwrap(), 0);
        assert_eq!(r.read_se().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), -1);
    }

    #[test]
    fn exhausted_reader_errors() {
        let mut r = BitReader::new(&[]);
        assert!(r.read_bit().is_err());
    }
}
