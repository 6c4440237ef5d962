//! AAC ADTS header parsing and MPEG-4 `AudioSpecificConfig` parsing/building.
//!
//! Grounded in `rtsp/src/client/audio/aac.rs`'s `AudioSpecificConfig::parse`
//! (ISO/IEC 14496-3 §1.6.2.1) for the AudioConfig side, and on the ADTS
//! header layout from ISO/IEC 13818-7 Annex B for the ADTS side (no ADTS
//! source survived retrieval for this toolkit, so the header layout below is
//! authored directly from the standard's well-known 7-byte/9-field shape).

use failure::{bail, Error};

/// MPEG-4 Audio Object Types this parser accepts: the ones that use
/// `GASpecificConfig` for their remaining bits (ISO/IEC 14496-3 §4.4.1).
const GA_SPECIFIC_CONFIG_OBJECT_TYPES: &[u8] = &[1, 2, 3, 4, 6, 7, 17, 19, 20, 21, 22, 23];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub frame_length: u32,
    pub sampling_frequency: u32,
    pub channels: u8,
}

impl AudioSpecificConfig {
    pub fn parse(config: &[u8]) -> Result<Self, Error> {
        let mut r = bitreader::BitReader::new(config);
        let audio_object_type = match r.read_u8(5)? {
            31 => 32 + r.read_u8(6)?,
            o => o,
        };

        let sampling_frequency = match r.read_u8(4)? {
            0x0 => 96_000,
            0x1 => 88_200,
            0x2 => 64_000,
            0x3 => 48_000,
            0x4 => 44_100,
            0x5 => 32_000,
            0x6 => 24_000,
            0x7 => 22_050,
            0x8 => 16_000,
            0x9 => 12_000,
            0xa => 11_025,
            0xb => 8_000,
            0xc => 7_350,
            v @ (0xd | 0xe) => bail!("reserved sampling_frequency_index value 0x{:x}", v),
            0xf => r.read_u32(24)?,
            _ => unreachable!(),
        };
        let channels = match r.read_u8(4)? {
            0 => bail!("interpreting AOT-dependent channel config unimplemented"),
            i @ 1..=7 => i,
            v @ 8..=15 => bail!("reserved channelConfiguration value 0x{:x}", v),
            _ => unreachable!(),
        };

        if audio_object_type == 5 || audio_object_type == 29 {
            if r.read_u8(4)? == 0xf {
                r.skip(24)?;
            }
            if r.read_u8(5)? == 22 {
                r.skip(4)?;
            }
        }

        if !GA_SPECIFIC_CONFIG_OBJECT_TYPES.contains(&audio_object_type) {
            bail!("unsupported audio_object_type {}", audio_object_type);
        }

        let frame_length = match (audio_object_type, r.read_bool()?) {
            (3, false) => 256,
            (3, true) => bail!("frame_length_flag must be false for AAC SSR"),
            (23, false) => 512,
            (23, true) => 480,
            (_, false) => 1024,
            (_, true) => 960,
        };

        Ok(AudioSpecificConfig { audio_object_type, frame_length, sampling_frequency, channels })
    }

    /// The sampling-frequency-index nibble for this config's rate, as used
    /// by both `AudioSpecificConfig` and ADTS headers.
    fn sampling_frequency_index(&self) -> Result<u8, Error> {
        Ok(match self.sampling_frequency {
            96_000 => 0x0,
            88_200 => 0x1,
            64_000 => 0x2,
            48_000 => 0x3,
            44_100 => 0x4,
            32_000 => 0x5,
            24_000 => 0x6,
            22_050 => 0x7,
            16_000 => 0x8,
            12_000 => 0x9,
            11_025 => 0xa,
            8_000 => 0xb,
            7_350 => 0xc,
            other => bail!("sample rate {} has no ADTS sampling_frequency_index", other),
        })
    }

    /// Builds a 2-byte `AudioSpecificConfig` for `audio_object_type` 2
    /// (AAC-LC), the overwhelmingly common case for MP4/FLV payloads this
    /// toolkit writes itself.
    pub fn build_aac_lc(sample_rate: u32, channels: u8) -> Result<Vec<u8>, Error> {
        let cfg = AudioSpecificConfig { audio_object_type: 2, frame_length: 1024, sampling_frequency: sample_rate, channels };
        let freq_idx = cfg.sampling_frequency_index()?;
        let b0 = (cfg.audio_object_type << 3) | (freq_idx >> 1);
        let b1 = (freq_idx << 7) | (channels << 3);
        Ok(vec![b0, b1])
    }
}

/// One parsed ADTS frame header (ISO/IEC 13818-7 Annex B). `frame_length`
/// includes the 7-byte header (9 if the CRC-present bit is unset... no: per
/// the standard, 7 bytes when `protection_absent` is set, 9 otherwise; only
/// the no-CRC 7-byte form is supported here since ADTS-in-MP4/RTMP sources
/// in the wild essentially always omit the CRC).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdtsHeader {
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_length: usize,
}

pub const ADTS_HEADER_LEN: usize = 7;

impl AdtsHeader {
    pub fn parse(b: &[u8]) -> Result<Self, Error> {
        if b.len() < ADTS_HEADER_LEN {
            bail!("ADTS header needs {} bytes, got {}", ADTS_HEADER_LEN, b.len());
        }
        if b[0] != 0xff || (b[1] & 0xf0) != 0xf0 {
            bail!("bad ADTS sync word {:02x}{:02x}", b[0], b[1]);
        }
        let protection_absent = (b[1] & 0x01) != 0;
        if !protection_absent {
            bail!("ADTS frames with CRC are not supported");
        }
        let freq_idx = (b[2] >> 2) & 0x0f;
        let sample_rate = match freq_idx {
            0x0 => 96_000,
            0x1 => 88_200,
            0x2 => 64_000,
            0x3 => 48_000,
            0x4 => 44_100,
            0x5 => 32_000,
            0x6 => 24_000,
            0x7 => 22_050,
            0x8 => 16_000,
            0x9 => 12_000,
            0xa => 11_025,
            0xb => 8_000,
            0xc => 7_350,
            v => bail!("reserved ADTS sampling_frequency_index 0x{:x}", v),
        };
        let channels = ((b[2] & 0x01) << 2) | ((b[3] >> 6) & 0x03);
        let frame_length = (usize::from(b[3] & 0x03) << 11) | (usize::from(b[4]) << 3) | usize::from(b[5] >> 5);
        if frame_length < ADTS_HEADER_LEN {
            bail!("ADTS frame_length {} shorter than header", frame_length);
        }
        Ok(AdtsHeader { sample_rate, channels, frame_length })
    }

    /// Writes a 7-byte no-CRC ADTS header for a frame whose total length
    /// (header + payload) is `frame_length`.
    pub fn marshal(&self, out: &mut [u8; ADTS_HEADER_LEN]) -> Result<(), Error> {
        let cfg = AudioSpecificConfig { audio_object_type: 2, frame_length: 1024, sampling_frequency: self.sample_rate, channels: self.channels };
        let freq_idx = cfg.sampling_frequency_index()?;
        out[0] = 0xff;
        out[1] = 0xf1; // MPEG-4, layer 0, no CRC
        out[2] = (0x01 << 6) | (freq_idx << 2) | (self.channels >> 2);
        out[3] = ((self.channels & 0x03) << 6) | ((self.frame_length >> 11) as u8 & 0x03);
        out[4] = ((self.frame_length >> 3) & 0xff) as u8;
        out[5] = (((self.frame_length & 0x07) << 5) as u8) | 0x1f;
        out[6] = 0xfc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aac_lc_stereo_44100() {
        let cfg = AudioSpecificConfig::build_aac_lc(44_100, 2).unwrap();
        let parsed = AudioSpecificConfig::parse(&cfg).unwrap();
        assert_eq!(parsed.audio_object_type, 2);
        assert_eq!(parsed.sampling_frequency, 44_100);
        assert_eq!(parsed.channels, 2);
        assert_eq!(parsed.frame_length, 1024);
    }

    #[test]
    fn adts_header_round_trips_rate_and_channels() {
        let h = AdtsHeader { sample_rate: 44_100, channels: 2, frame_length: 200 };
        let mut buf = [0u8; ADTS_HEADER_LEN];
        h.marshal(&mut buf).unwrap();
        let parsed = AdtsHeader::parse(&buf).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_non_aac_sync_word() {
        assert!(AdtsHeader::parse(&[0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
