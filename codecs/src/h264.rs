//! H.264 SPS/PPS parsing into pixel dimensions and an
//! AVCDecoderConfigurationRecord, used both by the RTSP depacketizer (to
//! detect in-band parameter changes) and the MP4 muxer (to fill `avc1`).
//!
//! Grounded in `rtsp/src/client/video/h264.rs`'s `Parameters::from_sps_and_pps`.

use failure::{bail, format_err, Error};
use h264_reader::nal::UnitType;
use std::convert::TryFrom;

/// Strips emulation-prevention bytes from a NAL unit (minus its header
/// byte), yielding the raw sequence of RBSP bytes. Uses `h264-reader`'s RBSP
/// decoder directly rather than hand-rolling the 00 00 03 escape rule.
pub fn decode_rbsp(encoded: &[u8]) -> Vec<u8> {
    struct NalRead(Vec<u8>);
    use h264_reader::nal::NalHandler;
    use h264_reader::Context;
    impl NalHandler for NalRead {
        type Ctx = ();
        fn start(&mut self, _ctx: &mut Context<Self::Ctx>, _header: h264_reader::nal::NalHeader) {}
        fn push(&mut self, _ctx: &mut Context<Self::Ctx>, buf: &[u8]) {
            self.0.extend_from_slice(buf)
        }
        fn end(&mut self, _ctx: &mut Context<Self::Ctx>) {}
    }
    let mut decoder = h264_reader::rbsp::RbspDecoder::new(NalRead(vec![]));
    let mut ctx = Context::new(());
    decoder.push(&mut ctx, encoded);
    decoder.into_handler().0
}

/// Codec parameters derived from one SPS/PPS pair: everything a container
/// writer or a `rfc6381_codec` string needs, plus the built
/// AVCDecoderConfigurationRecord.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub pixel_dimensions: (u32, u32),
    pub rfc6381_codec: String,
    pub pixel_aspect_ratio: Option<(u32, u32)>,
    pub frame_rate: Option<(u32, u32)>,
    pub avc_decoder_config: Vec<u8>,
}

/// Builds an AVCDecoderConfigurationRecord (ISO/IEC 14496-15 §5.2.4.1) from
/// one Annex-B-style SPS and PPS NAL (each including its 1-byte header).
/// `lengthSizeMinusOne` is hardcoded to 3, matching this toolkit's AVCC
/// 4-byte length prefixes everywhere else.
pub fn from_sps_and_pps(sps_nal: &[u8], pps_nal: &[u8]) -> Result<Parameters, Error> {
    if sps_nal.is_empty() || pps_nal.is_empty() {
        bail!("empty SPS or PPS NAL");
    }
    let sps_header = h264_reader::nal::NalHeader::new(sps_nal[0])
        .map_err(|_| format_err!("bad SPS NAL header 0x{:x}", sps_nal[0]))?;
    if sps_header.nal_unit_type() != UnitType::SeqParameterSet {
        bail!("expected SPS NAL, got unit type {:?}", sps_header.nal_unit_type());
    }
    let pps_header = h264_reader::nal::NalHeader::new(pps_nal[0])
        .map_err(|_| format_err!("bad PPS NAL header 0x{:x}", pps_nal[0]))?;
    if pps_header.nal_unit_type() != UnitType::PicParameterSet {
        bail!("expected PPS NAL, got unit type {:?}", pps_header.nal_unit_type());
    }

    let sps_rbsp = decode_rbsp(&sps_nal[1..]);
    if sps_rbsp.len() < 4 {
        bail!("SPS too short to hold profile/level bytes");
    }
    let rfc6381_codec = format!("avc1.{:02X}{:02X}{:02X}", sps_rbsp[0], sps_rbsp[1], sps_rbsp[2]);
    let sps = h264_reader::nal::sps::SeqParameterSet::from_bytes(&sps_rbsp)
        .map_err(|e| format_err!("bad SPS: {:?}", e))?;
    let pixel_dimensions = sps
        .pixel_dimensions()
        .map_err(|e| format_err!("SPS has invalid pixel dimensions: {:?}", e))?;

    let mut avc_decoder_config = Vec::with_capacity(11 + sps_nal.len() + pps_nal.len());
    avc_decoder_config.push(1); // configurationVersion
    avc_decoder_config.extend_from_slice(&sps_rbsp[0..=2]); // profile_idc, compat flags, level_idc
    avc_decoder_config.push(0xff); // reserved(6) + lengthSizeMinusOne(2) = 3
    avc_decoder_config.push(0xe1); // reserved(3) + numOfSequenceParameterSets(5) = 1
    avc_decoder_config.extend_from_slice(&u16::try_from(sps_nal.len())?.to_be_bytes());
    avc_decoder_config.extend_from_slice(sps_nal);
    avc_decoder_config.push(1); // numOfPictureParameterSets
    avc_decoder_config.extend_from_slice(&u16::try_from(pps_nal.len())?.to_be_bytes());
    avc_decoder_config.extend_from_slice(pps_nal);

    let (pixel_aspect_ratio, frame_rate) = match sps.vui_parameters {
        Some(ref vui) => (
            vui.aspect_ratio_info
                .as_ref()
                .and_then(|a| a.clone().get())
                .map(|(h, v)| (u32::from(h), u32::from(v))),
            vui.timing_info.as_ref().map(|t| (2 * t.num_units_in_tick, t.time_scale)),
        ),
        None => (None, None),
    };

    Ok(Parameters { pixel_dimensions, rfc6381_codec, pixel_aspect_ratio, frame_rate, avc_decoder_config })
}

/// Splits an AVCDecoderConfigurationRecord back into its (sps, pps) NAL
/// byte ranges, for callers (the MP4 demuxer's codec-data reconstruction,
/// tests) that only hold the finished config blob.
pub fn split_avc_decoder_config(config: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    if config.len() < 6 || config[0] != 1 {
        bail!("not an AVCDecoderConfigurationRecord");
    }
    let num_sps = config[5] & 0x1f;
    if num_sps != 1 {
        bail!("only a single SPS is supported, found {}", num_sps);
    }
    let sps_len = usize::from(bits::u16be(&config[6..8]));
    let sps_start = 8;
    let sps_end = sps_start + sps_len;
    if config.len() < sps_end + 3 {
        bail!("AVCDecoderConfigurationRecord truncated before PPS");
    }
    let num_pps = config[sps_end];
    if num_pps != 1 {
        bail!("only a single PPS is supported, found {}", num_pps);
    }
    let pps_len = usize::from(bits::u16be(&config[sps_end + 1..sps_end + 3]));
    let pps_start = sps_end + 3;
    let pps_end = pps_start + pps_len;
    if config.len() < pps_end {
        bail!("AVCDecoderConfigurationRecord truncated PPS");
    }
    Ok((&config[sps_start..sps_end], &config[pps_start..pps_end]))
}

/// Recovers pixel dimensions straight from an AVCDecoderConfigurationRecord,
/// for callers (the FLV prober) that only ever see the finished config blob
/// and never had the original SPS/PPS NALs separately.
pub fn pixel_dimensions_from_avc_decoder_config(config: &[u8]) -> Result<(u32, u32), Error> {
    let (sps_nal, _pps_nal) = split_avc_decoder_config(config)?;
    let sps_rbsp = decode_rbsp(&sps_nal[1..]);
    let sps = h264_reader::nal::sps::SeqParameterSet::from_bytes(&sps_rbsp)
        .map_err(|e| format_err!("bad SPS: {:?}", e))?;
    sps.pixel_dimensions().map_err(|e| format_err!("SPS has invalid pixel dimensions: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = b"\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10";
    const PPS: &[u8] = b"\x68\xee\x3c\x80";

    #[test]
    fn builds_avc_decoder_config_with_sane_dimensions() {
        let p = from_sps_and_pps(SPS, PPS).unwrap();
        assert_eq!(p.rfc6381_codec, "avc1.4D001E");
        assert!(p.pixel_dimensions.0 > 0 && p.pixel_dimensions.1 > 0);
        assert_eq!(p.avc_decoder_config[0], 1);
    }

    #[test]
    fn avc_decoder_config_round_trips_sps_pps() {
        let p = from_sps_and_pps(SPS, PPS).unwrap();
        let (sps, pps) = split_avc_decoder_config(&p.avc_decoder_config).unwrap();
        assert_eq!(sps, SPS);
        assert_eq!(pps, PPS);
    }

    #[test]
    fn rejects_swapped_sps_pps() {
        assert!(from_sps_and_pps(PPS, SPS).is_err());
    }

    #[test]
    fn recovers_dimensions_from_avc_decoder_config() {
        let p = from_sps_and_pps(SPS, PPS).unwrap();
        let (w, h) = pixel_dimensions_from_avc_decoder_config(&p.avc_decoder_config).unwrap();
        assert_eq!((w, h), p.pixel_dimensions);
    }
}
