//! FLV tag body codec: translating between `av::Packet`/`av::CodecData` and
//! the audio/video tag bodies RTMP's A/V transport carries, where each
//! payload is a FLV tag body.
//!
//! Grounded in `format/rtmp/rtmp.go`'s calls into its `flv` package
//! (`PacketToTag`, `CodecDataToTag`, `TagToPacket`) — that package's own
//! source did not survive retrieval, so the header layout is authored
//! directly against the FLV tag format and [`tag`]'s doc comments, but the
//! call shape (codec data emitted once as a sequence-header tag, then one tag
//! per packet) mirrors `rtmp.go`'s `WriteHeader`/`WritePacket`/`ReadPacket`.

pub mod file;
pub mod tag;

use av::{ChannelLayout, CodecData, CodecType, Packet, SampleFormat};
use failure::{bail, Error};
use std::time::Duration;
use tag::{AacPacketType, AvcPacketType, FrameType};

/// Builds the sequence-header tag body for a track's codec data, or `None`
/// for a codec this crate's FLV support doesn't cover (mirrors `rtmp.go`'s
/// `CodecDataToTag` returning `ok=false` for codecs with no FLV mapping).
pub fn codec_data_to_tag_body(cd: &CodecData) -> Option<Vec<u8>> {
    match cd {
        CodecData::Video { codec: CodecType::H264, config, .. } => {
            Some(tag::write_video_tag(FrameType::Key, AvcPacketType::SeqHeader, 0, config))
        }
        CodecData::Audio { codec: CodecType::Aac, config, .. } => Some(tag::write_audio_tag(AacPacketType::SeqHeader, config)),
        _ => None,
    }
}

/// Builds the media tag body for one packet, given its track's codec data.
/// Packet payloads are already AVCC length-prefixed (video) or raw AAC
/// frames (audio), matching what an FLV NALU/raw tag body carries verbatim.
pub fn packet_to_tag_body(pkt: &Packet, cd: &CodecData) -> Result<Vec<u8>, Error> {
    match cd {
        CodecData::Video { codec: CodecType::H264, .. } => {
            let frame_type = if pkt.is_key_frame { FrameType::Key } else { FrameType::Inter };
            let ct_ms = pkt.composition_time.as_millis() as i32;
            Ok(tag::write_video_tag(frame_type, AvcPacketType::Nalu, ct_ms, &pkt.data))
        }
        CodecData::Audio { codec: CodecType::Aac, .. } => Ok(tag::write_audio_tag(AacPacketType::Raw, &pkt.data)),
        _ => bail!("packet_to_tag_body: unsupported codec {:?}", cd.codec_type()),
    }
}

/// Parses a track data tag body back into a packet, or `None` for a tag that
/// never becomes a packet on its own: a sequence header (already consumed as
/// codec data) or an AVC end-of-sequence marker.
pub fn tag_body_to_packet(is_video: bool, body: &[u8], idx: i8, time: Duration) -> Result<Option<Packet>, Error> {
    if is_video {
        let (hdr, payload) = tag::parse_video_tag(body)?;
        if hdr.packet_type != AvcPacketType::Nalu {
            return Ok(None);
        }
        Ok(Some(Packet {
            is_key_frame: hdr.frame_type == FrameType::Key,
            idx,
            composition_time: Duration::from_millis(hdr.composition_time_ms.max(0) as u64),
            time,
            duration: None,
            data: payload.to_vec(),
        }))
    } else {
        let (hdr, payload) = tag::parse_audio_tag(body)?;
        if hdr.packet_type != AacPacketType::Raw {
            return Ok(None);
        }
        Ok(Some(Packet { is_key_frame: true, idx, composition_time: Duration::ZERO, time, duration: None, data: payload.to_vec() }))
    }
}

/// Builds the `CodecData` for a track from its sequence-header tag body, or
/// `Ok(None)` if this isn't a sequence-header tag.
fn codec_data_from_seq_header(is_video: bool, body: &[u8]) -> Result<Option<CodecData>, Error> {
    if is_video {
        let (hdr, payload) = tag::parse_video_tag(body)?;
        if hdr.packet_type != AvcPacketType::SeqHeader {
            return Ok(None);
        }
        let (width, height) = codecs::h264::pixel_dimensions_from_avc_decoder_config(payload)?;
        Ok(Some(CodecData::Video { codec: CodecType::H264, width, height, config: payload.to_vec() }))
    } else {
        let (hdr, payload) = tag::parse_audio_tag(body)?;
        if hdr.packet_type != AacPacketType::SeqHeader {
            return Ok(None);
        }
        let asc = codecs::aac::AudioSpecificConfig::parse(payload)?;
        let channel_layout = match asc.channels {
            1 => ChannelLayout::mono(),
            2 => ChannelLayout::stereo(),
            n => bail!("AAC sequence header has unsupported channel count {}", n),
        };
        Ok(Some(CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: SampleFormat::S16,
            sample_rate: asc.sampling_frequency,
            channel_layout,
            config: payload.to_vec(),
            samples_per_packet: asc.frame_length,
        }))
    }
}

/// Collects incoming FLV tags until a `CodecData` is known for every track
/// type actually seen on the wire: it buffers tags until it has seen at
/// least one codec-data tag per track, then publishes `streams()` and begins
/// yielding packets.
#[derive(Default)]
pub struct Prober {
    saw_video: bool,
    saw_audio: bool,
    video: Option<CodecData>,
    audio: Option<CodecData>,
    packets: std::collections::VecDeque<Packet>,
}

impl Prober {
    pub fn new() -> Self {
        Self::default()
    }

    fn video_idx(&self) -> i8 {
        0
    }

    fn audio_idx(&self) -> i8 {
        if self.video.is_some() {
            1
        } else {
            0
        }
    }

    /// Feeds one incoming tag. Sequence-header tags update the known codec
    /// data; once probing is complete, media tags are queued as packets.
    pub fn push_tag(&mut self, is_video: bool, body: &[u8], time: Duration) -> Result<(), Error> {
        if is_video {
            self.saw_video = true;
        } else {
            self.saw_audio = true;
        }
        if let Some(cd) = codec_data_from_seq_header(is_video, body)? {
            if is_video {
                self.video = Some(cd);
            } else {
                self.audio = Some(cd);
            }
            return Ok(());
        }
        if self.probed() {
            let idx = if is_video { self.video_idx() } else { self.audio_idx() };
            if let Some(pkt) = tag_body_to_packet(is_video, body, idx, time)? {
                self.packets.push_back(pkt);
            }
        }
        Ok(())
    }

    /// True once every track type seen on the wire has a known codec data.
    pub fn probed(&self) -> bool {
        (!self.saw_video || self.video.is_some()) && (!self.saw_audio || self.audio.is_some())
    }

    /// The probed streams, video first (matching `video_idx`/`audio_idx`).
    pub fn streams(&self) -> Vec<CodecData> {
        let mut out = Vec::new();
        if let Some(v) = &self.video {
            out.push(v.clone());
        }
        if let Some(a) = &self.audio {
            out.push(a.clone());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn pop_packet(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avc_config() -> Vec<u8> {
        codecs::h264::from_sps_and_pps(
            b"\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10",
            b"\x68\xee\x3c\x80",
        )
        .unwrap()
        .avc_decoder_config
    }

    #[test]
    fn probes_video_and_audio_then_yields_packets_in_arrival_order() {
        let mut p = Prober::new();
        let vcfg = avc_config();
        let acfg = codecs::aac::AudioSpecificConfig::build_aac_lc(44_100, 2).unwrap();

        p.push_tag(true, &tag::write_video_tag(FrameType::Key, AvcPacketType::SeqHeader, 0, &vcfg), Duration::ZERO).unwrap();
        assert!(!p.probed()); // audio seq header not seen yet, but audio hasn't been seen on the wire either
        p.push_tag(false, &tag::write_audio_tag(AacPacketType::SeqHeader, &acfg), Duration::ZERO).unwrap();
        assert!(p.probed());

        let streams = p.streams();
        assert_eq!(streams.len(), 2);
        assert!(streams[0].is_video());
        assert!(streams[1].is_audio());

        p.push_tag(true, &tag::write_video_tag(FrameType::Key, AvcPacketType::Nalu, 10, b"NALU1"), Duration::from_millis(33)).unwrap();
        p.push_tag(false, &tag::write_audio_tag(AacPacketType::Raw, b"AAC1"), Duration::from_millis(40)).unwrap();

        let pkt1 = p.pop_packet().unwrap();
        assert_eq!(pkt1.idx, 0);
        assert_eq!(pkt1.data, b"NALU1");
        let pkt2 = p.pop_packet().unwrap();
        assert_eq!(pkt2.idx, 1);
        assert_eq!(pkt2.data, b"AAC1");
        assert!(p.is_empty());
    }

    #[test]
    fn video_only_stream_probes_without_audio() {
        let mut p = Prober::new();
        let vcfg = avc_config();
        p.push_tag(true, &tag::write_video_tag(FrameType::Key, AvcPacketType::SeqHeader, 0, &vcfg), Duration::ZERO).unwrap();
        assert!(p.probed());
        assert_eq!(p.streams().len(), 1);
    }

    #[test]
    fn codec_data_round_trips_through_tag_body() {
        let cd = CodecData::Video { codec: CodecType::H264, width: 1920, height: 1080, config: avc_config() };
        let body = codec_data_to_tag_body(&cd).unwrap();
        let (hdr, payload) = tag::parse_video_tag(&body).unwrap();
        assert_eq!(hdr.packet_type, AvcPacketType::SeqHeader);
        assert_eq!(payload, avc_config().as_slice());
    }
}
