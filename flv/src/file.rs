//! `.flv` file container: the 9-byte file header, `PreviousTagSize`-delimited
//! tag stream, and per-tag 11-byte header (type, data size, timestamp with
//! its extended high byte, stream id) wrapped around the same audio/video
//! tag bodies [`crate::tag`] already parses for RTMP's A/V transport.
//!
//! The file framing itself isn't covered by any surviving source in this
//! pack (see `crate`'s module doc); it's the standard FLV v1 layout used
//! by every FLV muxer, authored directly from that well-known byte layout
//! rather than from a retrieved reference.

use crate::{codec_data_to_tag_body, packet_to_tag_body};
use av::{CodecData, Packet};
use failure::{bail, Error};
use std::io::{Read, Write};
use std::time::Duration;

const FLV_SIGNATURE: [u8; 3] = *b"FLV";
const TAG_TYPE_AUDIO: u8 = 8;
const TAG_TYPE_VIDEO: u8 = 9;

fn write_u24be(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

fn write_timestamp(out: &mut Vec<u8>, ms: u32) {
    // Lower 24 bits, then the extended high byte (FLV's odd timestamp layout).
    write_u24be(out, ms & 0x00ff_ffff);
    out.push((ms >> 24) as u8);
}

fn write_tag(out: &mut Vec<u8>, tag_type: u8, timestamp_ms: u32, body: &[u8]) {
    let start = out.len();
    out.push(tag_type);
    write_u24be(out, body.len() as u32);
    write_timestamp(out, timestamp_ms);
    write_u24be(out, 0); // StreamID, always 0.
    out.extend_from_slice(body);
    let tag_size = (out.len() - start) as u32;
    out.extend_from_slice(&tag_size.to_be_bytes());
}

/// Writes the standard FLV file header (no audio/video present-flags
/// tracked; both bits are set since this crate always writes whichever
/// tracks its `write_header` was given) plus the leading zero
/// `PreviousTagSize0`.
fn write_file_header(out: &mut Vec<u8>, has_video: bool, has_audio: bool) {
    out.extend_from_slice(&FLV_SIGNATURE);
    out.push(1); // version
    let flags = (if has_video { 1 } else { 0 }) | (if has_audio { 4 } else { 0 });
    out.push(flags);
    out.extend_from_slice(&9u32.to_be_bytes()); // header size, always 9
    out.extend_from_slice(&0u32.to_be_bytes()); // PreviousTagSize0
}

/// Writes a `.flv` file: header, sequence-header tags for each track, then
/// one tag per packet.
pub struct Muxer<W> {
    writer: W,
    streams: Vec<CodecData>,
    wrote_header: bool,
}

impl<W: Write> Muxer<W> {
    pub fn new(writer: W) -> Self {
        Muxer { writer, streams: Vec::new(), wrote_header: false }
    }
}

impl<W: Write> av::Muxer for Muxer<W> {
    fn write_header(&mut self, streams: &[CodecData]) -> Result<(), Error> {
        if self.wrote_header {
            bail!("flv: write_header called twice");
        }
        self.streams = streams.to_vec();
        let has_video = streams.iter().any(CodecData::is_video);
        let has_audio = streams.iter().any(CodecData::is_audio);
        let mut buf = Vec::new();
        write_file_header(&mut buf, has_video, has_audio);
        for cd in streams {
            if let Some(body) = codec_data_to_tag_body(cd) {
                let tag_type = if cd.is_video() { TAG_TYPE_VIDEO } else { TAG_TYPE_AUDIO };
                write_tag(&mut buf, tag_type, 0, &body);
            }
        }
        self.writer.write_all(&buf)?;
        self.wrote_header = true;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<W: Write> av::PacketWriter for Muxer<W> {
    fn write_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        let cd = self
            .streams
            .get(usize::from(pkt.idx.max(0) as u8))
            .ok_or_else(|| failure::format_err!("flv: packet references unknown stream index {}", pkt.idx))?;
        let body = packet_to_tag_body(&pkt, cd)?;
        let tag_type = if cd.is_video() { TAG_TYPE_VIDEO } else { TAG_TYPE_AUDIO };
        let mut buf = Vec::new();
        write_tag(&mut buf, tag_type, pkt.time.as_millis() as u32, &body);
        self.writer.write_all(&buf)?;
        Ok(())
    }
}

/// Reads a `.flv` file by driving [`crate::Prober`] over its tag stream.
pub struct Demuxer<R> {
    reader: R,
    prober: crate::Prober,
    started: bool,
}

impl<R: Read> Demuxer<R> {
    pub fn new(reader: R) -> Self {
        Demuxer { reader, prober: crate::Prober::new(), started: false }
    }

    fn read_file_header(&mut self) -> Result<(), Error> {
        let mut hdr = [0u8; 9];
        self.reader.read_exact(&mut hdr)?;
        if hdr[0..3] != FLV_SIGNATURE {
            bail!("flv: bad file signature");
        }
        let header_size = bits::u32be(&hdr[5..9]);
        // Skip to the declared header size (normally 9, so this is a no-op),
        // then the leading PreviousTagSize0.
        if header_size > 9 {
            let mut skip = vec![0u8; (header_size - 9) as usize];
            self.reader.read_exact(&mut skip)?;
        }
        let mut prev_tag_size = [0u8; 4];
        self.reader.read_exact(&mut prev_tag_size)?;
        self.started = true;
        Ok(())
    }

    /// Reads and feeds exactly one tag into the prober, returning `false` at EOF.
    fn pump_one(&mut self) -> Result<bool, Error> {
        if !self.started {
            self.read_file_header()?;
        }
        let mut tag_hdr = [0u8; 11];
        match self.reader.read_exact(&mut tag_hdr) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let tag_type = tag_hdr[0];
        let data_size = bits::u24be(&tag_hdr[1..4]) as usize;
        let ts_lo = bits::u24be(&tag_hdr[4..7]);
        let ts_hi = u32::from(tag_hdr[7]);
        let timestamp_ms = ts_lo | (ts_hi << 24);

        let mut body = vec![0u8; data_size];
        self.reader.read_exact(&mut body)?;
        let mut prev_tag_size = [0u8; 4];
        self.reader.read_exact(&mut prev_tag_size)?;

        match tag_type {
            TAG_TYPE_VIDEO => self.prober.push_tag(true, &body, Duration::from_millis(u64::from(timestamp_ms)))?,
            TAG_TYPE_AUDIO => self.prober.push_tag(false, &body, Duration::from_millis(u64::from(timestamp_ms)))?,
            _ => {} // script/metadata tags carry no packet data this crate needs.
        }
        Ok(true)
    }
}

impl<R: Read> av::PacketReader for Demuxer<R> {
    fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if let Some(pkt) = self.prober.pop_packet() {
                return Ok(Some(pkt));
            }
            if !self.pump_one()? {
                return Ok(None);
            }
        }
    }
}

impl<R: Read> av::Demuxer for Demuxer<R> {
    fn streams(&mut self) -> Result<Vec<CodecData>, Error> {
        while !self.prober.probed() {
            if !self.pump_one()? {
                break;
            }
        }
        Ok(self.prober.streams())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av::{ChannelLayout, CodecType, Demuxer as _, Muxer as _, PacketReader as _, PacketWriter as _, SampleFormat};

    fn video_cd() -> CodecData {
        let config = codecs::h264::from_sps_and_pps(
            b"\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10",
            b"\x68\xee\x3c\x80",
        )
        .unwrap()
        .avc_decoder_config;
        CodecData::Video { codec: CodecType::H264, width: 320, height: 240, config }
    }

    fn audio_cd() -> CodecData {
        CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: SampleFormat::S16,
            sample_rate: 44_100,
            channel_layout: ChannelLayout::stereo(),
            config: codecs::aac::AudioSpecificConfig::build_aac_lc(44_100, 2).unwrap(),
            samples_per_packet: 1024,
        }
    }

    #[test]
    fn round_trips_header_and_packets_through_a_file() {
        let mut buf = Vec::new();
        let mut muxer = Muxer::new(&mut buf);
        muxer.write_header(&[video_cd(), audio_cd()]).unwrap();
        muxer
            .write_packet(Packet { is_key_frame: true, idx: 0, composition_time: Duration::ZERO, time: Duration::ZERO, duration: None, data: b"NALU".to_vec() })
            .unwrap();
        muxer
            .write_packet(Packet { is_key_frame: true, idx: 1, composition_time: Duration::ZERO, time: Duration::from_millis(20), duration: None, data: b"AAC1".to_vec() })
            .unwrap();
        muxer.write_trailer().unwrap();

        let mut demuxer = Demuxer::new(&buf[..]);
        let streams = demuxer.streams().unwrap();
        assert_eq!(streams.len(), 2);
        assert!(streams[0].is_video());
        assert!(streams[1].is_audio());

        let p0 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(p0.data, b"NALU");
        assert!(p0.is_key_frame);
        let p1 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(p1.data, b"AAC1");
        assert_eq!(p1.time, Duration::from_millis(20));
        assert!(demuxer.read_packet().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut demuxer = Demuxer::new(&b"NOTF\0\0\0\0\0"[..]);
        assert!(demuxer.streams().is_err());
    }
}
