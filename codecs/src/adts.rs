//! ADTS-AAC file format: concatenated ADTS frames, one AAC track per file.
//! `Demuxer`/`Muxer` wrap [`super::aac::AdtsHeader`]
//! in the same `av::Demuxer`/`av::Muxer` shape the `mp4` and `flv` crates use,
//! so a `.aac` file is just another source/sink in the packet pipeline.

use crate::aac::{AdtsHeader, AudioSpecificConfig, ADTS_HEADER_LEN};
use av::{ChannelLayout, CodecData, CodecType, Packet, SampleFormat};
use failure::{bail, Error};
use std::io::{Read, Write};
use std::time::Duration;

pub struct Demuxer<R> {
    reader: R,
    codec_data: Option<CodecData>,
    frames_emitted: u64,
    /// First frame's payload, read ahead by `streams()` to learn the codec
    /// parameters; drained by the first `read_packet` call instead of
    /// re-reading from `reader`.
    pending: Option<Vec<u8>>,
}

impl<R: Read> Demuxer<R> {
    pub fn new(reader: R) -> Self {
        Demuxer { reader, codec_data: None, frames_emitted: 0, pending: None }
    }

    fn codec_data_for(header: &AdtsHeader) -> Result<CodecData, Error> {
        let channel_layout = match header.channels {
            1 => ChannelLayout::mono(),
            2 => ChannelLayout::stereo(),
            n => bail!("ADTS stream has unsupported channel count {}", n),
        };
        Ok(CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: SampleFormat::S16,
            sample_rate: header.sample_rate,
            channel_layout,
            config: AudioSpecificConfig::build_aac_lc(header.sample_rate, header.channels)?,
            samples_per_packet: 1024,
        })
    }

    /// Packets are spaced evenly at the codec's declared samples-per-packet
    /// rate; `frames_emitted` is the running counter for that derivation.
    fn next_time(&mut self, sample_rate: u32, samples_per_packet: u32) -> Duration {
        let dur_per_packet = Duration::from_secs_f64(f64::from(samples_per_packet) / f64::from(sample_rate));
        let n = self.frames_emitted;
        self.frames_emitted += 1;
        dur_per_packet * n as u32
    }
}

impl<R: Read> av::PacketReader for Demuxer<R> {
    fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        if let Some(data) = self.pending.take() {
            let sample_rate = match self.codec_data.as_ref().unwrap() {
                CodecData::Audio { sample_rate, .. } => *sample_rate,
                CodecData::Video { .. } => unreachable!("ADTS streams are always audio"),
            };
            let time = self.next_time(sample_rate, 1024);
            return Ok(Some(Packet { is_key_frame: true, idx: 0, composition_time: Duration::ZERO, time, duration: None, data }));
        }

        let mut hdr_buf = [0u8; ADTS_HEADER_LEN];
        match self.reader.read_exact(&mut hdr_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = AdtsHeader::parse(&hdr_buf)?;
        if self.codec_data.is_none() {
            self.codec_data = Some(Self::codec_data_for(&header)?);
        }
        let payload_len = header.frame_length - ADTS_HEADER_LEN;
        let mut data = vec![0u8; payload_len];
        self.reader.read_exact(&mut data)?;
        let time = self.next_time(header.sample_rate, 1024);
        Ok(Some(Packet { is_key_frame: true, idx: 0, composition_time: Duration::ZERO, time, duration: None, data }))
    }
}

impl<R: Read> av::Demuxer for Demuxer<R> {
    fn streams(&mut self) -> Result<Vec<CodecData>, Error> {
        if self.codec_data.is_none() {
            // Read the first frame to learn sample rate/channels; its payload
            // is buffered in `pending` for the first `read_packet` call.
            let mut hdr_buf = [0u8; ADTS_HEADER_LEN];
            self.reader.read_exact(&mut hdr_buf)?;
            let header = AdtsHeader::parse(&hdr_buf)?;
            self.codec_data = Some(Self::codec_data_for(&header)?);
            let payload_len = header.frame_length - ADTS_HEADER_LEN;
            let mut payload = vec![0u8; payload_len];
            self.reader.read_exact(&mut payload)?;
            self.pending = Some(payload);
        }
        Ok(vec![self.codec_data.clone().unwrap()])
    }
}

/// Writes concatenated ADTS frames, one per `write_packet` call.
pub struct Muxer<W> {
    writer: W,
    sample_rate: u32,
    channels: u8,
}

impl<W: Write> Muxer<W> {
    pub fn new(writer: W) -> Self {
        Muxer { writer, sample_rate: 0, channels: 0 }
    }
}

impl<W: Write> av::Muxer for Muxer<W> {
    fn write_header(&mut self, streams: &[CodecData]) -> Result<(), Error> {
        let audio = streams
            .iter()
            .find(|cd| cd.is_audio())
            .ok_or_else(|| failure::format_err!("ADTS muxer requires an audio stream"))?;
        match audio {
            CodecData::Audio { codec: CodecType::Aac, sample_rate, channel_layout, .. } => {
                self.sample_rate = *sample_rate;
                self.channels = channel_layout.count() as u8;
                Ok(())
            }
            _ => bail!("ADTS muxer only supports AAC"),
        }
    }

    fn write_trailer(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<W: Write> av::PacketWriter for Muxer<W> {
    fn write_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        let header = AdtsHeader { sample_rate: self.sample_rate, channels: self.channels, frame_length: ADTS_HEADER_LEN + pkt.data.len() };
        let mut hdr_buf = [0u8; ADTS_HEADER_LEN];
        header.marshal(&mut hdr_buf)?;
        self.writer.write_all(&hdr_buf)?;
        self.writer.write_all(&pkt.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av::{Demuxer as _, Muxer as _, PacketReader as _, PacketWriter as _};

    fn one_frame(sample_rate: u32, channels: u8, payload: &[u8]) -> Vec<u8> {
        let header = AdtsHeader { sample_rate, channels, frame_length: ADTS_HEADER_LEN + payload.len() };
        let mut hdr_buf = [0u8; ADTS_HEADER_LEN];
        header.marshal(&mut hdr_buf).unwrap();
        let mut out = hdr_buf.to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn demuxes_two_concatenated_frames() {
        let mut bytes = one_frame(44_100, 2, b"frame0frame0");
        bytes.extend(one_frame(44_100, 2, b"frame1frame1"));
        let mut demuxer = Demuxer::new(&bytes[..]);

        let pkt0 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(pkt0.data, b"frame0frame0");
        let pkt1 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(pkt1.data, b"frame1frame1");
        assert!(pkt1.time > pkt0.time);
        assert!(demuxer.read_packet().unwrap().is_none());
    }

    #[test]
    fn muxer_writes_parseable_adts_frames() {
        let mut out = Vec::new();
        let mut muxer = Muxer::new(&mut out);
        let cd = CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: SampleFormat::S16,
            sample_rate: 44_100,
            channel_layout: ChannelLayout::stereo(),
            config: AudioSpecificConfig::build_aac_lc(44_100, 2).unwrap(),
            samples_per_packet: 1024,
        };
        muxer.write_header(&[cd]).unwrap();
        muxer
            .write_packet(Packet { is_key_frame: true, idx: 0, composition_time: Duration::ZERO, time: Duration::ZERO, duration: None, data: b"hello".to_vec() })
            .unwrap();
        muxer.write_trailer().unwrap();

        let header = AdtsHeader::parse(&out).unwrap();
        assert_eq!(header.sample_rate, 44_100);
        assert_eq!(header.channels, 2);
        assert_eq!(&out[ADTS_HEADER_LEN..], b"hello");
    }
}
