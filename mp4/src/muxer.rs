//! Incremental `stbl` muxer: writes a placeholder `mdat` header first (no
//! `ftyp`), appends sample bytes as packets arrive, and finishes with a
//! `moov` built from the tables accumulated along the way.
//!
//! Grounded on `format/mp4/muxer.go`'s `Muxer.WritePacket`: `stco`/`stsz`
//! grow the moment a packet's bytes are written, but `stts`/`ctts`/`stss`
//! lag by exactly one packet because a sample's duration isn't known until
//! its successor's timestamp arrives (or the trailer flushes the last one
//! with duration zero).

use crate::boxes::{
    Avc1SampleEntry, AvcConfig, CompositionOffset, Esds, HandlerRef, MediaHeader, Mp4aSampleEntry,
    MovieHeader, SampleEntry, SampleTable, SampleToChunk, SyncSample, TrackHeader,
};
use crate::container::{Media, MediaInfo, Movie, Track};
use av::{CodecData, Packet};
use failure::{bail, Error};
use std::convert::TryFrom;
use std::io::{Seek, SeekFrom, Write};
use std::time::Duration;

/// One packet's worth of state not yet committed to `stts`/`ctts`/`stss`:
/// recorded when the packet arrives, flushed when the next packet (or the
/// trailer) reveals its duration.
struct Pending {
    time: Duration,
    composition_time: Duration,
    is_key_frame: bool,
}

struct MuxTrack {
    codec_data: CodecData,
    timescale: u32,
    table: SampleTable,
    pending: Option<Pending>,
    is_video: bool,
}

/// Writes a standard (non-fragmented) `.mp4`: one `mdat` holding every
/// track's interleaved samples, and a `moov` written only at
/// [`Muxer::write_trailer`] once every table is final.
pub struct Muxer<W> {
    writer: W,
    tracks: Vec<MuxTrack>,
    mdat_start: u64,
}

fn timescale_for(codec_data: &CodecData) -> u32 {
    match codec_data {
        CodecData::Video { .. } => 90_000,
        CodecData::Audio { sample_rate, .. } => *sample_rate,
    }
}

impl<W: Write + Seek> Muxer<W> {
    /// `mdat` is the first thing in the file — no `ftyp` precedes it, matching
    /// the original's `WriteHeader` (it writes the `mdat` tag straight away,
    /// never an `ftyp`). `ftyp` stays in `boxes.rs` purely for the demuxer
    /// side, which must consume one opaquely when reading a file that has one.
    pub fn new(mut writer: W) -> Result<Self, Error> {
        // Placeholder mdat header; size is patched in at write_trailer.
        let mdat_start = writer.stream_position()?;
        writer.write_all(&[0u8; 8])?;
        Ok(Muxer { writer, tracks: Vec::new(), mdat_start })
    }
}

impl<W: Write + Seek> av::Muxer for Muxer<W> {
    fn write_header(&mut self, streams: &[CodecData]) -> Result<(), Error> {
        if !self.tracks.is_empty() {
            bail!("write_header called twice");
        }
        for cd in streams {
            let is_video = cd.is_video();
            let timescale = timescale_for(cd);
            let sample_entry = sample_entry_for(cd)?;
            let table = SampleTable {
                sample_entry: Some(sample_entry),
                sample_to_chunk: SampleToChunk::one_sample_per_chunk(),
                ..Default::default()
            };
            self.tracks.push(MuxTrack { codec_data: cd.clone(), timescale, table, pending: None, is_video });
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), Error> {
        self.finish()
    }
}

/// Appends the trailing `ctts`/`stss` entries for a sample whose successor
/// has just arrived (or, at the trailer, for the last sample in the track).
fn flush_pending(table: &mut SampleTable, is_video: bool, timescale: u32, pending: &Pending) {
    if is_video {
        let ticks = u32::try_from(crate::nanos_to_ticks(pending.composition_time, timescale)).unwrap_or(u32::MAX);
        table.composition_offset.get_or_insert_with(CompositionOffset::default).push_offset(ticks);
        if pending.is_key_frame {
            let stss = table.sync_sample.get_or_insert_with(SyncSample::default);
            stss.sample_numbers.push(u32::try_from(table.sample_size.entries.len()).expect("too many samples"));
        }
    }
}

impl<W: Write + Seek> Muxer<W> {
    fn finish(&mut self) -> Result<(), Error> {
        for track in &mut self.tracks {
            if let Some(prev) = track.pending.take() {
                track.table.time_to_sample.push_duration(0);
                flush_pending(&mut track.table, track.is_video, track.timescale, &prev);
            }
        }

        let end = self.writer.stream_position()?;
        let mdat_size = end - self.mdat_start;
        self.writer.seek(SeekFrom::Start(self.mdat_start))?;
        let mut header = bytes::BytesMut::new();
        {
            use bytes::BufMut;
            header.put_u32(u32::try_from(mdat_size).map_err(|_| failure::format_err!("mdat over 4 GiB"))?);
            header.put_slice(b"mdat");
        }
        self.writer.write_all(&header)?;
        self.writer.seek(SeekFrom::Start(end))?;

        let longest_timescale_duration = self
            .tracks
            .iter()
            .map(|t| {
                let total_ticks: u64 = t.table.time_to_sample.entries.iter().map(|&(c, d)| u64::from(c) * u64::from(d)).sum();
                crate::ticks_to_nanos(total_ticks, t.timescale)
            })
            .max()
            .unwrap_or(Duration::ZERO);
        let movie_timescale = 10_000u32;
        let movie_duration = crate::nanos_to_ticks(longest_timescale_duration, movie_timescale);

        let tracks = self
            .tracks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let total_ticks: u64 = t.table.time_to_sample.entries.iter().map(|&(c, d)| u64::from(c) * u64::from(d)).sum();
                let (width, height) = (t.codec_data.width().unwrap_or(0), t.codec_data.height().unwrap_or(0));
                Track {
                    header: TrackHeader {
                        track_id: u32::try_from(i + 1).unwrap(),
                        duration: crate::nanos_to_ticks(crate::ticks_to_nanos(total_ticks, t.timescale), movie_timescale),
                        volume: if t.is_video { 0 } else { 0x0100 },
                        width,
                        height,
                    },
                    media: Media {
                        header: MediaHeader { timescale: t.timescale, duration: total_ticks },
                        handler: if t.is_video { HandlerRef::video() } else { HandlerRef::sound() },
                        info: MediaInfo { is_video: t.is_video, sample_table: t.table.clone() },
                    },
                }
            })
            .collect();

        let movie = Movie {
            header: MovieHeader {
                timescale: movie_timescale,
                duration: movie_duration,
                next_track_id: u32::try_from(self.tracks.len() + 1).unwrap(),
            },
            tracks,
        };
        let mut buf = bytes::BytesMut::new();
        movie.marshal(&mut buf);
        self.writer.write_all(&buf)?;
        Ok(())
    }
}

fn sample_entry_for(cd: &CodecData) -> Result<SampleEntry, Error> {
    match cd {
        CodecData::Video { codec: av::CodecType::H264, width, height, config } => {
            Ok(SampleEntry::Avc1(Avc1SampleEntry {
                width: u16::try_from(*width).map_err(|_| failure::format_err!("width too large for avc1"))?,
                height: u16::try_from(*height).map_err(|_| failure::format_err!("height too large for avc1"))?,
                avcc: AvcConfig(bytes::Bytes::copy_from_slice(config)),
            }))
        }
        CodecData::Video { codec, .. } => bail!("mp4 muxer doesn't support video codec {:?}", codec),
        CodecData::Audio { codec: av::CodecType::Aac, sample_rate, channel_layout, config, .. } => {
            Ok(SampleEntry::Mp4a(Mp4aSampleEntry {
                channel_count: u16::try_from(channel_layout.count()).unwrap_or(2),
                sample_size: 16,
                sample_rate: *sample_rate,
                esds: Esds { track_id: 1, decoder_specific_info: bytes::Bytes::copy_from_slice(config) },
            }))
        }
        CodecData::Audio { codec, .. } => bail!("mp4 muxer doesn't support audio codec {:?}", codec),
    }
}

impl<W: Write + Seek> av::PacketWriter for Muxer<W> {
    fn write_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        let idx = usize::try_from(pkt.idx).map_err(|_| failure::format_err!("negative stream index"))?;
        let offset = self.writer.stream_position()?;
        self.writer.write_all(&pkt.data)?;

        let track = self
            .tracks
            .get_mut(idx)
            .ok_or_else(|| failure::format_err!("write_packet: stream index {} out of range", idx))?;

        if let Some(prev) = track.pending.take() {
            if pkt.time < prev.time {
                bail!("packet time went backward: {:?} after {:?}", pkt.time, prev.time);
            }
            let delta_ticks = crate::nanos_to_ticks(pkt.time - prev.time, track.timescale);
            track.table.time_to_sample.push_duration(u32::try_from(delta_ticks).unwrap_or(u32::MAX));
            flush_pending(&mut track.table, track.is_video, track.timescale, &prev);
        }

        track.table.chunk_offset.offsets.push(
            u32::try_from(offset).map_err(|_| failure::format_err!("mp4 file over 4 GiB"))?,
        );
        track.table.sample_size.entries.push(u32::try_from(pkt.data.len()).expect("sample over 4 GiB"));

        track.pending = Some(Pending { time: pkt.time, composition_time: pkt.composition_time, is_key_frame: pkt.is_key_frame });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av::{ChannelLayout, CodecType, Muxer as _, PacketWriter as _, SampleFormat};
    use std::io::Cursor;

    fn video_stream() -> CodecData {
        CodecData::Video { codec: CodecType::H264, width: 320, height: 240, config: vec![1, 2, 3] }
    }

    #[test]
    fn write_header_then_packets_then_trailer_produces_valid_moov() {
        let mut buf = Cursor::new(Vec::new());
        let mut muxer = Muxer::new(&mut buf).unwrap();
        muxer.write_header(&[video_stream()]).unwrap();

        for i in 0..3u64 {
            let pkt = Packet {
                is_key_frame: i == 0,
                idx: 0,
                composition_time: Duration::ZERO,
                time: Duration::from_nanos(33_333_333 * i),
                duration: None,
                data: vec![b'A' + i as u8; 4],
            };
            muxer.write_packet(pkt).unwrap();
        }
        muxer.write_trailer().unwrap();

        let file = buf.into_inner();
        let mut demuxer = crate::demuxer::Demuxer::new(Cursor::new(file)).unwrap();
        use av::{Demuxer as _, PacketReader as _};
        let streams = demuxer.streams().unwrap();
        assert_eq!(streams.len(), 1);

        let p0 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(p0.data, b"AAAA");
        assert!(p0.is_key_frame);
        let p1 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(p1.data, b"BBBB");
        assert!(!p1.is_key_frame);
        let p2 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(p2.data, b"CCCC");
        assert!(demuxer.read_packet().unwrap().is_none());
    }

    #[test]
    fn negative_time_delta_is_rejected() {
        let mut buf = Cursor::new(Vec::new());
        let mut muxer = Muxer::new(&mut buf).unwrap();
        muxer.write_header(&[video_stream()]).unwrap();
        muxer.write_packet(Packet {
            is_key_frame: true,
            idx: 0,
            composition_time: Duration::ZERO,
            time: Duration::from_secs(5),
            duration: None,
            data: vec![1, 2, 3],
        }).unwrap();
        let err = muxer.write_packet(Packet {
            is_key_frame: false,
            idx: 0,
            composition_time: Duration::ZERO,
            time: Duration::from_secs(1),
            duration: None,
            data: vec![4, 5, 6],
        }).unwrap_err();
        assert!(err.to_string().contains("backward"));
    }

    #[allow(dead_code)]
    fn audio_stream() -> CodecData {
        CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: SampleFormat::S16,
            sample_rate: 44_100,
            channel_layout: ChannelLayout::stereo(),
            config: codecs::aac::AudioSpecificConfig::build_aac_lc(44_100, 2).unwrap(),
            samples_per_packet: 1024,
        }
    }
}
