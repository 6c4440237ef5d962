//! Typed MP4 boxes: headers, sample tables, and the handful of container
//! boxes needed to read or write a standard (non-fragmented) `.mp4`.
//!
//! Grounded on `mp4io.go`'s `MovieHeader`/`TrackHeader`/`HandlerRefer`/
//! `MediaHeader`/`SampleTable`/`AVC1Desc`/`MP4ADesc`/`TimeToSample`/
//! `CompositionOffset`/`SampleToChunk`/`SampleSize`/`SyncSample`/
//! `ChunkOffset` atoms: each keeps the same on-the-wire layout but drops the
//! `Atom` interface/`Children()` machinery in favor of plain structs, since
//! every caller here already knows which concrete box it's building or
//! reading (closed shape, same reasoning as `av::CodecData`).

use crate::atom::{self, fourcc, split_boxes, ParseError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::{TryFrom, TryInto};

fn need(buf: &[u8], n: usize, field: &'static str, offset: usize) -> Result<(), ParseError> {
    if buf.len() < n {
        return Err(ParseError::new(field, offset));
    }
    Ok(())
}

/// `mvhd`: movie-wide header. Only the fields the muxer/demuxer actually
/// consume (`timescale`, `duration`) are kept live; the rest are written
/// with fixed default values (identity matrix, no
/// preview/selection range).
#[derive(Debug, Clone)]
pub struct MovieHeader {
    pub timescale: u32,
    pub duration: u64,
    pub next_track_id: u32,
}

impl MovieHeader {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("mvhd"), |b| {
            b.put_u32(0); // version + flags
            b.put_u64(0); // creation_time, modification_time (32-bit each in v0; kept 0/0)
            b.put_u32(self.timescale);
            b.put_u32(u32::try_from(self.duration).unwrap_or(u32::MAX));
            b.put_u32(0x0001_0000); // preferred rate 1.0
            b.put_u16(0x0100); // preferred volume 1.0
            b.put_u16(0); // reserved
            b.put_u64(0); // reserved[2]
            for v in IDENTITY_MATRIX {
                b.put_i32(v);
            }
            for _ in 0..6 {
                b.put_u32(0); // pre_defined
            }
            b.put_u32(self.next_track_id);
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 32, "mvhd", offset)?;
        let version = buf[0];
        let (timescale, duration) = if version == 1 {
            need(buf, 4 + 16 + 4 + 8, "mvhd_v1", offset)?;
            let timescale = u32::from_be_bytes(buf[20..24].try_into().unwrap());
            let duration = u64::from_be_bytes(buf[24..32].try_into().unwrap());
            (timescale, duration)
        } else {
            let timescale = u32::from_be_bytes(buf[12..16].try_into().unwrap());
            let duration = u32::from_be_bytes(buf[16..20].try_into().unwrap()) as u64;
            (timescale, duration)
        };
        Ok(MovieHeader { timescale, duration, next_track_id: 2 })
    }
}

const IDENTITY_MATRIX: [i32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// `tkhd`: per-track header. `width`/`height` are 16.16 fixed point for
/// video tracks, zero for audio, matching ISO/IEC 14496-12 section 8.3.2.
#[derive(Debug, Clone)]
pub struct TrackHeader {
    pub track_id: u32,
    pub duration: u64,
    pub volume: u16,
    pub width: u32,
    pub height: u32,
}

impl TrackHeader {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("tkhd"), |b| {
            b.put_u32((1 << 24) | 0x7); // version 0, flags: enabled|in_movie|in_preview
            b.put_u64(0); // creation_time, modification_time
            b.put_u32(self.track_id);
            b.put_u32(0); // reserved
            b.put_u32(u32::try_from(self.duration).unwrap_or(u32::MAX));
            b.put_u64(0); // reserved[2]
            b.put_u16(0); // layer
            b.put_u16(0); // alternate_group
            b.put_u16(self.volume);
            b.put_u16(0); // reserved
            for v in IDENTITY_MATRIX {
                b.put_i32(v);
            }
            b.put_u32(self.width << 16);
            b.put_u32(self.height << 16);
        });
    }
}

/// `mdhd`: track media header. `language` is the packed ISO-639-2 code;
/// `0x55c4` is `und` (undetermined), a reasonable default when no language is tracked.
#[derive(Debug, Clone)]
pub struct MediaHeader {
    pub timescale: u32,
    pub duration: u64,
}

impl MediaHeader {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("mdhd"), |b| {
            b.put_u32(1 << 24); // version 1? keep v0 field widths below
            b.put_u64(0); // creation_time, modification_time
            b.put_u32(self.timescale);
            b.put_u32(u32::try_from(self.duration).unwrap_or(u32::MAX));
            b.put_u16(0x55c4); // language = und
            b.put_u16(0); // quality/pre_defined
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 20, "mdhd", offset)?;
        let timescale = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let duration = u32::from_be_bytes(buf[16..20].try_into().unwrap()) as u64;
        Ok(MediaHeader { timescale, duration })
    }
}

/// `hdlr`: declares the track's media type (`vide`/`soun`).
#[derive(Debug, Clone)]
pub struct HandlerRef {
    pub handler_type: [u8; 4],
    pub name: &'static str,
}

impl HandlerRef {
    pub fn video() -> Self {
        HandlerRef { handler_type: fourcc("vide"), name: "Video Media Handler" }
    }

    pub fn sound() -> Self {
        HandlerRef { handler_type: fourcc("soun"), name: "Sound Media Handler" }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("hdlr"), |b| {
            b.put_u32(0); // version + flags
            b.put_u32(0); // pre_defined (component type)
            b.put_slice(&self.handler_type);
            b.put_u64(0); // reserved[3]
            b.put_u32(0);
            b.put_slice(self.name.as_bytes());
            b.put_u8(0);
        });
    }
}

/// `dinf/dref/url `: the mandatory "data is in this file" reference chain.
pub fn write_data_information(buf: &mut BytesMut) {
    atom::write_box(buf, fourcc("dinf"), |b| {
        atom::write_box(b, fourcc("dref"), |b| {
            b.put_u32(0); // version + flags
            b.put_u32(1); // entry_count
            atom::write_box(b, fourcc("url "), |b| {
                b.put_u32(1); // version + flags: self-contained
            });
        });
    });
}

/// `vmhd`: video media header, always the fixed values ISO/IEC 14496-12
/// names as defaults (graphics mode 0, opcolor 0).
pub fn write_video_media_header(buf: &mut BytesMut) {
    atom::write_box(buf, fourcc("vmhd"), |b| {
        b.put_u32(1); // version + flags=1 (required by spec)
        b.put_u64(0); // graphicsmode + opcolor
    });
}

/// `smhd`: sound media header.
pub fn write_sound_media_header(buf: &mut BytesMut) {
    atom::write_box(buf, fourcc("smhd"), |b| {
        b.put_u32(0); // version + flags
        b.put_u32(0); // balance + reserved
    });
}

/// `avcC`: AVCDecoderConfigurationRecord, carried as the opaque blob
/// `codecs::h264` already built (ISO/IEC 14496-15 section 5.2.4.1).
#[derive(Debug, Clone)]
pub struct AvcConfig(pub Bytes);

impl AvcConfig {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("avcC"), |b| b.put_slice(&self.0));
    }
}

/// `avc1` sample entry: video `stsd` entry wrapping [`AvcConfig`].
#[derive(Debug, Clone)]
pub struct Avc1SampleEntry {
    pub width: u16,
    pub height: u16,
    pub avcc: AvcConfig,
}

impl Avc1SampleEntry {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("avc1"), |b| {
            b.put_u48(0); // reserved
            b.put_u16(1); // data_reference_index
            b.put_u16(0); // pre_defined
            b.put_u16(0); // reserved
            b.put_u32(0); // pre_defined[3]
            b.put_u32(0);
            b.put_u32(0);
            b.put_u16(self.width);
            b.put_u16(self.height);
            b.put_u32(0x0048_0000); // horizresolution 72 dpi
            b.put_u32(0x0048_0000); // vertresolution 72 dpi
            b.put_u32(0); // reserved
            b.put_u16(1); // frame_count
            b.put_bytes(0, 32); // compressorname (empty, pascal string padded)
            b.put_u16(0x0018); // depth = 24
            b.put_i16(-1); // pre_defined = -1
            self.avcc.marshal(b);
        });
    }
}

/// `esds`: MPEG-4 ElementaryStreamDescriptor nested-TLV box, grounded on
/// `rtsp/src/client/audio/aac.rs`'s `get_mp4a_box`/`write_box!`/
/// `write_descriptor!` macros and on `mp4io.go`'s `ElemStreamDesc`, which this
/// box's length-prefixed tag/length/value nesting (`MP4ESDescrTag`/
/// `MP4DecConfigDescrTag`/`MP4DecSpecificDescrTag`) mirrors byte for byte.
#[derive(Debug, Clone)]
pub struct Esds {
    pub track_id: u16,
    pub decoder_specific_info: Bytes,
}

fn write_descriptor(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let mut payload = BytesMut::new();
    body(&mut payload);
    buf.put_u8(tag);
    let len = payload.len();
    assert!(len < (1 << 28), "mp4 descriptor too large");
    for i in (1..4).rev() {
        buf.put_u8((((len >> (7 * i)) & 0x7f) as u8) | 0x80);
    }
    buf.put_u8((len & 0x7f) as u8);
    buf.put_slice(&payload);
}

impl Esds {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("esds"), |b| {
            b.put_u32(0); // version + flags
            write_descriptor(b, 0x03, |b| {
                b.put_u16(self.track_id);
                b.put_u8(0); // stream priority
                write_descriptor(b, 0x04, |b| {
                    b.put_u8(0x40); // object type indication: MPEG-4 Audio
                    b.put_u8(0x15); // stream type: audio, upstream=0, reserved=1
                    b.put_u24(0); // buffer size DB
                    b.put_u32(0); // max bitrate
                    b.put_u32(0); // avg bitrate
                    write_descriptor(b, 0x05, |b| b.put_slice(&self.decoder_specific_info));
                });
                write_descriptor(b, 0x06, |b| b.put_u8(0x02)); // SL config descriptor
            });
        });
    }
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_slice(&v.to_be_bytes()[1..]);
}

// `bytes::BufMut` has no `put_u24`; add the one call site needs.
trait BufMutExt {
    fn put_u24(&mut self, v: u32);
}
impl BufMutExt for BytesMut {
    fn put_u24(&mut self, v: u32) {
        put_u24(self, v)
    }
}

/// `mp4a` sample entry: audio `stsd` entry wrapping [`Esds`].
#[derive(Debug, Clone)]
pub struct Mp4aSampleEntry {
    pub channel_count: u16,
    pub sample_size: u16,
    pub sample_rate: u32,
    pub esds: Esds,
}

impl Mp4aSampleEntry {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("mp4a"), |b| {
            b.put_u48(0); // reserved
            b.put_u16(1); // data_reference_index
            b.put_u64(0); // reserved[2]
            b.put_u16(self.channel_count);
            b.put_u16(self.sample_size);
            b.put_u16(0); // pre_defined
            b.put_u16(0); // reserved
            b.put_u32(self.sample_rate << 16); // 16.16 fixed point
            self.esds.marshal(b);
        });
    }
}

/// `stsd`: one sample description entry per track (this crate never mixes
/// sample entries within a track).
#[derive(Debug, Clone)]
pub enum SampleEntry {
    Avc1(Avc1SampleEntry),
    Mp4a(Mp4aSampleEntry),
}

impl SampleEntry {
    pub fn marshal_stsd(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stsd"), |b| {
            b.put_u32(0); // version + flags
            b.put_u32(1); // entry_count
            match self {
                SampleEntry::Avc1(e) => e.marshal(b),
                SampleEntry::Mp4a(e) => e.marshal(b),
            }
        });
    }
}

/// `stts`: run-length (sample_count, duration) pairs. `push_duration`
/// coalesces a run, only appending a new entry when the duration differs
/// from the current run.
#[derive(Debug, Clone, Default)]
pub struct TimeToSample {
    pub entries: Vec<(u32, u32)>,
}

impl TimeToSample {
    pub fn push_duration(&mut self, duration: u32) {
        match self.entries.last_mut() {
            Some((count, d)) if *d == duration => *count += 1,
            _ => self.entries.push((1, duration)),
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stts"), |b| {
            b.put_u32(0);
            b.put_u32(u32::try_from(self.entries.len()).unwrap());
            for (count, duration) in &self.entries {
                b.put_u32(*count);
                b.put_u32(*duration);
            }
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 8, "stts_header", offset)?;
        let count = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        need(buf, 8 + count * 8, "stts_entries", offset)?;
        let mut entries = Vec::with_capacity(count);
        let mut p = &buf[8..];
        for _ in 0..count {
            entries.push((p.get_u32(), p.get_u32()));
        }
        Ok(TimeToSample { entries })
    }

    /// Expands the run-length entries into one duration per sample, the
    /// shape the demuxer's per-track cursor actually wants.
    pub fn expand(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for &(count, duration) in &self.entries {
            out.extend(std::iter::repeat(duration).take(count as usize));
        }
        out
    }
}

/// `ctts`: same run-length shape as `stts`, for composition-time offsets.
#[derive(Debug, Clone, Default)]
pub struct CompositionOffset {
    pub entries: Vec<(u32, u32)>,
}

impl CompositionOffset {
    pub fn push_offset(&mut self, offset: u32) {
        match self.entries.last_mut() {
            Some((count, o)) if *o == offset => *count += 1,
            _ => self.entries.push((1, offset)),
        }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("ctts"), |b| {
            b.put_u32(0);
            b.put_u32(u32::try_from(self.entries.len()).unwrap());
            for (count, offset) in &self.entries {
                b.put_u32(*count);
                b.put_u32(*offset);
            }
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 8, "ctts_header", offset)?;
        let count = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        need(buf, 8 + count * 8, "ctts_entries", offset)?;
        let mut entries = Vec::with_capacity(count);
        let mut p = &buf[8..];
        for _ in 0..count {
            entries.push((p.get_u32(), p.get_u32()));
        }
        Ok(CompositionOffset { entries })
    }

    pub fn expand(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for &(count, offset) in &self.entries {
            out.extend(std::iter::repeat(offset).take(count as usize));
        }
        out
    }
}

/// `stsc`: sample-to-chunk mapping. This crate's muxer always writes the
/// single entry `(first_chunk=1, samples_per_chunk=1, sample_desc_id=1)`
/// (one sample per chunk), but the demuxer parses
/// the general run-length form so it can read files other tools wrote.
#[derive(Debug, Clone, Default)]
pub struct SampleToChunk {
    pub entries: Vec<(u32, u32, u32)>,
}

impl SampleToChunk {
    pub fn one_sample_per_chunk() -> Self {
        SampleToChunk { entries: vec![(1, 1, 1)] }
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stsc"), |b| {
            b.put_u32(0);
            b.put_u32(u32::try_from(self.entries.len()).unwrap());
            for (first_chunk, samples_per_chunk, sample_desc_id) in &self.entries {
                b.put_u32(*first_chunk);
                b.put_u32(*samples_per_chunk);
                b.put_u32(*sample_desc_id);
            }
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 8, "stsc_header", offset)?;
        let count = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        need(buf, 8 + count * 12, "stsc_entries", offset)?;
        let mut entries = Vec::with_capacity(count);
        let mut p = &buf[8..];
        for _ in 0..count {
            entries.push((p.get_u32(), p.get_u32(), p.get_u32()));
        }
        Ok(SampleToChunk { entries })
    }

    /// Samples per chunk for the chunk at 0-based index `chunk_index`.
    pub fn samples_in_chunk(&self, chunk_index: u32) -> u32 {
        let chunk_number = chunk_index + 1;
        let mut samples_per_chunk = self.entries.first().map(|e| e.1).unwrap_or(0);
        for &(first_chunk, spc, _) in &self.entries {
            if first_chunk > chunk_number {
                break;
            }
            samples_per_chunk = spc;
        }
        samples_per_chunk
    }
}

/// `stsz`: per-sample byte sizes (or a single constant `sample_size` and no
/// entries, which this crate never writes but must be able to read).
#[derive(Debug, Clone, Default)]
pub struct SampleSize {
    pub constant_size: u32,
    pub entries: Vec<u32>,
}

impl SampleSize {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stsz"), |b| {
            b.put_u32(0);
            b.put_u32(self.constant_size);
            b.put_u32(u32::try_from(self.entries.len()).unwrap());
            if self.constant_size == 0 {
                for size in &self.entries {
                    b.put_u32(*size);
                }
            }
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 12, "stsz_header", offset)?;
        let constant_size = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let count = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        let entries = if constant_size == 0 {
            need(buf, 12 + count * 4, "stsz_entries", offset)?;
            let mut p = &buf[12..];
            (0..count).map(|_| p.get_u32()).collect()
        } else {
            Vec::new()
        };
        Ok(SampleSize { constant_size, entries })
    }

    pub fn size_of(&self, sample_index: usize) -> Option<u32> {
        if self.constant_size != 0 {
            Some(self.constant_size)
        } else {
            self.entries.get(sample_index).copied()
        }
    }

    pub fn sample_count(&self) -> usize {
        if self.constant_size != 0 {
            // Unknowable without an external sample count; callers with a
            // constant size track sample count via stts instead.
            0
        } else {
            self.entries.len()
        }
    }
}

/// `stss`: 1-indexed sync (random access) sample numbers. Absence means
/// every sample is a sync sample (audio tracks, and H.264 streams with no
/// `stss` at all).
#[derive(Debug, Clone, Default)]
pub struct SyncSample {
    pub sample_numbers: Vec<u32>,
}

impl SyncSample {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stss"), |b| {
            b.put_u32(0);
            b.put_u32(u32::try_from(self.sample_numbers.len()).unwrap());
            for n in &self.sample_numbers {
                b.put_u32(*n);
            }
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 8, "stss_header", offset)?;
        let count = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        need(buf, 8 + count * 4, "stss_entries", offset)?;
        let mut p = &buf[8..];
        let sample_numbers = (0..count).map(|_| p.get_u32()).collect();
        Ok(SyncSample { sample_numbers })
    }

    pub fn is_sync(&self, sample_index: usize) -> bool {
        self.sample_numbers.is_empty() || self.sample_numbers.binary_search(&(sample_index as u32 + 1)).is_ok()
    }
}

/// `stco`: 32-bit chunk byte offsets. Per the transformed design notes, this
/// crate never writes `co64` (64-bit offsets): every chunk this muxer
/// produces is one sample, and a `.mp4` needing `co64` is bigger than this
/// toolkit's target (live camera clips), so the limitation is accepted and
/// the demuxer errors out rather than silently truncating a `co64` file.
#[derive(Debug, Clone, Default)]
pub struct ChunkOffset {
    pub offsets: Vec<u32>,
}

impl ChunkOffset {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stco"), |b| {
            b.put_u32(0);
            b.put_u32(u32::try_from(self.offsets.len()).unwrap());
            for o in &self.offsets {
                b.put_u32(*o);
            }
        });
    }

    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        need(buf, 8, "stco_header", offset)?;
        let count = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        need(buf, 8 + count * 4, "stco_entries", offset)?;
        let mut p = &buf[8..];
        let offsets = (0..count).map(|_| p.get_u32()).collect();
        Ok(ChunkOffset { offsets })
    }
}

/// `stbl`: the sample table, assembled piece by piece by the muxer and
/// parsed piece by piece by the demuxer.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    pub sample_entry: Option<SampleEntry>,
    pub time_to_sample: TimeToSample,
    pub composition_offset: Option<CompositionOffset>,
    pub sample_to_chunk: SampleToChunk,
    pub sample_size: SampleSize,
    pub sync_sample: Option<SyncSample>,
    pub chunk_offset: ChunkOffset,
}

impl SampleTable {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("stbl"), |b| {
            atom::write_box(b, fourcc("stsd"), |b| {
                b.put_u32(0);
                b.put_u32(1);
                match self.sample_entry.as_ref().expect("sample table needs a sample entry") {
                    SampleEntry::Avc1(e) => e.marshal(b),
                    SampleEntry::Mp4a(e) => e.marshal(b),
                }
            });
            self.time_to_sample.marshal(b);
            if let Some(ctts) = &self.composition_offset {
                ctts.marshal(b);
            }
            if let Some(stss) = &self.sync_sample {
                stss.marshal(b);
            }
            self.sample_to_chunk.marshal(b);
            self.sample_size.marshal(b);
            self.chunk_offset.marshal(b);
        });
    }

    pub fn parse(buf: Bytes, offset: usize) -> Result<Self, ParseError> {
        let mut table = SampleTable::default();
        for (fourcc, body) in split_boxes(buf, offset)? {
            match &fourcc {
                b"stsd" => table.sample_entry = parse_sample_entry(&body, offset)?,
                b"stts" => table.time_to_sample = TimeToSample::parse(&body, offset)?,
                b"ctts" => table.composition_offset = Some(CompositionOffset::parse(&body, offset)?),
                b"stsc" => table.sample_to_chunk = SampleToChunk::parse(&body, offset)?,
                b"stsz" => table.sample_size = SampleSize::parse(&body, offset)?,
                b"stss" => table.sync_sample = Some(SyncSample::parse(&body, offset)?),
                b"stco" => table.chunk_offset = ChunkOffset::parse(&body, offset)?,
                b"co64" => return Err(ParseError::new("co64_unsupported", offset)),
                _ => {}
            }
        }
        Ok(table)
    }
}

fn parse_sample_entry(buf: &[u8], offset: usize) -> Result<Option<SampleEntry>, ParseError> {
    need(buf, 8, "stsd_header", offset)?;
    let entry_count = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if entry_count == 0 {
        return Ok(None);
    }
    let (fourcc, body) = atom::read_header(&buf[8..], offset)?;
    let _ = fourcc;
    let entry_body = &buf[16..];
    let inner_fourcc: [u8; 4] = buf[12..16].try_into().unwrap();
    match &inner_fourcc {
        b"avc1" => {
            need(entry_body, 78, "avc1", offset)?;
            let width = u16::from_be_bytes(entry_body[24..26].try_into().unwrap());
            let height = u16::from_be_bytes(entry_body[26..28].try_into().unwrap());
            let children = split_boxes(Bytes::copy_from_slice(&entry_body[78..]), offset)?;
            let avcc = children
                .into_iter()
                .find(|(f, _)| f == b"avcC")
                .map(|(_, b)| AvcConfig(b))
                .ok_or_else(|| ParseError::new("avcC_missing", offset))?;
            Ok(Some(SampleEntry::Avc1(Avc1SampleEntry { width, height, avcc })))
        }
        b"mp4a" => {
            need(entry_body, 28, "mp4a", offset)?;
            let channel_count = u16::from_be_bytes(entry_body[16..18].try_into().unwrap());
            let sample_size = u16::from_be_bytes(entry_body[18..20].try_into().unwrap());
            let sample_rate = u32::from_be_bytes(entry_body[24..28].try_into().unwrap()) >> 16;
            let children = split_boxes(Bytes::copy_from_slice(&entry_body[28..]), offset)?;
            let (_, esds_body) = children
                .into_iter()
                .find(|(f, _)| f == b"esds")
                .ok_or_else(|| ParseError::new("esds_missing", offset))?;
            let decoder_specific_info = parse_esds_decoder_specific_info(&esds_body, offset)?;
            Ok(Some(SampleEntry::Mp4a(Mp4aSampleEntry {
                channel_count,
                sample_size,
                sample_rate,
                esds: Esds { track_id: 0, decoder_specific_info },
            })))
        }
        _ => Ok(None),
    }
}

fn parse_descriptor_header(buf: &[u8], offset: usize) -> Result<(u8, usize, usize), ParseError> {
    need(buf, 1, "descriptor_tag", offset)?;
    let tag = buf[0];
    let mut n = 1;
    let mut length = 0usize;
    loop {
        need(buf, n + 1, "descriptor_len", offset)?;
        let c = buf[n];
        n += 1;
        length = (length << 7) | usize::from(c & 0x7f);
        if c & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, n, length))
}

/// Walks the `esds` TLV tree (`MP4ESDescrTag` -> `MP4DecConfigDescrTag` ->
/// `MP4DecSpecificDescrTag`) to pull out the raw AudioSpecificConfig bytes,
/// mirroring `mp4io.go`'s `ElemStreamDesc.parseDesc`.
fn parse_esds_decoder_specific_info(buf: &[u8], offset: usize) -> Result<Bytes, ParseError> {
    need(buf, 4, "esds_version", offset)?;
    let mut rest = &buf[4..];
    loop {
        let (tag, hdr_len, datalen) = parse_descriptor_header(rest, offset)?;
        need(rest, hdr_len + datalen, "descriptor_body", offset)?;
        let body = &rest[hdr_len..hdr_len + datalen];
        match tag {
            0x03 => {
                need(body, 3, "es_descr", offset)?;
                rest = &body[3..];
                continue;
            }
            0x04 => {
                need(body, 13, "dec_config_descr", offset)?;
                rest = &body[13..];
                continue;
            }
            0x05 => return Ok(Bytes::copy_from_slice(body)),
            _ => return Err(ParseError::new("decoder_specific_info_missing", offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_to_sample_coalesces_runs() {
        let mut stts = TimeToSample::default();
        for d in [3000, 3000, 3000, 3003, 3000] {
            stts.push_duration(d);
        }
        assert_eq!(stts.entries, vec![(3, 3000), (1, 3003), (1, 3000)]);
        assert_eq!(stts.expand(), vec![3000, 3000, 3000, 3003, 3000]);
    }

    #[test]
    fn sample_to_chunk_one_per_chunk_reports_one() {
        let stsc = SampleToChunk::one_sample_per_chunk();
        assert_eq!(stsc.samples_in_chunk(0), 1);
        assert_eq!(stsc.samples_in_chunk(41), 1);
    }

    #[test]
    fn sync_sample_empty_means_every_sample_syncs() {
        let stss = SyncSample::default();
        assert!(stss.is_sync(0));
        assert!(stss.is_sync(99));
        let stss = SyncSample { sample_numbers: vec![1, 30] };
        assert!(stss.is_sync(0));
        assert!(!stss.is_sync(1));
        assert!(stss.is_sync(29));
    }

    #[test]
    fn esds_round_trips_decoder_specific_info() {
        let asc = Bytes::from_static(&[0x12, 0x10]); // AAC-LC 44.1kHz stereo
        let esds = Esds { track_id: 1, decoder_specific_info: asc.clone() };
        let mut buf = BytesMut::new();
        esds.marshal(&mut buf);
        let (fourcc, body) = atom::read_header(&buf, 0).unwrap();
        assert_eq!(&fourcc, b"esds");
        let parsed = parse_esds_decoder_specific_info(&body, 0).unwrap();
        assert_eq!(parsed, asc);
    }

    #[test]
    fn sample_table_round_trips_avc1() {
        let mut table = SampleTable {
            sample_entry: Some(SampleEntry::Avc1(Avc1SampleEntry {
                width: 1920,
                height: 1080,
                avcc: AvcConfig(Bytes::from_static(&[1, 2, 3])),
            })),
            chunk_offset: ChunkOffset { offsets: vec![40] },
            sample_to_chunk: SampleToChunk::one_sample_per_chunk(),
            sample_size: SampleSize { constant_size: 0, entries: vec![1000] },
            ..Default::default()
        };
        table.time_to_sample.push_duration(3000);
        let mut buf = BytesMut::new();
        table.marshal(&mut buf);
        let (fourcc, body) = atom::read_header(&buf, 0).unwrap();
        assert_eq!(&fourcc, b"stbl");
        let parsed = SampleTable::parse(body, 0).unwrap();
        assert_eq!(parsed.chunk_offset.offsets, vec![40]);
        assert_eq!(parsed.sample_size.entries, vec![1000]);
        match parsed.sample_entry {
            Some(SampleEntry::Avc1(e)) => {
                assert_eq!(e.width, 1920);
                assert_eq!(&e.avcc.0[..], &[1, 2, 3]);
            }
            other => panic!("expected avc1, got {:?}", other),
        }
    }
}
