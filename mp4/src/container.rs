//! `moov` container tree: the boxes that wrap [`crate::boxes::SampleTable`] into a
//! full track/movie hierarchy, plus the top-level `ftyp`/`mdat`/`moov` file walk.
//!
//! Grounded in `mp4io.go`'s `Movie`/`Track`/`Media`/`MediaInfo` container structs.
//! As with the leaf boxes, these are plain structs rather than an `Atom` interface
//! hierarchy: every container here already knows its exact child shape.

use crate::atom::{self, fourcc, split_boxes, ParseError};
use crate::boxes::{
    write_data_information, write_sound_media_header, write_video_media_header, HandlerRef, MediaHeader,
    MovieHeader, SampleEntry, SampleTable, TrackHeader,
};
use bytes::{Bytes, BytesMut};

/// `minf`: media information. Only the `stbl` is kept live; `vmhd`/`smhd` are
/// re-derived from the track kind at marshal time and not round-tripped from
/// a parsed file (this crate never needs to preserve a foreign `minf`'s exact
/// quality/graphics-mode bytes, only its sample table).
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub is_video: bool,
    pub sample_table: SampleTable,
}

impl MediaInfo {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("minf"), |b| {
            if self.is_video {
                write_video_media_header(b);
            } else {
                write_sound_media_header(b);
            }
            write_data_information(b);
            self.sample_table.marshal(b);
        });
    }

    fn parse(buf: Bytes, offset: usize) -> Result<Self, ParseError> {
        let mut is_video = false;
        let mut sample_table = None;
        for (fourcc, body) in split_boxes(buf, offset)? {
            match &fourcc {
                b"vmhd" => is_video = true,
                b"stbl" => sample_table = Some(SampleTable::parse(body, offset)?),
                _ => {}
            }
        }
        Ok(MediaInfo {
            is_video,
            sample_table: sample_table.ok_or_else(|| ParseError::new("stbl_missing", offset))?,
        })
    }
}

/// `mdia`: `mdhd` + `hdlr` + `minf`.
#[derive(Debug, Clone)]
pub struct Media {
    pub header: MediaHeader,
    pub handler: HandlerRef,
    pub info: MediaInfo,
}

impl Media {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("mdia"), |b| {
            self.header.marshal(b);
            self.handler.marshal(b);
            self.info.marshal(b);
        });
    }

    fn parse(buf: Bytes, offset: usize) -> Result<Self, ParseError> {
        let mut header = None;
        let mut info = None;
        let mut is_video = false;
        for (fourcc, body) in split_boxes(buf, offset)? {
            match &fourcc {
                b"mdhd" => header = Some(MediaHeader::parse(&body, offset)?),
                b"hdlr" => is_video = body.len() >= 12 && &body[8..12] == b"vide",
                b"minf" => info = Some(MediaInfo::parse(body, offset)?),
                _ => {}
            }
        }
        let handler = if is_video { HandlerRef::video() } else { HandlerRef::sound() };
        Ok(Media {
            header: header.ok_or_else(|| ParseError::new("mdhd_missing", offset))?,
            handler,
            info: info.ok_or_else(|| ParseError::new("minf_missing", offset))?,
        })
    }
}

/// `trak`: one track. `tkhd` + `mdia`; `edts` and other optional children are
/// dropped (not needed to read or write a sample-accurate stream copy).
#[derive(Debug, Clone)]
pub struct Track {
    pub header: TrackHeader,
    pub media: Media,
}

impl Track {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("trak"), |b| {
            self.header.marshal(b);
            self.media.marshal(b);
        });
    }

    fn parse(buf: Bytes, offset: usize) -> Result<Self, ParseError> {
        let mut header = None;
        let mut media = None;
        for (fourcc, body) in split_boxes(buf, offset)? {
            match &fourcc {
                b"tkhd" => {
                    need_tkhd(&body, offset)?;
                    header = Some(parse_tkhd(&body));
                }
                b"mdia" => media = Some(Media::parse(body, offset)?),
                _ => {}
            }
        }
        Ok(Track {
            header: header.ok_or_else(|| ParseError::new("tkhd_missing", offset))?,
            media: media.ok_or_else(|| ParseError::new("mdia_missing", offset))?,
        })
    }

    pub fn is_video(&self) -> bool {
        self.media.info.is_video
    }
}

fn need_tkhd(buf: &[u8], offset: usize) -> Result<(), ParseError> {
    if buf.len() < 84 {
        return Err(ParseError::new("tkhd", offset));
    }
    Ok(())
}

fn parse_tkhd(buf: &[u8]) -> TrackHeader {
    let track_id = bits::u32be(&buf[12..16]);
    let duration = u64::from(bits::u32be(&buf[20..24]));
    let volume = bits::u16be(&buf[52..54]);
    let width = bits::u32be(&buf[76..80]) >> 16;
    let height = bits::u32be(&buf[80..84]) >> 16;
    TrackHeader { track_id, duration, volume, width, height }
}

/// `moov`: the movie box. Fragmentation (`mvex`) is out of scope: this crate
/// neither reads nor writes it.
#[derive(Debug, Clone)]
pub struct Movie {
    pub header: MovieHeader,
    pub tracks: Vec<Track>,
}

impl Movie {
    pub fn marshal(&self, buf: &mut BytesMut) {
        atom::write_box(buf, fourcc("moov"), |b| {
            self.header.marshal(b);
            for t in &self.tracks {
                t.marshal(b);
            }
        });
    }

    pub fn parse(buf: Bytes, offset: usize) -> Result<Self, ParseError> {
        let mut header = None;
        let mut tracks = Vec::new();
        for (fourcc, body) in split_boxes(buf, offset)? {
            match &fourcc {
                b"mvhd" => header = Some(MovieHeader::parse(&body, offset)?),
                b"trak" => tracks.push(Track::parse(body, offset)?),
                _ => {}
            }
        }
        Ok(Movie {
            header: header.ok_or_else(|| ParseError::new("mvhd_missing", offset))?,
            tracks,
        })
    }
}

/// One parsed top-level box as the file walker sees it: `moov` is fully
/// parsed, `mdat` is recorded as an opaque byte range (it can be many GB, so
/// it's never read fully into memory), everything else (`ftyp`, `free`, ...)
/// is kept as a [`atom::Dummy`] so a re-marshal could preserve it losslessly,
/// though this crate's writer never round-trips an input file, only builds
/// fresh ones.
pub enum TopLevelBox {
    Moov(Movie),
    Mdat { offset: u64, size: u64 },
    Other(atom::Dummy),
}

/// Walks a file's top-level boxes without reading `mdat` payloads into memory.
pub fn parse_top_level<R: std::io::Read + std::io::Seek>(r: &mut R) -> Result<Vec<TopLevelBox>, ParseError> {
    use std::io::SeekFrom;
    let mut out = Vec::new();
    let mut offset: u64 = 0;
    let mut header = [0u8; 8];
    loop {
        let n = read_fill(r, &mut header).map_err(|_| ParseError::new("top_level_header", offset as usize))?;
        if n == 0 {
            break;
        }
        if n != 8 {
            return Err(ParseError::new("top_level_header_short", offset as usize));
        }
        let (size, fourcc) = atom::read_header(&header, offset as usize)?;
        let size = u64::from(size);
        if size < 8 {
            return Err(ParseError::new("top_level_size", offset as usize));
        }
        let body_len = size - 8;
        match &fourcc {
            b"moov" => {
                let mut body = vec![0u8; body_len as usize];
                read_fill(r, &mut body).map_err(|_| ParseError::new("moov_body", offset as usize))?;
                let movie = Movie::parse(Bytes::from(body), (offset + 8) as usize)?;
                out.push(TopLevelBox::Moov(movie));
            }
            b"mdat" => {
                let mdat_offset = offset + 8;
                r.seek(SeekFrom::Start(offset + size)).map_err(|_| ParseError::new("mdat_seek", offset as usize))?;
                out.push(TopLevelBox::Mdat { offset: mdat_offset, size: body_len });
            }
            _ => {
                let mut body = vec![0u8; body_len as usize];
                read_fill(r, &mut body).map_err(|_| ParseError::new("top_level_body", offset as usize))?;
                out.push(TopLevelBox::Other(atom::Dummy { fourcc, data: Bytes::from(body) }));
            }
        }
        offset += size;
    }
    Ok(out)
}

fn read_fill<R: std::io::Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{Avc1SampleEntry, AvcConfig, ChunkOffset, SampleSize, SampleToChunk};

    fn sample_movie() -> Movie {
        let mut stbl = SampleTable {
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
        stbl.time_to_sample.push_duration(3000);
        Movie {
            header: MovieHeader { timescale: 10000, duration: 10000, next_track_id: 2 },
            tracks: vec![Track {
                header: TrackHeader { track_id: 1, duration: 90000, volume: 0x0100, width: 1920, height: 1080 },
                media: Media {
                    header: MediaHeader { timescale: 90000, duration: 90000 },
                    handler: HandlerRef::video(),
                    info: MediaInfo { is_video: true, sample_table: stbl },
                },
            }],
        }
    }

    #[test]
    fn movie_round_trips_through_marshal_and_parse() {
        let movie = sample_movie();
        let mut buf = BytesMut::new();
        movie.marshal(&mut buf);
        let (fourcc, body) = atom::read_header(&buf, 0).unwrap();
        assert_eq!(&fourcc, b"moov");
        let parsed = Movie::parse(body, 0).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        assert!(parsed.tracks[0].is_video());
        assert_eq!(parsed.tracks[0].header.track_id, 1);
        assert_eq!(parsed.tracks[0].media.info.sample_table.chunk_offset.offsets, vec![40]);
    }

    #[test]
    fn parse_top_level_separates_mdat_from_moov() {
        let movie = sample_movie();
        let mut moov_buf = BytesMut::new();
        movie.marshal(&mut moov_buf);

        let mut file = BytesMut::new();
        atom::write_box(&mut file, fourcc("mdat"), |b| b.put_slice(&[0xAAu8; 1000]));
        use bytes::BufMut;
        file.put_slice(&moov_buf);

        let mut cursor = std::io::Cursor::new(file.freeze().to_vec());
        let boxes = parse_top_level(&mut cursor).unwrap();
        assert_eq!(boxes.len(), 2);
        match &boxes[0] {
            TopLevelBox::Mdat { offset, size } => {
                assert_eq!(*offset, 8);
                assert_eq!(*size, 1000);
            }
            _ => panic!("expected mdat first"),
        }
        match &boxes[1] {
            TopLevelBox::Moov(m) => assert_eq!(m.tracks.len(), 1),
            _ => panic!("expected moov second"),
        }
    }
}
